//! Audio encoder stack.
//!
//! Projects mel frames into model width, adds the learned positional
//! embedding, and runs the pre-norm self-attention blocks. The encoder output
//! is computed once per utterance and stays fixed for the whole decode.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};

use crate::{
    error::Result,
    mel::MelSpectrogram,
    nn::{FeedForward, LayerNorm, MultiHeadAttention},
    weights::{EncoderBlockWeights, WeightSet},
};

/// Pre-norm self-attention block followed by a pre-norm feed-forward.
struct EncoderBlock {
    attn: MultiHeadAttention,
    ln1: LayerNorm,
    ln2: LayerNorm,
    mlp: FeedForward,
}

impl EncoderBlock {
    fn new(w: &EncoderBlockWeights, n_heads: usize) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(&w.attn, n_heads)?,
            ln1: LayerNorm::new(&w.ln1),
            ln2: LayerNorm::new(&w.ln2),
            mlp: FeedForward::new(&w.mlp),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x.clone();
        let h = self.ln1.forward(x)?;
        let h = self.attn.forward(&h, &h, None, None)?;
        let x = (residual + h)?;

        let residual = x.clone();
        let h = self.ln2.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((residual + h)?)
    }
}

/// Whisper-style audio encoder.
pub struct AudioEncoder {
    mel_proj: Linear,
    pos_enc: Tensor,
    blocks: Vec<EncoderBlock>,
    ln_post: LayerNorm,
    n_mels: usize,
    d_model: usize,
    max_frames: usize,
    device: Device,
}

impl AudioEncoder {
    pub fn new(weights: &WeightSet) -> Result<Self> {
        let config = &weights.config;
        let blocks = weights
            .enc_blocks
            .iter()
            .map(|w| EncoderBlock::new(w, config.n_heads))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mel_proj: Linear::new(weights.mel_proj_w.clone(), Some(weights.mel_proj_b.clone())),
            pos_enc: weights.pos_enc.clone(),
            blocks,
            ln_post: LayerNorm::new(&weights.enc_ln_post),
            n_mels: config.n_mels,
            d_model: config.d_model,
            max_frames: config.max_frames,
            device: weights.mel_proj_w.device().clone(),
        })
    }

    /// Encode a mel spectrogram to `(1, frames, d_model)` hidden states.
    ///
    /// An empty spectrogram (silent or too-short clip) yields a single
    /// zero-filled hidden vector so downstream decoding stays well-defined.
    pub fn forward(&self, mel: &MelSpectrogram) -> Result<Tensor> {
        if mel.is_empty() {
            return Ok(Tensor::zeros(
                (1, 1, self.d_model),
                DType::F32,
                &self.device,
            )?);
        }

        let frames = mel.n_frames().min(self.max_frames);
        let x = Tensor::from_slice(
            &mel.data()[..frames * self.n_mels],
            (1, frames, self.n_mels),
            &self.device,
        )?;

        let x = self.mel_proj.forward(&x)?;
        let pos = self.pos_enc.narrow(0, 0, frames)?.unsqueeze(0)?;
        let mut x = x.broadcast_add(&pos)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.ln_post.forward(&x)
    }
}
