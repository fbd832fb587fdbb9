//! Text decoder stack with per-layer KV caches.
//!
//! Each forward call consumes only the embeddings of newly appended tokens;
//! keys and values for earlier positions come out of the cache, so one decode
//! step costs O(new tokens) instead of O(total tokens). Caches are
//! preallocated to `max_text_tokens` and written by index rather than grown by
//! concatenation. Cross-attention keys/values are recomputed from the fixed
//! encoder hidden state every step and never cached.

use candle_core::{Device, Tensor};
use candle_nn::{kv_cache::KvCache, Embedding, Linear, Module};

use crate::{
    error::Result,
    nn::{causal_mask, FeedForward, LayerNorm, MultiHeadAttention},
    weights::{DecoderBlockWeights, WeightSet},
};

/// Cache growth dimension: sequence axis of `(batch, heads, seq, head_dim)`.
const CACHE_DIM: usize = 2;

struct DecoderBlock {
    self_attn: MultiHeadAttention,
    self_cache: KvCache,
    cross_attn: MultiHeadAttention,
    ln1: LayerNorm,
    ln2: LayerNorm,
    ln3: LayerNorm,
    mlp: FeedForward,
}

impl DecoderBlock {
    fn new(w: &DecoderBlockWeights, n_heads: usize, max_text_tokens: usize) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(&w.self_attn, n_heads)?,
            self_cache: KvCache::new(CACHE_DIM, max_text_tokens),
            cross_attn: MultiHeadAttention::new(&w.cross_attn, n_heads)?,
            ln1: LayerNorm::new(&w.ln1),
            ln2: LayerNorm::new(&w.ln2),
            ln3: LayerNorm::new(&w.ln3),
            mlp: FeedForward::new(&w.mlp),
        })
    }

    fn forward(&mut self, x: &Tensor, enc: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let residual = x.clone();
        let h = self.ln1.forward(x)?;
        let h = self
            .self_attn
            .forward(&h, &h, mask, Some(&mut self.self_cache))?;
        let x = (residual + h)?;

        let residual = x.clone();
        let h = self.ln2.forward(&x)?;
        let h = self.cross_attn.forward(&h, enc, None, None)?;
        let x = (residual + h)?;

        let residual = x.clone();
        let h = self.ln3.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((residual + h)?)
    }

    fn reset_cache(&mut self) {
        self.self_cache.reset();
    }
}

/// Whisper-style text decoder.
pub struct TextDecoder {
    embed_tokens: Embedding,
    pos_dec: Tensor,
    blocks: Vec<DecoderBlock>,
    ln_post: LayerNorm,
    output_proj: Linear,
    device: Device,
}

impl TextDecoder {
    pub fn new(weights: &WeightSet) -> Result<Self> {
        let config = &weights.config;
        let blocks = weights
            .dec_blocks
            .iter()
            .map(|w| DecoderBlock::new(w, config.n_heads, config.max_text_tokens))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: Embedding::new(weights.token_embedding.clone(), config.d_model),
            pos_dec: weights.pos_dec.clone(),
            blocks,
            ln_post: LayerNorm::new(&weights.dec_ln_post),
            // Resolved at load time: explicit projection or tied embedding.
            output_proj: Linear::new(weights.output_proj.clone(), None),
            device: weights.token_embedding.device().clone(),
        })
    }

    /// Run one decode step over the newly appended token ids `(1, new_len)`,
    /// extending every layer's KV cache. `offset` is the number of tokens
    /// already seen and must match the cache length. Returns vocabulary
    /// logits `(1, new_len, vocab_size)`.
    pub fn forward(&mut self, ids: &Tensor, enc: &Tensor, offset: usize) -> Result<Tensor> {
        debug_assert_eq!(offset, self.seen_tokens());
        let (_, seq_len) = ids.dims2()?;

        let x = self.embed_tokens.forward(ids)?;
        let pos = self.pos_dec.narrow(0, offset, seq_len)?.unsqueeze(0)?;
        let mut x = x.broadcast_add(&pos)?;

        // A single new token can only attend to itself and the past, so the
        // mask is only needed when several positions arrive at once.
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, &self.device)?)
        } else {
            None
        };

        for block in &mut self.blocks {
            x = block.forward(&x, enc, mask.as_ref())?;
        }

        let x = self.ln_post.forward(&x)?;
        Ok(self.output_proj.forward(&x)?)
    }

    /// Number of positions currently held in the KV caches.
    pub fn seen_tokens(&self) -> usize {
        self.blocks
            .first()
            .map_or(0, |b| b.self_cache.current_seq_len())
    }

    /// Drop all cached keys/values, ready for a fresh decode session.
    pub fn reset_cache(&mut self) {
        for block in &mut self.blocks {
            block.reset_cache();
        }
    }
}
