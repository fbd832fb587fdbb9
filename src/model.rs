//! Full transcription model: mel extraction, encoder, greedy cached decode.

use std::sync::Arc;

use candle_core::{IndexOp, Tensor};

use crate::{
    decoder::TextDecoder,
    encoder::AudioEncoder,
    error::Result,
    mel::MelExtractor,
    tokenizer::Tokenizer,
    weights::WeightSet,
};

/// Default bound on generated tokens per utterance.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 32;

/// Final transcription: text plus the full token sequence (prompt included).
#[derive(Debug, Clone)]
pub struct TranscribeResult {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// One transcription session's model state.
///
/// The weight set and tokenizer are shared, read-only; the decoder's KV
/// caches are owned here, so independent sessions need independent
/// `WhisperModel` values built over the same `Arc<WeightSet>`.
pub struct WhisperModel {
    weights: Arc<WeightSet>,
    mel_extractor: MelExtractor,
    encoder: AudioEncoder,
    decoder: TextDecoder,
    tokenizer: Option<Arc<Tokenizer>>,
    max_new_tokens: usize,
}

impl WhisperModel {
    pub fn new(
        weights: Arc<WeightSet>,
        tokenizer: Option<Arc<Tokenizer>>,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let config = &weights.config;
        let mel_extractor = MelExtractor::new(config.n_mels, config.max_frames);
        let encoder = AudioEncoder::new(&weights)?;
        let decoder = TextDecoder::new(&weights)?;
        Ok(Self {
            weights,
            mel_extractor,
            encoder,
            decoder,
            tokenizer,
            max_new_tokens,
        })
    }

    /// Transcribe audio samples recorded at `sample_rate`.
    pub fn transcribe(&mut self, samples: &[f32], sample_rate: f64) -> Result<TranscribeResult> {
        tracing::debug!(
            samples = samples.len(),
            duration_s = samples.len() as f64 / sample_rate,
            "starting transcription"
        );

        let mel = self.mel_extractor.extract(samples, sample_rate);
        tracing::debug!(frames = mel.n_frames(), mels = mel.n_mels(), "mel extracted");

        let encoder_hidden = self.encoder.forward(&mel)?;
        let prompt = self.prompt_tokens();
        let generated = self.generate(&encoder_hidden, &prompt, self.max_new_tokens)?;

        let mut tokens = prompt;
        tokens.extend_from_slice(&generated);
        let text = self.decode_text(&tokens);
        tracing::debug!(tokens = tokens.len(), "transcription finished");

        Ok(TranscribeResult { text, tokens })
    }

    /// Greedy decode against a fixed encoder hidden state.
    ///
    /// The first step feeds the whole prompt, every later step only the
    /// previously selected token. Selection is a plain argmax with ties
    /// broken toward the lowest id, so decoding is fully deterministic for a
    /// fixed weight set and prompt. Stops on the tokenizer's end-of-text id
    /// (excluded from the output), after `max_new` tokens, or when the
    /// decoder's position budget is exhausted.
    pub fn generate(
        &mut self,
        encoder_hidden: &Tensor,
        prompt: &[u32],
        max_new: usize,
    ) -> Result<Vec<u32>> {
        self.decoder.reset_cache();
        let device = encoder_hidden.device().clone();
        let max_positions = self.weights.config.max_text_tokens;
        let eot = self
            .tokenizer
            .as_ref()
            .and_then(|tokenizer| tokenizer.specials().eot);

        // Without a tokenizer there is no prompt to condition on; seed the
        // decoder with token id 0 so the loop still has a first input.
        let mut next_input: Vec<u32> = if prompt.is_empty() {
            vec![0]
        } else {
            prompt.to_vec()
        };

        let mut generated = Vec::new();
        let mut offset = 0;
        for step in 0..max_new {
            if offset + next_input.len() > max_positions {
                tracing::debug!(step, "position budget exhausted");
                break;
            }

            let ids = Tensor::from_vec(next_input.clone(), (1, next_input.len()), &device)?;
            let logits = self.decoder.forward(&ids, encoder_hidden, offset)?;
            offset += next_input.len();

            let last = logits.dim(1)? - 1;
            let row = logits.i((0, last, ..))?.to_vec1::<f32>()?;
            let next = argmax_lowest(&row);

            if eot == Some(next) {
                tracing::debug!(step, "end-of-text reached");
                break;
            }
            generated.push(next);
            next_input = vec![next];
        }

        Ok(generated)
    }

    /// Start-of-transcript prompt, as far as the tokenizer provides it.
    fn prompt_tokens(&self) -> Vec<u32> {
        let mut prompt = Vec::new();
        if let Some(tokenizer) = &self.tokenizer {
            let specials = tokenizer.specials();
            if let Some(sot) = specials.sot {
                prompt.push(sot);
            }
            if let Some(transcribe) = specials.transcribe {
                prompt.push(transcribe);
            }
        }
        prompt
    }

    /// Decode token ids to text.
    ///
    /// Without a tokenizer the degraded path maps ids straight through the
    /// weight set's raw vocabulary, joined by spaces, skipping out-of-range
    /// ids.
    fn decode_text(&self, tokens: &[u32]) -> String {
        match &self.tokenizer {
            Some(tokenizer) => tokenizer.decode(tokens),
            None => tokens
                .iter()
                .filter_map(|&id| self.weights.vocab.get(id as usize).map(String::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn config(&self) -> &crate::config::WhisperConfig {
        &self.weights.config
    }
}

/// Index of the maximum value; ties resolve to the lowest index.
fn argmax_lowest(values: &[f32]) -> u32 {
    let mut best = f32::NEG_INFINITY;
    let mut best_id = 0u32;
    for (id, &v) in values.iter().enumerate() {
        if v > best {
            best = v;
            best_id = id as u32;
        }
    }
    best_id
}
