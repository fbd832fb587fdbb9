//! Model hyperparameters.

use serde::Deserialize;

use crate::error::{Result, WhisperError};

/// Hyperparameters for a Whisper-style encoder-decoder model.
///
/// The feed-forward hidden width is not stored; both stacks use the standard
/// `4 * d_model` expansion.
#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    /// Number of mel filterbank bins (default: 80)
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    /// Model width shared by encoder and decoder (default: 384)
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    /// Number of attention heads (default: 6)
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    /// Number of encoder blocks (default: 4)
    #[serde(default = "default_n_layers")]
    pub n_encoder_layers: usize,
    /// Number of decoder blocks (default: 4)
    #[serde(default = "default_n_layers")]
    pub n_decoder_layers: usize,
    /// Vocabulary size (default: 51865)
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Maximum encoder positions; excess mel frames are dropped (default: 1500)
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Maximum decoder positions, prompt included (default: 448)
    #[serde(default = "default_max_text_tokens")]
    pub max_text_tokens: usize,
}

fn default_n_mels() -> usize {
    80
}
fn default_d_model() -> usize {
    384
}
fn default_n_heads() -> usize {
    6
}
fn default_n_layers() -> usize {
    4
}
fn default_vocab_size() -> usize {
    51865
}
fn default_max_frames() -> usize {
    1500
}
fn default_max_text_tokens() -> usize {
    448
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            n_mels: default_n_mels(),
            d_model: default_d_model(),
            n_heads: default_n_heads(),
            n_encoder_layers: default_n_layers(),
            n_decoder_layers: default_n_layers(),
            vocab_size: default_vocab_size(),
            max_frames: default_max_frames(),
            max_text_tokens: default_max_text_tokens(),
        }
    }
}

impl WhisperConfig {
    /// Feed-forward hidden width for encoder and decoder blocks.
    pub fn ffn_dim(&self) -> usize {
        4 * self.d_model
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Validate invariants that must hold before any tensor is touched.
    ///
    /// The head count must evenly divide the model width; a configuration
    /// violating this can never match the per-head reshapes, so it is
    /// rejected at load time.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(WhisperError::ShapeMismatch(format!(
                "config: d_model {} not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WhisperConfig::default();
        assert_eq!(config.n_mels, 80);
        assert_eq!(config.d_model, 384);
        assert_eq!(config.ffn_dim(), 1536);
        assert_eq!(config.head_dim(), 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_uneven_heads() {
        let config = WhisperConfig {
            d_model: 100,
            n_heads: 7,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WhisperError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: WhisperConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_frames, 1500);
        assert_eq!(config.max_text_tokens, 448);
    }
}
