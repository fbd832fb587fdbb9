//! High-level async transcription API.
//!
//! Wraps the synchronous model behind a lazily initialized, mutex-guarded
//! session, mirroring how callers actually use transcription: configure once,
//! feed sample buffers as they arrive.

use std::{path::PathBuf, sync::Arc};

use candle_core::Device;
use tokio::sync::Mutex;

use crate::{
    error::{Result, WhisperError},
    model::{TranscribeResult, WhisperModel, DEFAULT_MAX_NEW_TOKENS},
    tokenizer::Tokenizer,
    weights::WeightSet,
};

/// Tokenizer file names inside a model directory.
const TOKENIZER_VOCAB: &str = "tokenizer.vocab.json";
const TOKENIZER_MERGES: &str = "tokenizer.merges.txt";

/// Configuration for the transcriber.
#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    /// Directory with `manifest.json`, tensor files, and vocabularies.
    pub model_dir: Option<PathBuf>,
    /// Whether to use GPU acceleration when the backend offers it.
    pub use_gpu: bool,
    /// Sample rate the caller records at (default: 16000).
    pub sample_rate: u32,
    /// Bound on generated tokens per utterance.
    pub max_new_tokens: usize,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            use_gpu: true,
            sample_rate: 16000,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl TranscriberConfig {
    /// Create config from environment variables.
    ///
    /// `SOTTO_MODEL_DIR` points at the model directory; `SOTTO_CPU=1` forces
    /// CPU execution.
    pub fn from_env() -> Self {
        let model_dir = std::env::var_os("SOTTO_MODEL_DIR").map(PathBuf::from);
        let use_gpu = std::env::var("SOTTO_CPU")
            .map(|v| v != "1" && v.to_lowercase() != "true")
            .unwrap_or(true);
        Self {
            model_dir,
            use_gpu,
            ..Default::default()
        }
    }
}

/// High-level transcriber.
///
/// Lazily loads the weight set on the first transcription request. The
/// tokenizer is optional: when its files are absent the session falls back to
/// degraded raw-vocabulary decoding instead of failing.
pub struct Transcriber {
    config: TranscriberConfig,
    model: Arc<Mutex<Option<WhisperModel>>>,
}

impl Transcriber {
    /// Create a new transcriber with default configuration.
    pub fn new() -> Self {
        Self::with_config(TranscriberConfig::default())
    }

    /// Create a new transcriber with custom configuration.
    pub fn with_config(config: TranscriberConfig) -> Self {
        Self {
            config,
            model: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a transcriber from environment variables.
    pub fn from_env() -> Self {
        Self::with_config(TranscriberConfig::from_env())
    }

    /// Ensure the model is loaded.
    async fn ensure_model(&self) -> Result<()> {
        let mut guard = self.model.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let dir = self
            .config
            .model_dir
            .clone()
            .ok_or(WhisperError::ModelUnavailable)?;
        if !dir.exists() {
            return Err(WhisperError::ModelUnavailable);
        }

        tracing::info!("loading model from {} (lazy initialization)", dir.display());
        let device = if self.config.use_gpu {
            Device::cuda_if_available(0)?
        } else {
            Device::Cpu
        };

        let weights = Arc::new(WeightSet::load(&dir, &device)?);
        let tokenizer = match Tokenizer::from_files(
            &dir.join(TOKENIZER_VOCAB),
            &dir.join(TOKENIZER_MERGES),
        ) {
            Ok(tokenizer) => Some(Arc::new(tokenizer)),
            Err(err) => {
                tracing::warn!("no tokenizer ({err}); falling back to raw vocabulary decoding");
                None
            }
        };

        *guard = Some(WhisperModel::new(
            weights,
            tokenizer,
            self.config.max_new_tokens,
        )?);
        tracing::info!("model loaded");
        Ok(())
    }

    /// Transcribe audio samples directly.
    ///
    /// Fails with `ModelUnavailable` when no model directory has been
    /// configured or prepared.
    pub async fn transcribe_samples(&self, samples: &[f32]) -> Result<TranscribeResult> {
        self.ensure_model().await?;
        let mut guard = self.model.lock().await;
        let model = guard.as_mut().ok_or(WhisperError::ModelUnavailable)?;
        model.transcribe(samples, self.config.sample_rate as f64)
    }

    /// Check if the model is loaded.
    pub async fn is_model_loaded(&self) -> bool {
        self.model.lock().await.is_some()
    }

    /// Preload the model (useful for reducing first-transcription latency).
    pub async fn preload(&self) -> Result<()> {
        self.ensure_model().await
    }

    /// Sample rate this transcriber expects from its caller.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

impl Default for Transcriber {
    fn default() -> Self {
        Self::new()
    }
}
