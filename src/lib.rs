//! Offline speech-to-text with a Whisper-style encoder-decoder transformer.
//!
//! The pipeline: 16 kHz mono PCM samples are turned into a log-mel
//! spectrogram, encoded by an audio transformer, then decoded greedily into
//! token ids by a KV-cached causal text decoder and rendered to text with a
//! byte-pair-encoding tokenizer. Weights are loaded from a directory of raw
//! little-endian f32 tensor files described by a `manifest.json`.
//!
//! # Example
//!
//! ```no_run
//! use sotto::{Transcriber, TranscriberConfig};
//!
//! # async fn run() -> sotto::Result<()> {
//! let transcriber = Transcriber::with_config(TranscriberConfig {
//!     model_dir: Some("./models/whisper-tiny".into()),
//!     ..Default::default()
//! });
//!
//! let samples: Vec<f32> = vec![0.0; 16000]; // one second of silence
//! let result = transcriber.transcribe_samples(&samples).await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `cli`: the `sotto` command-line binary
//! - `cuda`: CUDA acceleration via candle
//! - `metal`: Metal acceleration via candle

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod mel;
pub mod model;
pub mod nn;
pub mod tokenizer;
pub mod transcriber;
pub mod weights;

pub use config::WhisperConfig;
pub use decoder::TextDecoder;
pub use encoder::AudioEncoder;
pub use error::{Result, WhisperError};
pub use mel::{MelExtractor, MelSpectrogram, HOP_LENGTH, N_FFT, SAMPLE_RATE};
pub use model::{TranscribeResult, WhisperModel};
pub use tokenizer::{SpecialTokens, Tokenizer};
pub use transcriber::{Transcriber, TranscriberConfig};
pub use weights::WeightSet;
