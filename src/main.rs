//! CLI tool for transcribing WAV files offline.
//!
//! Usage:
//!   sotto <input.wav> --model-dir ./models/whisper-tiny
//!
//! Examples:
//!   sotto recording.wav --model-dir ./models/whisper-tiny
//!   sotto recording.wav --model-dir ./models/whisper-tiny --output transcript.txt
//!   sotto recording.wav --model-dir ./models/whisper-tiny --cpu --print

use std::path::PathBuf;

use clap::Parser;
use sotto::{Transcriber, TranscriberConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transcribe 16-bit PCM WAV files offline
#[derive(Parser, Debug)]
#[command(name = "sotto")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input WAV file (16-bit PCM) to transcribe
    #[arg(required = true)]
    input: PathBuf,

    /// Directory with model weights (manifest.json, tensors, vocabularies)
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Sample rate of the input file
    #[arg(long, default_value_t = 16000)]
    sample_rate: u32,

    /// Output file for the transcript (default: stdout only)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Force CPU mode (disable GPU acceleration)
    #[arg(long)]
    cpu: bool,

    /// Print transcript to stdout in addition to the output file
    #[arg(short, long)]
    print: bool,
}

/// Read a standard 16-bit PCM WAV file into normalized f32 samples.
fn read_wav_samples(path: &PathBuf) -> Result<Vec<f32>, std::io::Error> {
    let data = std::fs::read(path)?;
    if data.len() < 44 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "file too short to be a WAV",
        ));
    }
    // Skip WAV header (44 bytes for standard PCM WAV)
    let samples = data[44..]
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect();
    Ok(samples)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sotto=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    if !args.input.exists() {
        eprintln!("Error: Input file not found: {}", args.input.display());
        std::process::exit(1);
    }

    let config = TranscriberConfig {
        model_dir: Some(args.model_dir.clone()),
        use_gpu: !args.cpu,
        sample_rate: args.sample_rate,
        ..Default::default()
    };

    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Model: {}", args.model_dir.display());
    tracing::info!(
        "Device: {}",
        if args.cpu {
            "CPU"
        } else {
            "GPU (if available)"
        }
    );

    let transcriber = Transcriber::with_config(config);

    tracing::info!("Loading model...");
    transcriber.preload().await?;

    tracing::info!("Transcribing...");
    let samples = read_wav_samples(&args.input)?;
    let result = transcriber.transcribe_samples(&samples).await?;

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &result.text).await?;
            tracing::info!("Transcript saved to {}", path.display());
            if args.print {
                println!("{}", result.text);
            }
        }
        None => println!("{}", result.text),
    }

    Ok(())
}
