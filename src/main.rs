//! llamalink - run a local model through the single-worker engine

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamalink::inference::{probe_gguf, BenchParams, InferenceEngine};
use llamalink::storage::settings::{load_settings, EngineSettings};

#[derive(Parser)]
#[command(name = "llamalink")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a completion for a prompt
    Generate {
        /// Path to a GGUF model
        model: PathBuf,

        /// Prompt text
        prompt: String,

        /// Upper bound on the token position (prompt included)
        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Measure prompt processing and generation throughput
    Bench {
        /// Path to a GGUF model
        model: PathBuf,

        /// Prompt tokens per batch
        #[arg(long, default_value = "512")]
        pp: u32,

        /// Generated tokens
        #[arg(long, default_value = "128")]
        tg: u32,

        /// Parallel sequences
        #[arg(long, default_value = "1")]
        pl: u32,

        /// Repetitions
        #[arg(long, default_value = "1")]
        reps: u32,
    },

    /// Print the GGUF header of a model file
    Info {
        /// Path to a GGUF model
        model: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llamalink=info")))
        .init();

    info!("Starting llamalink v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut settings = load_settings();

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            max_tokens,
        } => {
            if let Some(max_tokens) = max_tokens {
                settings.max_tokens = max_tokens;
                settings.validate();
            }
            let engine = build_engine(&settings)?;
            engine.load(&model).await?;

            let mut stdout = std::io::stdout();
            let mut stream = engine.generate(prompt);
            while let Some(chunk) = stream.next().await {
                stdout.write_all(chunk?.as_bytes())?;
                stdout.flush()?;
            }
            drop(stream);
            writeln!(stdout)?;

            engine.unload().await?;
        }
        Commands::Bench {
            model,
            pp,
            tg,
            pl,
            reps,
        } => {
            let engine = build_engine(&settings)?;
            engine.load(&model).await?;
            let report = engine
                .bench(BenchParams::new(pp, tg, pl).with_repetitions(reps))
                .await?;
            print!("{report}");
            engine.unload().await?;
        }
        Commands::Info { model } => {
            let header = probe_gguf(&model)?;
            println!("{}", model.display());
            println!("  GGUF version:   {}", header.version);
            println!("  tensors:        {}", header.tensor_count);
            println!("  metadata keys:  {}", header.metadata_kv_count);
        }
    }

    Ok(())
}

#[cfg(feature = "llama")]
fn build_engine(settings: &EngineSettings) -> Result<InferenceEngine, Box<dyn Error>> {
    use llamalink::inference::{LlamaCppEngine, LlamaSettings};

    let llama = LlamaSettings::from(settings);
    Ok(InferenceEngine::new(
        move || Ok(LlamaCppEngine::new(llama)),
        settings.into(),
    ))
}

#[cfg(not(feature = "llama"))]
fn build_engine(_settings: &EngineSettings) -> Result<InferenceEngine, Box<dyn Error>> {
    Err("llamalink was built without a native backend; rebuild with `--features llama`".into())
}
