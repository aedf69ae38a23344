//! Streams a `streamGenerateContent` response and prints text as it arrives.
//!
//! Usage:
//! ```bash
//! GEMINI_API_KEY=... cargo run --example stream_generate -- "Why is the sky blue?"
//!
//! # Show retry decisions
//! RUST_LOG=gemini_transport_ox=debug cargo run --example stream_generate -- --preset aggressive "Hi"
//! ```

use std::{io::Write, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use gemini_transport_ox::{Gemini, RetryPolicy};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    None,
    Aggressive,
    Conservative,
}

impl From<Preset> for RetryPolicy {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Default => RetryPolicy::default(),
            Preset::None => RetryPolicy::no_retry(),
            Preset::Aggressive => RetryPolicy::aggressive(),
            Preset::Conservative => RetryPolicy::conservative(),
        }
    }
}

#[derive(Parser)]
#[command(name = "stream_generate")]
#[command(about = "Stream a Gemini response through the resilient transport")]
struct Args {
    /// Prompt sent as a single user turn
    prompt: String,

    #[arg(short, long, default_value = "gemini-2.0-flash")]
    model: String,

    #[arg(short, long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    /// Per-attempt deadline in seconds
    #[arg(short, long, default_value_t = 60)]
    timeout: u64,

    /// Issue a unary generateContent call instead of streaming
    #[arg(long)]
    unary: bool,
}

fn text_of(chunk: &Value) -> Option<&str> {
    chunk["candidates"][0]["content"]["parts"][0]["text"].as_str()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let gemini = Gemini::load_from_env()
        .context("GEMINI_API_KEY or GOOGLE_AI_API_KEY must be set")?
        .with_retry_policy(args.preset.into())
        .with_timeout(Duration::from_secs(args.timeout));

    let request = json!({"contents": [{"role": "user", "parts": [{"text": args.prompt}]}]});

    if args.unary {
        let response = gemini.generate_content(&args.model, &request).await?;
        println!("{}", text_of(&response).unwrap_or_default());
        return Ok(());
    }

    let mut stream = gemini.stream_generate_content(&args.model, &request);
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        if let Some(text) = text_of(&chunk?) {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
    }
    writeln!(stdout)?;

    Ok(())
}
