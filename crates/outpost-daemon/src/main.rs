//! Outpost daemon - serves outpost-core over JSON lines on stdin/stdout.
//!
//! Logs go to stderr; stdout carries protocol messages only. See
//! [`protocol`] for the wire format.

mod handlers;
mod protocol;
mod server;

use clap::Parser;
use outpost_core::{OutpostConfig, OutpostContext};
use std::path::PathBuf;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(author, version, about = "Drive remote hosts over a JSON-lines control channel")]
struct Cli {
    /// Configuration file (default: ~/.config/outpost/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(err) = run(cli).await {
        log::error!("{err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = match cli.config {
        Some(path) => path,
        None => OutpostConfig::default_path()?,
    };
    let config = OutpostConfig::load(&path)?;
    log::info!(
        "Loaded {} host(s) from {}",
        config.hosts.len(),
        path.display()
    );

    let ctx = OutpostContext::builder().config(config).build()?;
    ctx.start();

    let stdin = BufReader::new(tokio::io::stdin());
    let served = tokio::select! {
        result = server::serve(ctx.clone(), stdin, tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            Ok(())
        }
    };

    ctx.shutdown().await;
    served?;
    Ok(())
}
