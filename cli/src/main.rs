//! Arbor CLI binary.
//!
//! Subcommands: `api` (start the HTTP server). Environment is loaded from
//! `.env` and `~/.config/arbor/config.toml` before anything reads it.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(about = "arbor — run multi-agent LLM workflows over HTTP")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API server (default 0.0.0.0:8000).
    Api {
        /// Listen address, e.g. 127.0.0.1:8000 (or set ARBOR_ADDR)
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    if let Err(e) = config::load_and_apply("arbor", None) {
        eprintln!("config load failed: {e}");
    }
    init_tracing();

    let args = Args::parse();
    match args.cmd {
        Command::Api { addr } => {
            if let Err(e) = serve::run_serve(addr.as_deref()).await {
                tracing::error!("server exited with error: {e}");
                std::process::exit(1);
            }
        }
    }
}
