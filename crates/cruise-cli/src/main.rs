//! Cruise CI CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;
mod simulate;

#[cfg(test)]
mod handlers_tests;

use commands::Commands;

#[derive(Parser)]
#[command(name = "cruise")]
#[command(author, version, about = "Cruise CI scheduling tools", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Tree { path, json } => handlers::tree(&path, json)?,
        Commands::Schema => handlers::schema()?,
        Commands::Simulate {
            path,
            requests,
            build_ms,
            fail,
            timeout_secs,
        } => handlers::simulate(&path, requests, build_ms, fail, timeout_secs).await?,
    }

    Ok(())
}
