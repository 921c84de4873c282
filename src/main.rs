use anyhow::{Context, Result};
use clap::Parser;
use heapsift::{cli::Cli, config::SessionConfig, report, session::Session};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber; warnings always reach stderr
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = SessionConfig::from_toml(&args.config)?;
    let session = Session::from_config(&config)
        .with_context(|| format!("Failed to open session {}", args.config.display()))?;

    let output = report::render(&session, &args.command, args.format)?;
    print!("{}", output);
    Ok(())
}
