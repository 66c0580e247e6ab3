use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use vmfabric::cli::{Cli, Commands};
use vmfabric::{commands, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only use colors when outputting to a TTY (not when piped to file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .init();

    let result = match Config::load(cli.config.as_deref()) {
        Ok(config) => match cli.cmd {
            Commands::Spawn(args) => commands::cmd_spawn(config, args).await,
        },
        Err(e) => Err(e.into()),
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
