use anyhow::{Context, Result};
use app::config::{Cli, Commands, Config};
use app::App;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::new(&cli).context("Failed to parse config")?;
    let app = App::new(config)?;

    match &cli.command {
        Commands::Send { bip21, amount } => {
            app.send_payjoin(bip21, *amount).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    let env_filter =
        EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();

    tracing_subscriber::fmt().with_target(true).with_level(true).with_env_filter(env_filter).init();
}
