mod cli;
mod config;
mod engine;
mod env;
mod error;
mod fetch;
mod orchestrator;
mod relay;
mod spec;

use anyhow::Result;
use clap::Parser;
use log::error;

use crate::cli::Cli;
use crate::config::Config;
use crate::engine::Engine;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    let spec = spec::resolve(&cli, &config, &config_path)?;

    // Printed before the first destructive call so a failed run's transcript
    // is self-diagnosing.
    print!("{}", spec.summary(&config.image));

    let orchestrator = Orchestrator::new(Engine::connect()?, &config);
    if let Err(e) = orchestrator.launch(&spec, &config).await {
        error!("launch failed: {e}");
        orchestrator.teardown().await;
        std::process::exit(1);
    }
    Ok(())
}
