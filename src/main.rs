use anyhow::{Context, Result, bail};
use clap::Parser;
use dockhand::cli::{Args, Commands, ConfigDiscovery};
use dockhand::{Agent, AgentConfig, Event, InstanceSpec, NoProgress};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries events, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config =
        ConfigDiscovery::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Commands::Serve => serve(&config).await,
        Commands::Ping { no_instances } => ping(&config, !no_instances).await,
        Commands::Activate { file } => activate(&config, &file).await,
        Commands::Deactivate { name } => deactivate(&config, &name).await,
        Commands::Describe { name } => describe(&config, &name).await,
        Commands::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            println!();
            println!("Effective configuration:");
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: &AgentConfig) -> Result<()> {
    info!("Starting dockhand {}", env!("CARGO_PKG_VERSION"));
    let agent = Arc::new(Agent::from_config(config).await?);
    agent.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("Input closed, exiting");
    Ok(())
}

async fn ping(config: &AgentConfig, instances: bool) -> Result<()> {
    let agent = Agent::from_config(config).await?;
    let (tx, _rx) = mpsc::unbounded_channel();
    let ping = Event::new(
        "ping",
        json!({"options": {"resources": true, "instances": instances}}),
    );

    if let Some(pong) = agent.handle(&ping, tx).await {
        println!("{}", serde_json::to_string_pretty(&pong.data)?);
    }
    Ok(())
}

async fn activate(config: &AgentConfig, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let instance: InstanceSpec = serde_json::from_str(&content)
        .with_context(|| format!("Invalid instance in {}", file.display()))?;

    let agent = Agent::from_config(config).await?;
    let Some(compute) = agent.compute() else {
        bail!("Docker is disabled");
    };

    let id = compute.activate(&instance, agent.host(), &NoProgress).await?;
    println!("{}", id);
    Ok(())
}

async fn deactivate(config: &AgentConfig, name: &str) -> Result<()> {
    let agent = Agent::from_config(config).await?;
    let Some(compute) = agent.compute() else {
        bail!("Docker is disabled");
    };

    compute.deactivate(name, &NoProgress).await?;
    println!("{} stopped", name);
    Ok(())
}

async fn describe(config: &AgentConfig, name: &str) -> Result<()> {
    let agent = Agent::from_config(config).await?;
    let Some(compute) = agent.compute() else {
        bail!("Docker is disabled");
    };

    let snapshot = compute.describe(name).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot.to_update())?);
    Ok(())
}
