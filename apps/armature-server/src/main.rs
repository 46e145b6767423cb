//! Armature host binary.
//!
//! Boots an [`armature::Application`] from layered configuration and drives
//! it until Ctrl+C / SIGTERM. Modules are linked in by embedders; this
//! binary ships the bare runtime with the secret provider published as a
//! service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use armature::config::paths;
use armature::{
    Application, EnvFeeder, FileFeeder, LayeredConfig, MapFeeder, ServiceHandle, ShutdownOptions,
};
use armature_secrets::{provider_from_env, SecretProvider};

/// Armature Server - modular application runtime host
#[derive(Parser)]
#[command(name = "armature-server")]
#[command(about = "Armature Server - modular application runtime host")]
#[command(version)]
struct Cli {
    /// Path to a configuration file fed to all module sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of a layered configuration tree (base/, environments/)
    #[arg(long)]
    config_root: Option<PathBuf>,

    /// Environment name for layered configuration (falls back to $ENV)
    #[arg(long)]
    environment: Option<String>,

    /// Tenant id for layered configuration
    #[arg(long)]
    tenant: Option<String>,

    /// Print the effective layered configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn layered(cli: &Cli) -> Option<LayeredConfig> {
    let root = cli.config_root.clone()?;
    let mut layered = LayeredConfig::new(root);
    if let Some(env) = &cli.environment {
        layered = layered.environment(env.clone());
    }
    if let Some(tenant) = &cli.tenant {
        layered = layered.tenant(tenant.clone());
    }
    Some(layered)
}

/// Feeder order is precedence order: layered tree first, then the config
/// file, then the environment on top.
fn build_application(cli: &Cli, layered: Option<serde_json::Value>) -> Result<Application> {
    let mut builder = Application::builder("armature-server");
    if let Some(merged) = layered {
        builder = builder.with_feeder(Arc::new(MapFeeder::new(paths::flatten(&merged))));
    }
    if let Some(config) = &cli.config {
        anyhow::ensure!(
            config.is_file(),
            "config file does not exist: {}",
            config.display()
        );
        builder = builder.with_feeder(Arc::new(FileFeeder::new(config.clone())));
    }
    builder = builder.with_feeder(Arc::new(EnvFeeder::new()));
    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let merged = match layered(&cli) {
        Some(layered) => {
            let merged = layered.load().context("layered configuration is invalid")?;
            if cli.print_config {
                println!("{}", serde_json::to_string_pretty(&merged)?);
                return Ok(());
            }
            Some(merged)
        }
        None => {
            anyhow::ensure!(!cli.print_config, "--print-config requires --config-root");
            None
        }
    };

    let app = build_application(&cli, merged)?;

    // Publish the secret provider so modules share one policy-checked store.
    let secrets: Arc<dyn SecretProvider> =
        provider_from_env().context("secret provider initialization failed")?;
    app.services()
        .register("secrets", ServiceHandle::new(secrets));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            tracing::info!("configuration OK");
            Ok(())
        }
        Commands::Run => {
            tracing::info!("Armature Server starting");
            app.run(ShutdownOptions::Signals).await?;
            tracing::info!("Armature Server stopped");
            Ok(())
        }
    }
}
