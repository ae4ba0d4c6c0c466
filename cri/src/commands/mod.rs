//! CLI command definitions and dispatch.

mod exec;
mod validate;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use a3s_critest_core::CriTestConfig;

use crate::framework::Framework;
use crate::remote::{RemoteImageService, RemoteRuntimeService};

/// A3S CRI conformance harness.
#[derive(Parser)]
#[command(name = "critest", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every command. Set flags override the config file.
#[derive(Args)]
pub struct GlobalArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// CRI runtime endpoint (unix://, tcp:// or http://)
    #[arg(long, global = true)]
    pub runtime_endpoint: Option<String>,

    /// CRI image endpoint (defaults to the runtime endpoint)
    #[arg(long, global = true)]
    pub image_endpoint: Option<String>,
}

impl GlobalArgs {
    /// Load the config file (or defaults) and apply flag overrides.
    pub fn load_config(&self) -> a3s_critest_core::Result<CriTestConfig> {
        let mut config = match &self.config {
            Some(path) => CriTestConfig::from_file(path)?,
            None => CriTestConfig::default(),
        };
        if let Some(endpoint) = &self.runtime_endpoint {
            config.runtime_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &self.image_endpoint {
            config.image_endpoint = endpoint.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the container conformance scenarios
    Validate(validate::ValidateArgs),
    /// Execute a command in a running container
    Exec(exec::ExecArgs),
    /// Show the runtime version
    Version(version::VersionArgs),
}

/// Connect both CRI services described by `config`.
pub(crate) async fn connect_framework(
    config: CriTestConfig,
) -> Result<Framework, Box<dyn std::error::Error>> {
    let runtime =
        RemoteRuntimeService::connect(&config.runtime_endpoint, config.runtime_timeout()).await?;
    let images =
        RemoteImageService::connect(config.image_endpoint(), config.image_timeout()).await?;
    Ok(Framework::new(Arc::new(runtime), Arc::new(images), config))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(
    command: Command,
    config: CriTestConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Validate(args) => validate::execute(args, config).await,
        Command::Exec(args) => exec::execute(args, config).await,
        Command::Version(args) => version::execute(args, config).await,
    }
}
