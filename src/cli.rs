//! Command-line surface. Flag names are stable; the image entrypoint and
//! existing automation depend on them.

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Deploy interoperability packages inside a reserved deployment container.
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Deploy action forwarded to the container entrypoint
    #[arg(value_enum)]
    pub action: DeployCommand,

    /// Catalog package to deploy (repeatable)
    #[arg(short = 'n', long = "name", value_name = "PACKAGE")]
    pub names: Vec<String>,

    /// Custom package: local path, git remote, or HTTP archive URL (repeatable)
    #[arg(short = 'c', long = "custom-path", value_name = "PATH")]
    pub custom_paths: Vec<String>,

    /// Run the deployment in dev mode
    #[arg(long)]
    pub dev: bool,

    /// Deploy only the named packages, skipping their dependencies
    #[arg(long)]
    pub only: bool,

    /// Profile from the config file to apply
    #[arg(short = 'p', long = "profile", value_name = "NAME")]
    pub profile: Option<String>,

    /// Env file loaded into the container environment (repeatable, later wins)
    #[arg(long = "env-file", value_name = "FILE")]
    pub env_files: Vec<PathBuf>,

    /// Literal KEY=VALUE for the container environment (repeatable, wins ties)
    #[arg(short = 'e', long = "env-var", value_name = "KEY=VALUE")]
    pub env_vars: Vec<String>,

    /// Tag of the deployment image
    #[arg(long = "image-version", value_name = "TAG")]
    pub image_version: Option<String>,

    /// Deployment backend the in-container script drives
    #[arg(short = 't', long = "target-launcher", value_name = "LAUNCHER")]
    pub target_launcher: Option<String>,

    /// Config file (default ./stagehand.yaml, then the user config dir)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployCommand {
    Init,
    Up,
    Down,
    Destroy,
}

impl DeployCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployCommand::Init => "init",
            DeployCommand::Up => "up",
            DeployCommand::Down => "down",
            DeployCommand::Destroy => "destroy",
        }
    }
}

impl fmt::Display for DeployCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
