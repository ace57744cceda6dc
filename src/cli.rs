use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config_file::ProvisionSettings;
use crate::substitution::Token;

/// Provision - recreate a container's directory tree and run its bootstrap script
#[derive(Parser, Debug)]
#[command(name = "provision")]
#[command(about = "Recreate a container's directory tree and run its platform bootstrap script")]
#[command(version)]
pub struct Cli {
    /// Container metadata file (JSON)
    pub container: Option<PathBuf>,

    /// Directory the tree is recreated under
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Value for UNAME
    #[arg(short, long, env = "PROVISION_USERNAME")]
    pub username: Option<String>,

    /// Value for PSSWD
    #[arg(short, long, env = "PROVISION_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Value for MNTPOINT (defaults to the root; a single letter is taken as a drive)
    #[arg(short, long)]
    pub mount_point: Option<String>,

    /// Substitute TOKEN with the empty string (UNAME, PSSWD or MNTPOINT)
    #[arg(long = "blank", value_name = "TOKEN")]
    pub blank: Vec<Token>,

    /// Script timeout in seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Interpreter program to run the script with
    #[arg(long, value_name = "PROGRAM")]
    pub interpreter: Option<String>,

    /// Host identity to select the script for (Linux, Darwin, Windows)
    #[arg(long, value_name = "IDENTITY")]
    pub host_os: Option<String>,

    /// Settings file; command-line values take precedence
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Reject containers with unnamed or unreachable directories
    #[arg(long)]
    pub strict: bool,

    /// Pass the password to the script through its environment
    #[arg(long)]
    pub secrets_via_env: bool,

    /// Show the directory tree and resolved script without changing anything.
    ///
    /// The password is masked in the printed script.
    #[arg(long)]
    pub dry_run: bool,

    /// Output format for the run summary
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Log debug detail to stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Merge the settings file (if any) with command-line values and validate.
    pub fn into_settings(self) -> Result<ProvisionSettings> {
        let mut settings = match &self.config {
            Some(path) => ProvisionSettings::load_from_file(path)?,
            None => ProvisionSettings::default(),
        };

        if let Some(container) = self.container {
            settings.container = container;
        }
        if let Some(root) = self.root {
            settings.root = root;
        }
        if self.username.is_some() {
            settings.username = self.username;
        }
        if self.password.is_some() {
            settings.password = self.password;
        }
        if self.mount_point.is_some() {
            settings.mount_point = self.mount_point;
        }
        for token in self.blank {
            if !settings.blank.contains(&token) {
                settings.blank.push(token);
            }
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_secs = timeout;
        }
        if self.interpreter.is_some() {
            settings.interpreter = self.interpreter;
        }
        if self.host_os.is_some() {
            settings.host_os = self.host_os;
        }
        settings.strict |= self.strict;
        settings.secrets_via_env |= self.secrets_via_env;

        settings.validate()?;
        Ok(settings)
    }
}
