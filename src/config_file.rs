//! Run settings that can be saved to and loaded from a JSON file.
//!
//! Every field can also be given on the command line, and the command line
//! wins. The password is accepted from a file but never written back out.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::DEFAULT_TIMEOUT;
use crate::substitution::Token;
use crate::tree::Strictness;

/// Settings for one provisioning run
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Container file to provision from
    pub container: PathBuf,
    /// Directory the tree is recreated under
    pub root: PathBuf,

    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Value for MNTPOINT; defaults to the root
    pub mount_point: Option<String>,
    /// Tokens to substitute with the empty string
    pub blank: Vec<Token>,

    pub timeout_secs: u64,
    /// Host identity override (`Linux`, `Darwin`, `Windows`)
    pub host_os: Option<String>,
    /// Interpreter program override
    pub interpreter: Option<String>,

    /// Reject containers with unnamed or unreachable branches
    pub strict: bool,
    /// Pass the password to the script through its environment
    pub secrets_via_env: bool,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            container: PathBuf::new(),
            root: PathBuf::new(),
            username: None,
            password: None,
            mount_point: None,
            blank: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            host_os: None,
            interpreter: None,
            strict: false,
            secrets_via_env: false,
        }
    }
}

impl fmt::Debug for ProvisionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionSettings")
            .field("container", &self.container)
            .field("root", &self.root)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mount_point", &self.mount_point)
            .field("blank", &self.blank)
            .field("timeout_secs", &self.timeout_secs)
            .field("host_os", &self.host_os)
            .field("interpreter", &self.interpreter)
            .field("strict", &self.strict)
            .field("secrets_via_env", &self.secrets_via_env)
            .finish()
    }
}

impl ProvisionSettings {
    pub fn new(container: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            root: root.into(),
            ..Self::default()
        }
    }

    /// Save settings to a JSON file (without the password)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize settings to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load settings from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;

        let settings: Self =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;

        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.container.as_os_str().is_empty() {
            anyhow::bail!("Container path must be specified");
        }
        if self.root.as_os_str().is_empty() {
            anyhow::bail!("Target root must be specified");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("Timeout must be at least one second");
        }
        if let Some(mount_point) = &self.mount_point {
            if mount_point.trim().is_empty() {
                anyhow::bail!("Mount point must not be empty when given");
            }
        }
        if let Some(interpreter) = &self.interpreter {
            if interpreter.trim().is_empty() {
                anyhow::bail!("Interpreter must not be empty when given");
            }
        }
        if self.username.is_some() && self.blank.contains(&Token::Uname) {
            anyhow::bail!("UNAME cannot be both given a value and blanked");
        }
        if self.password.is_some() && self.blank.contains(&Token::Psswd) {
            anyhow::bail!("PSSWD cannot be both given a value and blanked");
        }
        if self.mount_point.is_some() && self.blank.contains(&Token::Mntpoint) {
            anyhow::bail!("MNTPOINT cannot be both given a value and blanked");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn strictness(&self) -> Strictness {
        if self.strict {
            Strictness::Strict
        } else {
            Strictness::Tolerant
        }
    }
}
