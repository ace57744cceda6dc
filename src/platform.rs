//! Platform resolution and interpreter selection
//!
//! The container indexes its scripts by a short platform key. The host is
//! identified the way `uname -s` reports it (`Linux`, `Darwin`, `Windows`)
//! and mapped onto a key case-insensitively. Anything else is unsupported.

use std::ffi::OsString;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{ProvisionError, Result};

/// Platform key used by the container's script index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlatformKey {
    Win,
    Darwin,
    Linux,
}

impl PlatformKey {
    /// Parse an index key, accepting the legacy `<key>_script` spelling.
    pub fn from_index_key(key: &str) -> Option<Self> {
        let key = key.strip_suffix("_script").unwrap_or(key);
        key.parse().ok()
    }

    /// The interpreter a script for this platform runs under by default.
    pub fn default_interpreter(self) -> Interpreter {
        match self {
            Self::Win => Interpreter::new("powershell.exe", ShellKind::PowerShell),
            Self::Darwin | Self::Linux => Interpreter::new("/bin/sh", ShellKind::Posix),
        }
    }
}

/// Map a host OS identity onto a platform key.
///
/// Matching is exact apart from letter case: `windows`, `darwin` and
/// `linux` in any casing.
pub fn resolve(identity: &str) -> Result<PlatformKey> {
    match identity.to_ascii_lowercase().as_str() {
        "windows" => Ok(PlatformKey::Win),
        "darwin" => Ok(PlatformKey::Darwin),
        "linux" => Ok(PlatformKey::Linux),
        _ => Err(ProvisionError::UnsupportedPlatform {
            identity: identity.to_string(),
        }),
    }
}

/// Identity of the running host, spelled the way `uname -s` does.
pub fn host_identity() -> String {
    match std::env::consts::OS {
        "windows" => "Windows".to_string(),
        "macos" => "Darwin".to_string(),
        "linux" => "Linux".to_string(),
        other => other.to_string(),
    }
}

/// Family of command interpreter a script is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ShellKind {
    Posix,
    PowerShell,
    Cmd,
}

impl ShellKind {
    /// Guess the family from an interpreter program path.
    pub fn detect(program: &str) -> Self {
        let name = Path::new(program)
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();

        match name.as_str() {
            "pwsh" | "powershell" => Self::PowerShell,
            "cmd" => Self::Cmd,
            _ => Self::Posix,
        }
    }

    /// File extension the temporary script file must carry.
    pub fn script_extension(self) -> &'static str {
        match self {
            Self::Posix => ".sh",
            Self::PowerShell => ".ps1",
            Self::Cmd => ".cmd",
        }
    }

    /// Expression that expands to the value of environment variable `var`.
    pub fn env_reference(self, var: &str) -> String {
        match self {
            Self::Posix => format!("${{{}}}", var),
            Self::PowerShell => format!("$env:{}", var),
            Self::Cmd => format!("%{}%", var),
        }
    }
}

/// Program plus invocation convention used to run a script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    program: String,
    kind: ShellKind,
}

impl Interpreter {
    pub fn new(program: impl Into<String>, kind: ShellKind) -> Self {
        Self {
            program: program.into(),
            kind,
        }
    }

    /// Operator-supplied interpreter; the family is inferred from its name.
    pub fn from_program(program: impl Into<String>) -> Self {
        let program = program.into();
        let kind = ShellKind::detect(&program);
        Self { program, kind }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    /// Arguments that make the interpreter run `script` as a file.
    ///
    /// The script body never appears on the command line.
    pub fn args_for(&self, script: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = match self.kind {
            ShellKind::Posix => Vec::new(),
            ShellKind::PowerShell => [
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ]
            .into_iter()
            .map(OsString::from)
            .collect(),
            ShellKind::Cmd => vec![OsString::from("/C")],
        };
        args.push(script.as_os_str().to_owned());
        args
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.program, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_resolve_known_identities() {
        assert_eq!(resolve("Windows").unwrap(), PlatformKey::Win);
        assert_eq!(resolve("Darwin").unwrap(), PlatformKey::Darwin);
        assert_eq!(resolve("Linux").unwrap(), PlatformKey::Linux);
        assert_eq!(resolve("LINUX").unwrap(), PlatformKey::Linux);
        assert_eq!(resolve("dArWiN").unwrap(), PlatformKey::Darwin);
    }

    #[test]
    fn test_resolve_rejects_everything_else() {
        for identity in ["", "FreeBSD", "macos", "win", "linux ", "Linux-gnu"] {
            let err = resolve(identity).unwrap_err();
            assert!(
                matches!(err, ProvisionError::UnsupportedPlatform { .. }),
                "{:?} should be unsupported",
                identity
            );
        }
    }

    #[test]
    fn test_host_identity_resolves_on_supported_hosts() {
        let identity = host_identity();
        if cfg!(any(target_os = "linux", target_os = "macos", windows)) {
            assert!(resolve(&identity).is_ok(), "{} should resolve", identity);
        }
    }

    #[test]
    fn test_platform_key_display_matches_index_keys() {
        let keys: Vec<String> = PlatformKey::iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["win", "darwin", "linux"]);
    }

    #[test]
    fn test_legacy_index_keys() {
        assert_eq!(PlatformKey::from_index_key("win_script"), Some(PlatformKey::Win));
        assert_eq!(PlatformKey::from_index_key("darwin"), Some(PlatformKey::Darwin));
        assert_eq!(PlatformKey::from_index_key("linux_script"), Some(PlatformKey::Linux));
        assert_eq!(PlatformKey::from_index_key("solaris"), None);
        assert_eq!(PlatformKey::from_index_key("_script"), None);
    }

    #[test]
    fn test_shell_detection() {
        assert_eq!(ShellKind::detect("/bin/sh"), ShellKind::Posix);
        assert_eq!(ShellKind::detect("/usr/bin/bash"), ShellKind::Posix);
        assert_eq!(ShellKind::detect("pwsh"), ShellKind::PowerShell);
        assert_eq!(ShellKind::detect("powershell.exe"), ShellKind::PowerShell);
        assert_eq!(ShellKind::detect("cmd.exe"), ShellKind::Cmd);
    }

    #[test]
    fn test_env_reference_syntax() {
        assert_eq!(ShellKind::Posix.env_reference("X"), "${X}");
        assert_eq!(ShellKind::PowerShell.env_reference("X"), "$env:X");
        assert_eq!(ShellKind::Cmd.env_reference("X"), "%X%");
    }

    #[test]
    fn test_args_pass_script_as_file() {
        let script = Path::new("/tmp/run.ps1");
        let ps = PlatformKey::Win.default_interpreter();
        let args = ps.args_for(script);
        assert_eq!(args.last().unwrap(), script.as_os_str());
        assert!(args.contains(&OsString::from("-File")));

        let sh = PlatformKey::Linux.default_interpreter();
        assert_eq!(sh.args_for(Path::new("/tmp/run.sh")), vec![OsString::from("/tmp/run.sh")]);
        assert_eq!(sh.kind().script_extension(), ".sh");
    }
}
