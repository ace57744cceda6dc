//! Provisioning orchestrator
//!
//! [`Provisioner::run`] drives one run through the stage machine in
//! [`crate::provision_state`]: load the container, resolve the target root,
//! reconstruct the tree, pick and fill in the platform script, and execute
//! it. The first fatal error moves the run to `Failed` and is returned with
//! the stage it happened at. Directories created before that point stay.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config_file::ProvisionSettings;
use crate::container::{Container, Flavor};
use crate::error::{ProvisionError, Result};
use crate::materialize::materialize;
use crate::platform::{self, Interpreter, PlatformKey};
use crate::process_guard::CancelToken;
use crate::provision_state::{ProvisionContext, ProvisionStage};
use crate::reconstruct::{ReconstructReport, reconstruct};
use crate::sandbox::{Sandbox, ScriptOutput};
use crate::substitution::{Binding, Substitutions, Token, referenced_tokens, substitute};
use crate::tree::DirectoryPlan;

const REDACTED: &str = "********";

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub container: PathBuf,
    pub platform: PlatformKey,
    pub tree: ReconstructReport,
    pub output: ScriptOutput,
    /// Stages entered, with milliseconds since the UNIX epoch
    pub stages: Vec<(ProvisionStage, u64)>,
}

/// A run that ended in `Failed`.
#[derive(Debug, Error)]
#[error("{error} (failed at: {failed_at})")]
pub struct ProvisionFailure {
    #[source]
    pub error: ProvisionError,
    /// Last stage reached before the failure
    pub failed_at: ProvisionStage,
    /// Reconstruction outcome, if the run got that far
    pub tree: Option<ReconstructReport>,
}

/// What a run would do, computed without touching the host.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionPlan {
    pub root: PathBuf,
    pub platform: PlatformKey,
    pub interpreter: String,
    pub directories: DirectoryPlan,
    /// Tokens the template references
    pub tokens: Vec<Token>,
    /// Resolved script with secret values masked
    pub script: String,
}

/// Drives provisioning runs for one set of settings.
#[derive(Debug)]
pub struct Provisioner {
    settings: ProvisionSettings,
    context: ProvisionContext,
    cancel: CancelToken,
}

impl Provisioner {
    pub fn new(settings: ProvisionSettings) -> Self {
        Self {
            settings,
            context: ProvisionContext::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Observe `token` between stages and while the script runs.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// State of the most recent run.
    pub fn context(&self) -> &ProvisionContext {
        &self.context
    }

    /// Perform a fresh run from `Idle`.
    pub fn run(&mut self) -> std::result::Result<ProvisionReport, ProvisionFailure> {
        self.context.reset();
        let mut tree = None;

        match self.run_stages(&mut tree) {
            Ok(report) => Ok(report),
            Err(error) => {
                let failed_at = self.context.current_stage();
                if let Err(e) = self.context.fail() {
                    tracing::warn!("Could not record failure: {}", e);
                }
                tracing::error!(stage = %failed_at, kind = error.kind(), "Provisioning failed: {}", error);
                Err(ProvisionFailure {
                    error,
                    failed_at,
                    tree,
                })
            }
        }
    }

    fn run_stages(&mut self, tree_out: &mut Option<ReconstructReport>) -> Result<ProvisionReport> {
        let settings = &self.settings;

        // Idle -> MetadataLoaded
        self.check_cancelled()?;
        let container = Container::load_from_file(&settings.container)?;
        let plan = DirectoryPlan::build(&container, settings.strictness())?;
        self.enter(ProvisionStage::MetadataLoaded)?;

        // MetadataLoaded -> RootResolved
        self.check_cancelled()?;
        let root = resolve_root(&self.settings.root, container.flavor())?;
        self.enter(ProvisionStage::RootResolved)?;

        // RootResolved -> TreeReconstructed
        self.check_cancelled()?;
        let report = reconstruct(&plan, &root, container.symlink())?;
        *tree_out = Some(report.clone());
        if report.reconstructed() == 0 {
            return Err(ProvisionError::filesystem(
                &root,
                "no directories were created or found under the root",
            ));
        }
        self.enter(ProvisionStage::TreeReconstructed)?;

        // TreeReconstructed -> ScriptResolved
        self.check_cancelled()?;
        let platform = platform::resolve(&self.host_identity())?;
        let template = materialize(&container, platform)?;
        self.enter(ProvisionStage::ScriptResolved)?;

        // ScriptResolved -> VariablesSubstituted
        let interpreter = self.interpreter_for(platform);
        let (substitutions, env) = self.substitutions(&container, &root, &interpreter);
        let script = substitute(template, &substitutions)?;
        self.enter(ProvisionStage::VariablesSubstituted)?;

        // VariablesSubstituted -> Executed -> Succeeded
        self.check_cancelled()?;
        let sandbox = env.into_iter().fold(
            Sandbox::new(interpreter, self.settings.timeout()).cancel_token(self.cancel.clone()),
            |sandbox, (key, value)| sandbox.env(key, value),
        );
        let output = match sandbox.run(&script) {
            Ok(output) => output,
            Err(error @ ProvisionError::ScriptExecution { .. }) => {
                self.enter(ProvisionStage::Executed)?;
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        self.enter(ProvisionStage::Executed)?;
        self.enter(ProvisionStage::Succeeded)?;

        tracing::info!(
            platform = %platform,
            created = report.created,
            already_present = report.already_present,
            "Provisioning succeeded"
        );

        Ok(ProvisionReport {
            container: self.settings.container.clone(),
            platform,
            tree: report,
            output,
            stages: self.context.stage_history().to_vec(),
        })
    }

    /// Everything short of creating directories and running the script.
    pub fn plan(&self) -> Result<ProvisionPlan> {
        let container = Container::load_from_file(&self.settings.container)?;
        let directories = DirectoryPlan::build(&container, self.settings.strictness())?;
        let root = resolve_root(&self.settings.root, container.flavor())?;
        let platform = platform::resolve(&self.host_identity())?;
        let template = materialize(&container, platform)?;
        let interpreter = self.interpreter_for(platform);

        let (mut substitutions, _) = self.substitutions(&container, &root, &interpreter);
        let password_inline = !self.settings.secrets_via_env
            && matches!(substitutions.get(Token::Psswd), Some(Binding::Value(_)));
        if password_inline {
            substitutions.set(Token::Psswd, Binding::Value(REDACTED.to_string()));
        }
        let script = substitute(template, &substitutions)?;

        Ok(ProvisionPlan {
            root,
            platform,
            interpreter: interpreter.to_string(),
            directories,
            tokens: referenced_tokens(template),
            script,
        })
    }

    fn enter(&mut self, stage: ProvisionStage) -> Result<()> {
        self.context.transition_to(stage)?;
        tracing::info!("{}", stage);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        Ok(())
    }

    fn host_identity(&self) -> String {
        self.settings
            .host_os
            .clone()
            .unwrap_or_else(platform::host_identity)
    }

    fn interpreter_for(&self, platform: PlatformKey) -> Interpreter {
        match &self.settings.interpreter {
            Some(program) => Interpreter::from_program(program.clone()),
            None => platform.default_interpreter(),
        }
    }

    /// Token bindings plus the environment the child receives.
    fn substitutions(
        &self,
        container: &Container,
        root: &Path,
        interpreter: &Interpreter,
    ) -> (Substitutions, Vec<(String, String)>) {
        let settings = &self.settings;
        let mut subs = Substitutions::new();
        let mut env = Vec::new();

        if container.flavor() == Flavor::ObjectiveFs {
            // The mount helper authenticates on its own.
            subs = subs.with_blank(Token::Uname).with_blank(Token::Psswd);
        } else {
            if let Some(username) = &settings.username {
                subs = subs.with_value(Token::Uname, username.clone());
                env.push((Token::Uname.env_var().to_string(), username.clone()));
            }
            if let Some(password) = &settings.password {
                let value = if settings.secrets_via_env {
                    interpreter.kind().env_reference(Token::Psswd.env_var())
                } else {
                    password.clone()
                };
                subs = subs.with_value(Token::Psswd, value);
                env.push((Token::Psswd.env_var().to_string(), password.clone()));
            }
            if let Some(caps) = container.capabilities() {
                if !caps.needs_credentials {
                    subs.blank_if_unbound(Token::Uname);
                    subs.blank_if_unbound(Token::Psswd);
                }
            }
        }

        let mount_point = match &settings.mount_point {
            Some(mount_point) => normalize_mount_point(mount_point),
            None => root.display().to_string(),
        };
        if !settings.blank.contains(&Token::Mntpoint) {
            subs = subs.with_value(Token::Mntpoint, mount_point.clone());
            env.push((Token::Mntpoint.env_var().to_string(), mount_point));
        }

        for &token in &settings.blank {
            subs.set(token, Binding::Blank);
        }

        (subs, env)
    }
}

/// Absolute target root; checks the flavor's preconditions.
fn resolve_root(root: &Path, flavor: Flavor) -> Result<PathBuf> {
    let root = std::path::absolute(root).map_err(|e| ProvisionError::filesystem(root, e))?;

    if flavor == Flavor::ObjectiveFs {
        let mut entries = fs::read_dir(&root).map_err(|e| {
            ProvisionError::filesystem(&root, format!("mount point must be an existing directory: {}", e))
        })?;
        if entries.next().is_some() {
            return Err(ProvisionError::filesystem(&root, "mount point must be empty"));
        }
    }

    tracing::debug!(root = %root.display(), %flavor, "Target root resolved");
    Ok(root)
}

/// A bare drive letter is upper-cased; anything else is kept as given.
fn normalize_mount_point(mount_point: &str) -> String {
    let trimmed = mount_point.trim();
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() => letter.to_ascii_uppercase().to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_container(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("container.json");
        fs::write(&path, json).unwrap();
        path
    }

    fn scenario_settings(dir: &TempDir, json: &str) -> ProvisionSettings {
        let container = write_container(dir.path(), json);
        let mut settings = ProvisionSettings::new(container, dir.path().join("target"));
        settings.host_os = Some("Linux".into());
        settings
    }

    const CREDENTIALS: &str = r#"{
        "directory_tree": {"root": [{"id": "a", "name": "data"}]},
        "name_lookup": {"a": "data"},
        "platform_scripts": {"linux": 0},
        "scripts": ["login UNAME PSSWD MNTPOINT"]
    }"#;

    #[test]
    fn test_normalize_mount_point() {
        assert_eq!(normalize_mount_point("z"), "Z");
        assert_eq!(normalize_mount_point(" Z "), "Z");
        assert_eq!(normalize_mount_point("/mnt/x"), "/mnt/x");
        assert_eq!(normalize_mount_point("é"), "é");
    }

    #[test]
    fn test_substitutions_from_settings() {
        let dir = TempDir::new().unwrap();
        let mut settings = scenario_settings(&dir, CREDENTIALS);
        settings.username = Some("alice".into());
        settings.password = Some("pw".into());
        settings.mount_point = Some("/mnt/x".into());
        let provisioner = Provisioner::new(settings);

        let container = Container::from_json_str(CREDENTIALS).unwrap();
        let interpreter = PlatformKey::Linux.default_interpreter();
        let (subs, env) = provisioner.substitutions(&container, Path::new("/srv"), &interpreter);

        assert_eq!(
            substitute("UNAME PSSWD MNTPOINT", &subs).unwrap(),
            "alice pw /mnt/x"
        );
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["PROVISION_UNAME", "PROVISION_PSSWD", "PROVISION_MNTPOINT"]);
    }

    #[test]
    fn test_secrets_via_env_keeps_password_out_of_script() {
        let dir = TempDir::new().unwrap();
        let mut settings = scenario_settings(&dir, CREDENTIALS);
        settings.password = Some("hunter2".into());
        settings.secrets_via_env = true;
        let provisioner = Provisioner::new(settings);

        let container = Container::from_json_str(CREDENTIALS).unwrap();
        let interpreter = PlatformKey::Linux.default_interpreter();
        let (subs, env) = provisioner.substitutions(&container, Path::new("/srv"), &interpreter);

        let script = substitute("echo PSSWD", &subs).unwrap();
        assert_eq!(script, "echo ${PROVISION_PSSWD}");
        assert!(env.contains(&("PROVISION_PSSWD".to_string(), "hunter2".to_string())));
    }

    #[test]
    fn test_credentials_blanked_when_not_needed() {
        let json = r#"{
            "directory_tree": {}, "name_lookup": {}, "platform_scripts": {}, "scripts": [],
            "capabilities": {"needs_credentials": false}
        }"#;
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(scenario_settings(&dir, json));
        let container = Container::from_json_str(json).unwrap();
        let interpreter = PlatformKey::Linux.default_interpreter();
        let (subs, _) = provisioner.substitutions(&container, Path::new("/srv"), &interpreter);

        assert_eq!(substitute("[UNAME][PSSWD]", &subs).unwrap(), "[][]");
    }

    #[test]
    fn test_mount_point_defaults_to_root() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(scenario_settings(&dir, CREDENTIALS));
        let container = Container::from_json_str(CREDENTIALS).unwrap();
        let interpreter = PlatformKey::Linux.default_interpreter();
        let (subs, _) = provisioner.substitutions(&container, Path::new("/srv/data"), &interpreter);

        assert_eq!(substitute("MNTPOINT", &subs).unwrap(), "/srv/data");
    }

    #[test]
    fn test_objectivefs_requires_empty_existing_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            resolve_root(&missing, Flavor::ObjectiveFs),
            Err(ProvisionError::Filesystem { .. })
        ));

        let full = dir.path().join("full");
        fs::create_dir(&full).unwrap();
        fs::write(full.join("file"), b"x").unwrap();
        assert!(resolve_root(&full, Flavor::ObjectiveFs).is_err());

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        assert!(resolve_root(&empty, Flavor::ObjectiveFs).is_ok());
        assert!(resolve_root(&missing, Flavor::Standard).is_ok());
    }

    #[test]
    fn test_template_error_stops_before_execution() {
        let dir = TempDir::new().unwrap();
        let mut provisioner = Provisioner::new(scenario_settings(&dir, CREDENTIALS));

        let failure = provisioner.run().unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Template { .. }));
        assert_eq!(failure.failed_at, ProvisionStage::ScriptResolved);
        assert!(provisioner.context().is_failed());
        assert_eq!(failure.tree.unwrap().created, 1);
    }

    #[test]
    fn test_plan_redacts_password_and_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut settings = scenario_settings(&dir, CREDENTIALS);
        settings.username = Some("alice".into());
        settings.password = Some("hunter2".into());
        let target = settings.root.clone();
        let provisioner = Provisioner::new(settings);

        let plan = provisioner.plan().unwrap();
        assert!(!plan.script.contains("hunter2"));
        assert!(plan.script.contains(REDACTED));
        assert_eq!(plan.directories.len(), 1);
        assert_eq!(plan.tokens, vec![Token::Uname, Token::Psswd, Token::Mntpoint]);
        assert!(!target.exists());
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let mut provisioner =
            Provisioner::new(scenario_settings(&dir, CREDENTIALS)).with_cancel_token(token);

        let failure = provisioner.run().unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Cancelled));
        assert_eq!(failure.failed_at, ProvisionStage::Idle);
        assert!(failure.tree.is_none());
    }
}
