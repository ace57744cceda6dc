//! Directory reconstruction
//!
//! Creates the planned directories under the target root with
//! create-if-missing semantics, then the optional symlink. A failure only
//! affects its own branch. Whatever cannot be created is recorded and the
//! walk continues with the remaining branches. Running twice against the
//! same root converges on the same tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::container::SymlinkSpec;
use crate::error::{BranchError, ProvisionError, Result};
use crate::tree::{DirectoryPlan, TreeDiagnostic};

/// What happened to the requested symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkOutcome {
    Created,
    AlreadyPresent,
    Failed,
}

/// Outcome of one reconstruction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconstructReport {
    pub root: PathBuf,
    pub created: usize,
    pub already_present: usize,
    pub failures: Vec<BranchError>,
    pub diagnostics: Vec<TreeDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink: Option<SymlinkOutcome>,
}

impl ReconstructReport {
    /// Directories that exist under the root after the pass.
    pub fn reconstructed(&self) -> usize {
        self.created + self.already_present
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Create every planned directory (and the symlink, if any) under `root`.
///
/// # Errors
///
/// `Filesystem` only when the root itself cannot be created. Per-branch
/// problems are returned in the report.
pub fn reconstruct(
    plan: &DirectoryPlan,
    root: &Path,
    symlink: Option<&SymlinkSpec>,
) -> Result<ReconstructReport> {
    fs::create_dir_all(root).map_err(|e| ProvisionError::filesystem(root, e))?;
    if !root.is_dir() {
        return Err(ProvisionError::filesystem(root, "target root is not a directory"));
    }

    let mut report = ReconstructReport {
        root: root.to_path_buf(),
        created: 0,
        already_present: 0,
        failures: Vec::new(),
        diagnostics: plan.diagnostics().to_vec(),
        symlink: None,
    };
    let mut ok = vec![false; plan.len()];

    for (index, node) in plan.nodes().iter().enumerate() {
        let path = root.join(&node.relative_path);

        if let Some(parent) = node.parent {
            if !ok[parent] {
                record(&mut report, BranchError::ParentFailed { path });
                continue;
            }
        }
        if let Err(reason) = validate_name(&node.name) {
            record(
                &mut report,
                BranchError::InvalidName {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    reason,
                },
            );
            continue;
        }

        match fs::create_dir(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Created directory");
                report.created += 1;
                ok[index] = true;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {
                tracing::debug!(path = %path.display(), "Directory already present");
                report.already_present += 1;
                ok[index] = true;
            }
            Err(e) => {
                let reason = if e.kind() == io::ErrorKind::AlreadyExists {
                    "path exists and is not a directory".to_string()
                } else {
                    e.to_string()
                };
                record(&mut report, BranchError::CreateDir { path, reason });
            }
        }
    }

    if let Some(spec) = symlink {
        let outcome = match create_symlink(root, spec) {
            Ok(outcome) => outcome,
            Err(failure) => {
                record(&mut report, failure);
                SymlinkOutcome::Failed
            }
        };
        report.symlink = Some(outcome);
    }

    tracing::info!(
        root = %root.display(),
        created = report.created,
        already_present = report.already_present,
        failures = report.failures.len(),
        "Directory tree reconstructed"
    );
    Ok(report)
}

fn record(report: &mut ReconstructReport, failure: BranchError) {
    tracing::warn!("{}", failure);
    report.failures.push(failure);
}

/// A directory name must be a single, ordinary path component.
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name == "." || name == ".." {
        return Err("name refers to a relative directory");
    }
    if name.contains('/') || name.contains('\\') {
        return Err("name contains a path separator");
    }
    if name.contains('\0') {
        return Err("name contains a NUL byte");
    }
    Ok(())
}

fn create_symlink(root: &Path, spec: &SymlinkSpec) -> std::result::Result<SymlinkOutcome, BranchError> {
    let path = root.join(&spec.name);
    let failure = |reason: String| BranchError::Symlink {
        path: path.clone(),
        reason,
    };

    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            tracing::debug!(path = %path.display(), "Symlink already present");
            return Ok(SymlinkOutcome::AlreadyPresent);
        }
        Ok(_) => return Err(failure("path exists and is not a symlink".to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(failure(e.to_string())),
    }

    match symlink_dir(&spec.target, &path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), target = %spec.target.display(), "Created symlink");
            Ok(SymlinkOutcome::Created)
        }
        // Another creator won the race.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(SymlinkOutcome::AlreadyPresent),
        Err(e) => Err(failure(e.to_string())),
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(not(any(unix, windows)))]
fn symlink_dir(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::tree::Strictness;
    use tempfile::TempDir;

    fn plan(json: &str) -> (Container, DirectoryPlan) {
        let container = Container::from_json_str(json).unwrap();
        let plan = DirectoryPlan::build(&container, Strictness::Tolerant).unwrap();
        (container, plan)
    }

    const NESTED: &str = r#"{
        "directory_tree": {
            "root": [{"id": "a", "name": "IN"}, {"id": "b", "name": "OUT"}],
            "a": [{"id": "c", "name": "raw"}]
        },
        "name_lookup": {"a": "IN", "b": "OUT", "c": "raw"},
        "platform_scripts": {},
        "scripts": []
    }"#;

    #[test]
    fn test_creates_nested_tree() {
        let dir = TempDir::new().unwrap();
        let (_, plan) = plan(NESTED);

        let report = reconstruct(&plan, dir.path(), None).unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(report.already_present, 0);
        assert!(report.is_clean());
        assert!(dir.path().join("IN").join("raw").is_dir());
        assert!(dir.path().join("OUT").is_dir());
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_, plan) = plan(NESTED);

        reconstruct(&plan, dir.path(), None).unwrap();
        let report = reconstruct(&plan, dir.path(), None).unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.already_present, 3);
        assert!(report.is_clean());
    }

    #[test]
    fn test_creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("deep").join("target");
        let (_, plan) = plan(NESTED);

        let report = reconstruct(&plan, &root, None).unwrap();
        assert_eq!(report.reconstructed(), 3);
        assert!(root.join("IN").is_dir());
    }

    #[test]
    fn test_root_that_is_a_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("file");
        fs::write(&root, b"x").unwrap();
        let (_, plan) = plan(NESTED);

        let err = reconstruct(&plan, &root, None).unwrap_err();
        assert!(matches!(err, ProvisionError::Filesystem { .. }));
    }

    #[test]
    fn test_file_in_the_way_fails_only_that_branch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("IN"), b"not a directory").unwrap();
        let (_, plan) = plan(NESTED);

        let report = reconstruct(&plan, dir.path(), None).unwrap();
        assert_eq!(report.created, 1, "OUT is still created");
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0], BranchError::CreateDir { .. }));
        assert!(matches!(report.failures[1], BranchError::ParentFailed { .. }));
    }

    #[test]
    fn test_invalid_names_fail_their_branch() {
        let json = r#"{
            "directory_tree": {
                "root": [{"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "d"}],
                "b": [{"id": "e"}]
            },
            "name_lookup": {"a": "ok", "b": "..", "c": "x/y", "d": "", "e": "child"},
            "platform_scripts": {},
            "scripts": []
        }"#;
        let dir = TempDir::new().unwrap();
        let (_, plan) = plan(json);

        let report = reconstruct(&plan, dir.path(), None).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failures.len(), 4);
        assert!(!dir.path().join("x").exists());
        assert!(!dir.path().parent().unwrap().join("child").exists());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("renders").is_ok());
        assert!(validate_name("with space").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_created_then_already_present() {
        let json = r#"{
            "directory_tree": {"root": [{"id": "a", "name": "IO"}, {"id": "b", "name": "IN"}]},
            "name_lookup": {"a": "IO", "b": "IN"},
            "platform_scripts": {},
            "scripts": [],
            "capabilities": {"needs_symlink": true},
            "symlink": {"name": "IO/from_client", "target": "../IN"}
        }"#;
        let dir = TempDir::new().unwrap();
        let (container, plan) = plan(json);

        let report = reconstruct(&plan, dir.path(), container.symlink()).unwrap();
        assert_eq!(report.symlink, Some(SymlinkOutcome::Created));
        let link = dir.path().join("IO").join("from_client");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../IN"));
        assert!(link.is_dir());

        let report = reconstruct(&plan, dir.path(), container.symlink()).unwrap();
        assert_eq!(report.symlink, Some(SymlinkOutcome::AlreadyPresent));
        assert!(report.is_clean());
    }

    #[test]
    fn test_symlink_blocked_by_directory_is_a_branch_failure() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("link")).unwrap();
        let (_, plan) = plan(NESTED);
        let spec = SymlinkSpec {
            name: PathBuf::from("link"),
            target: PathBuf::from("IN"),
        };

        let report = reconstruct(&plan, dir.path(), Some(&spec)).unwrap();
        assert_eq!(report.symlink, Some(SymlinkOutcome::Failed));
        assert_eq!(report.created, 3);
        assert!(matches!(report.failures[0], BranchError::Symlink { .. }));
    }
}
