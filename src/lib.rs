//! Provision Library
//!
//! Recreates a data container's directory tree under a target root and runs
//! the container's bootstrap script for the host platform.

pub mod cli;
pub mod config_file;
pub mod container;
pub mod error;
pub mod materialize;
pub mod platform;
pub mod process_guard;
pub mod provision_state;
pub mod provisioner;
pub mod reconstruct;
pub mod sandbox;
pub mod substitution;
pub mod tree;

// Re-export main types for convenience
pub use config_file::ProvisionSettings;
pub use container::Container;
pub use error::{BranchError, ProvisionError};
pub use platform::{Interpreter, PlatformKey};
pub use process_guard::CancelToken;
pub use provision_state::{ProvisionContext, ProvisionStage, ProvisionTransitionError};
pub use provisioner::{ProvisionFailure, ProvisionPlan, ProvisionReport, Provisioner};
pub use reconstruct::ReconstructReport;
pub use sandbox::{Sandbox, ScriptOutput};
pub use substitution::{Substitutions, Token};
pub use tree::DirectoryPlan;
