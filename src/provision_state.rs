//! Provisioning state machine
//!
//! [`ProvisionContext`] owns the current stage of a run and only allows
//! validated transitions. Stages advance one at a time, never backwards,
//! and any non-terminal stage may fail.
//!
//! # Stage Flow
//!
//! ```text
//! Idle
//!     ↓
//! MetadataLoaded
//!     ↓
//! RootResolved
//!     ↓
//! TreeReconstructed
//!     ↓
//! ScriptResolved
//!     ↓
//! VariablesSubstituted
//!     ↓
//! Executed
//!     ↓
//! Succeeded
//!
//! (Any non-terminal stage can transition to Failed)
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Provisioning stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProvisionStage {
    /// Nothing has happened yet
    Idle = 0,

    /// The container was parsed and validated
    MetadataLoaded = 1,

    /// Target root and secrets are known and preconditions hold
    RootResolved = 2,

    /// The directory tree exists under the root
    TreeReconstructed = 3,

    /// The platform's raw script template was retrieved
    ScriptResolved = 4,

    /// Every placeholder in the script has a value
    VariablesSubstituted = 5,

    /// The script ran and exited
    Executed = 6,

    /// Terminal: the script exited successfully
    Succeeded = 7,

    /// Terminal: something went wrong; see the context's `failed_at`
    Failed = 255,
}

impl ProvisionStage {
    /// Numeric order of this stage (0-7, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Stages whose work changes the host (filesystem or processes).
    #[inline]
    pub const fn mutates_host(self) -> bool {
        matches!(self, Self::TreeReconstructed | Self::Executed)
    }

    /// Returns the next stage in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::MetadataLoaded),
            Self::MetadataLoaded => Some(Self::RootResolved),
            Self::RootResolved => Some(Self::TreeReconstructed),
            Self::TreeReconstructed => Some(Self::ScriptResolved),
            Self::ScriptResolved => Some(Self::VariablesSubstituted),
            Self::VariablesSubstituted => Some(Self::Executed),
            Self::Executed => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::MetadataLoaded => "Metadata loaded",
            Self::RootResolved => "Root resolved",
            Self::TreeReconstructed => "Tree reconstructed",
            Self::ScriptResolved => "Script resolved",
            Self::VariablesSubstituted => "Variables substituted",
            Self::Executed => "Script executed",
            Self::Succeeded => "Provisioning succeeded",
            Self::Failed => "Provisioning failed",
        }
    }

    /// Returns all stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Idle,
            Self::MetadataLoaded,
            Self::RootResolved,
            Self::TreeReconstructed,
            Self::ScriptResolved,
            Self::VariablesSubstituted,
            Self::Executed,
            Self::Succeeded,
        ]
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionTransitionError {
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    #[error("Cannot go backwards from {from} to {to} (provisioning is forward-only)")]
    BackwardTransition {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ProvisionStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ProvisionStage },
}

/// Owns the stage of one provisioning run.
///
/// # Example
///
/// ```
/// use provision::provision_state::{ProvisionContext, ProvisionStage};
///
/// let mut ctx = ProvisionContext::new();
/// assert_eq!(ctx.current_stage(), ProvisionStage::Idle);
///
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_stage(), ProvisionStage::MetadataLoaded);
///
/// // Cannot skip stages
/// assert!(ctx.transition_to(ProvisionStage::Executed).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    current: ProvisionStage,

    /// Stage at which failure occurred (if any)
    failed_at: Option<ProvisionStage>,

    /// Stages entered, with milliseconds since the UNIX epoch
    stage_history: Vec<(ProvisionStage, u64)>,
}

impl Default for ProvisionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionContext {
    pub fn new() -> Self {
        Self {
            current: ProvisionStage::Idle,
            failed_at: None,
            stage_history: Vec::with_capacity(ProvisionStage::all_stages().len()),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> ProvisionStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<ProvisionStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_succeeded(&self) -> bool {
        self.current == ProvisionStage::Succeeded
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == ProvisionStage::Failed
    }

    #[inline]
    pub fn is_in_progress(&self) -> bool {
        !self.current.is_terminal() && self.current != ProvisionStage::Idle
    }

    pub fn stage_history(&self) -> &[(ProvisionStage, u64)] {
        &self.stage_history
    }

    /// Advance to the next stage in sequence.
    ///
    /// # Errors
    ///
    /// `FromTerminalState` if already at Succeeded or Failed
    pub fn advance(&mut self) -> Result<ProvisionStage, ProvisionTransitionError> {
        let Some(next_stage) = self.current.next() else {
            return Err(ProvisionTransitionError::FromTerminalState { from: self.current });
        };

        self.record_stage_transition(next_stage);
        self.current = next_stage;
        tracing::debug!(stage = %next_stage, "Stage entered");

        Ok(next_stage)
    }

    /// Transition to `target`, which must be the immediate next stage.
    ///
    /// # Errors
    ///
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if target is not the immediate next stage
    /// - `FromTerminalState` if current is a terminal state
    pub fn transition_to(
        &mut self,
        target: ProvisionStage,
    ) -> Result<ProvisionStage, ProvisionTransitionError> {
        if self.current.is_terminal() {
            return Err(ProvisionTransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(ProvisionTransitionError::AlreadyAtStage { stage: target });
        }

        // Failed is only reachable through fail()
        if target == ProvisionStage::Failed {
            return Err(ProvisionTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(ProvisionTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        if self.current.next() != Some(target) {
            return Err(ProvisionTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.record_stage_transition(target);
        self.current = target;
        tracing::debug!(stage = %target, "Stage entered");

        Ok(target)
    }

    /// Mark the run as failed, remembering the stage it failed at.
    ///
    /// # Errors
    ///
    /// `FromTerminalState` if already at Succeeded or Failed
    pub fn fail(&mut self) -> Result<(), ProvisionTransitionError> {
        if self.current.is_terminal() {
            return Err(ProvisionTransitionError::FromTerminalState { from: self.current });
        }

        self.failed_at = Some(self.current);
        self.record_stage_transition(ProvisionStage::Failed);
        self.current = ProvisionStage::Failed;

        Ok(())
    }

    fn record_stage_transition(&mut self, stage: ProvisionStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        self.stage_history.push((stage, timestamp));
    }

    /// Back to Idle with no history.
    pub fn reset(&mut self) {
        self.current = ProvisionStage::Idle;
        self.failed_at = None;
        self.stage_history.clear();
    }
}
