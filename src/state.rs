//! Per-unit run state machine
//!
//! The ledger records what is durably applied; this module tracks what the
//! coordinator is doing with a unit during the current process. Every
//! change of state goes through [`UnitRun::transition_to`], so the coordinator
//! cannot, for example, mark a unit applied without having started it.
//!
//! # Design Principles
//!
//! - **Validated Transitions**: only the edges below are accepted
//! - **No Global State**: each unit's tracker is owned by the coordinator
//! - **Fail Fast**: an invalid transition is an error, never a silent no-op
//!
//! # State Flow
//!
//! ```text
//! Pending ──► Running ──► Applied ──► RolledBack
//!                │                        │
//!                ▼                        │
//!              Failed ──► Running ◄───────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

/// Run state of a single migration unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationState {
    /// Registered, not yet attempted in this process
    #[default]
    Pending,
    /// `apply` is in progress
    Running,
    /// `apply` succeeded and the ledger entry was written
    Applied,
    /// Last `apply` attempt failed
    Failed,
    /// `revert` succeeded after an explicit rollback
    RolledBack,
}

impl MigrationState {
    /// Whether moving from `self` to `to` is an allowed edge
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Applied)
                | (Self::Running, Self::Failed)
                | (Self::Applied, Self::RolledBack)
                | (Self::RolledBack, Self::Running)
                | (Self::Failed, Self::Running)
        )
    }

    /// Whether `apply` may be started from this state
    #[inline]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::RolledBack)
    }
}

/// Errors raised by invalid run state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// Edge not present in the state graph
    #[error("Migration '{id}' cannot move from {from} to {to}")]
    Invalid {
        id: String,
        from: MigrationState,
        to: MigrationState,
    },

    /// Target state equals the current one
    #[error("Migration '{id}' is already {state}")]
    AlreadyInState { id: String, state: MigrationState },
}

/// State tracker for one unit, with a timestamped transition history.
///
/// ```
/// use migration_engine::state::{MigrationState, UnitRun};
///
/// let mut run = UnitRun::new("0001_users");
/// run.transition_to(MigrationState::Running).unwrap();
/// run.transition_to(MigrationState::Applied).unwrap();
/// assert!(run.transition_to(MigrationState::Failed).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct UnitRun {
    id: String,
    current: MigrationState,
    history: Vec<(MigrationState, DateTime<Utc>)>,
    last_error: Option<String>,
}

impl UnitRun {
    pub fn new(id: impl Into<String>) -> Self {
        Self::starting_at(id, MigrationState::Pending)
    }

    /// Tracker seeded from durable state (e.g. an active ledger entry)
    pub fn starting_at(id: impl Into<String>, state: MigrationState) -> Self {
        Self {
            id: id.into(),
            current: state,
            history: Vec::new(),
            last_error: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn current(&self) -> MigrationState {
        self.current
    }

    /// Error text of the most recent failed attempt, cleared on success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn history(&self) -> &[(MigrationState, DateTime<Utc>)] {
        &self.history
    }

    /// Move to `to`, recording the transition.
    ///
    /// # Errors
    ///
    /// - `AlreadyInState` if `to` is the current state
    /// - `Invalid` for any edge not in the state graph
    pub fn transition_to(&mut self, to: MigrationState) -> Result<(), StateTransitionError> {
        if self.current == to {
            return Err(StateTransitionError::AlreadyInState {
                id: self.id.clone(),
                state: to,
            });
        }
        if !self.current.can_transition_to(to) {
            return Err(StateTransitionError::Invalid {
                id: self.id.clone(),
                from: self.current,
                to,
            });
        }
        if to == MigrationState::Applied {
            self.last_error = None;
        }
        self.history.push((to, Utc::now()));
        self.current = to;
        Ok(())
    }

    /// `Running → Failed`, keeping the error text for status reports
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), StateTransitionError> {
        self.transition_to(MigrationState::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }
}

impl fmt::Display for UnitRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.current)
    }
}
