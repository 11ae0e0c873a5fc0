//! Error types for workhive-core.

use std::fmt;

use thiserror::Error;

use crate::work::{Outcome, WorkItemId};

/// Result type for workhive-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in workhive-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incompatible work queue configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Action identifier not present in the registry.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// An execution slot or daemon could not be started, or died.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// IPC communication error with a daemon process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// An outgoing message exceeds the frame limit. Nothing was written.
    #[error("IPC message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to load a context library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// One or more work items failed.
    #[error("{0}")]
    Aggregate(AggregateFailure),

    /// The executor or daemon pool has been shut down.
    #[error("shut down")]
    ShutDown,
}

impl Error {
    /// Whether this error belongs to the caller-detectable configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::UnknownAction(_))
    }
}

/// Every outcome of an `await_all` round in which at least one item failed.
///
/// Successes are kept alongside failures so nothing is lost.
#[derive(Debug, Clone)]
pub struct AggregateFailure {
    outcomes: Vec<(WorkItemId, Outcome)>,
}

impl AggregateFailure {
    pub(crate) fn new(outcomes: Vec<(WorkItemId, Outcome)>) -> Self {
        Self { outcomes }
    }

    /// All outcomes, successful or not.
    pub fn outcomes(&self) -> &[(WorkItemId, Outcome)] {
        &self.outcomes
    }

    /// Consume into all outcomes.
    pub fn into_outcomes(self) -> Vec<(WorkItemId, Outcome)> {
        self.outcomes
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &(WorkItemId, Outcome)> {
        self.outcomes.iter().filter(|(_, o)| o.is_failure())
    }

    /// Outcomes that succeeded.
    pub fn successes(&self) -> impl Iterator<Item = &(WorkItemId, Outcome)> {
        self.outcomes.iter().filter(|(_, o)| o.is_success())
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        write!(
            f,
            "{} of {} work items failed",
            failed,
            self.outcomes.len()
        )?;
        if let Some((id, Outcome::Failure(failure))) = self.failures().next() {
            write!(f, " (first: {}: {})", id, failure)?;
        }
        Ok(())
    }
}
