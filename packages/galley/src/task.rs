//! The task domain interface.
//!
//! A task is the unit the scheduler schedules. The scheduler is
//! parameterised by implementations of [`Task`], so input existence
//! checks, directory selects and process steps are all represented
//! uniformly; the workflow-backed instance lives in
//! [`engine`](crate::engine).

use std::future::Future;

use derive_more::Display;

use crate::{
    alloc::{Grant, Requirement},
    hash::Id,
};

/// Identifies a task within a scheduler run.
///
/// Workflow-backed tasks use the workflow identity's hex rendering;
/// other task domains may use any stable string.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Id> for TaskId {
    fn from(id: &Id) -> Self {
        Self(id.to_hex())
    }
}

/// A schedulable unit of work.
pub trait Task: Clone + Send + Sync + 'static {
    /// Shared configuration handed to every task in a run.
    type Config: Clone + Send + Sync + 'static;

    /// Stable identity of the task. At most one execution per identity
    /// happens within a scheduler run.
    fn id(&self) -> TaskId;

    /// The resources the task needs while performing.
    fn requirement(&self) -> Requirement;

    /// Whether the task's artifact is already present, making execution
    /// unnecessary.
    fn is_done(&self, config: &Self::Config) -> impl Future<Output = bool> + Send;

    /// Produce the task's artifact. Called with resources granted, after
    /// every dependency completed successfully.
    fn perform(
        &self,
        grant: &Grant,
        config: &Self::Config,
    ) -> impl Future<Output = Result<(), TaskError>> + Send;
}

/// The ways a performed task can fail.
///
/// Task errors are recorded in traces and never abort the run.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
pub enum TaskError {
    /// The producer reported success but its build location is empty.
    #[display("workflow {id} failed to produce its target")]
    MissingArtifact { id: TaskId },

    /// An extract's projected path does not exist inside the parent's
    /// cached directory.
    #[display("workflow {dir} has no entry at {}", path.join("/"))]
    InvalidSelect { dir: TaskId, path: Vec<String> },

    /// The producer failed with a message.
    #[display("workflow {id} failed saying: {message}")]
    Failed { id: TaskId, message: String },

    /// The producer panicked.
    #[display("workflow {id} failed with an exception")]
    Exception { id: TaskId },
}

impl std::error::Error for TaskError {}
