pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// Stable classification of a [`SortError`].
///
/// The three kinds are mutually exclusive. Callers that still speak numeric
/// error codes can use [`ErrorKind::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The registry itself is inconsistent. This is a loader bug.
    Internal,
    /// Some task depends on a name that is not registered.
    DependencyNotFound,
    /// The dependency graph contains at least one cycle.
    CircularDependency,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::DependencyNotFound => 2,
            ErrorKind::CircularDependency => 3,
        }
    }
}

/// Registry consistency violations detected while sorting or selecting tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InternalError {
    #[error("Task '{key}' is registered but has no descriptor")]
    UnresolvedTask { key: String },

    #[error("Task '{name}' is registered more than once")]
    DuplicateTask { name: String },

    #[error("Task registered as '{key}' calls itself '{name}'")]
    KeyMismatch { key: String, name: String },

    #[error("Task '{name}' disappeared from the registry while sorting")]
    MissingDuringDrain { name: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SortError {
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),

    #[error("Task '{task}' depends on '{dependency}', which is not registered")]
    DependencyNotFound { task: String, dependency: String },

    #[error(
        "Circular dependency, main: {main}, thread: {worker}, tasks: {total}, stalled: {}",
        .stalled.join(", ")
    )]
    CircularDependency {
        /// Tasks ordered for the main context before the stall.
        main: usize,
        /// Tasks ordered for worker contexts before the stall.
        worker: usize,
        /// Registry size.
        total: usize,
        /// Tasks that never became ready, in registry order.
        stalled: Vec<String>,
        /// Cyclic components among the stalled tasks.
        cycles: Vec<Vec<String>>,
    },
}

impl SortError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SortError::Internal(_) => ErrorKind::Internal,
            SortError::DependencyNotFound { .. } => ErrorKind::DependencyNotFound,
            SortError::CircularDependency { .. } => ErrorKind::CircularDependency,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Schedule names task '{0}', which is not in the registry")]
    UnknownTask(String),

    #[error("Task '{name}':\n{error}")]
    Task { name: String, error: RuntimeError },

    #[error("Dispatch stalled after {completed} of {total} tasks")]
    Stalled { completed: usize, total: usize },
}
