use crate::types::{GroupId, TaskId};
use std::any::Any;
use std::sync::Arc;

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, Error>;

/// A captured computation failure.
///
/// Shared between the task that recorded it and every error that propagates
/// it, so the original error is never copied or lost.
#[derive(Clone)]
pub struct Fault(Arc<anyhow::Error>);

impl Fault {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Capture a panic payload as a fault
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(anyhow::anyhow!("panicked: {}", message))
    }

    /// The original error
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Whether both faults are the same captured failure
    pub fn same_as(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = (*self.0).as_ref();
        inner.source()
    }
}

/// Propagated scheduling faults
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The task's own computation returned an error or panicked
    #[error("task {task} failed: {source}")]
    Failed { task: TaskId, source: Fault },

    /// A dependency's fault blocked the task from running
    #[error("task {task} blocked by failed dependency {dependency}: {source}")]
    Blocked {
        task: TaskId,
        dependency: TaskId,
        source: Fault,
    },

    /// Faults collected from parallel tasks at the join barrier
    #[error("{} parallel task(s) failed in group {group}", .faults.len())]
    Join { group: GroupId, faults: Vec<Error> },

    /// No task can become ready and nothing is in flight
    #[error("group {group} stalled with {} task(s) that can never become ready", .pending.len())]
    Stalled {
        group: GroupId,
        pending: Vec<TaskId>,
        cyclic: bool,
    },

    #[error("task {0} has already run")]
    AlreadyRun(TaskId),

    /// A raw engine submission panicked
    #[error("submitted computation panicked: {0}")]
    Panicked(Fault),

    #[error("execution handle dropped before its computation settled")]
    HandleDropped,

    #[error("execution engine is shut down")]
    EngineClosed,

    #[error("failed to start execution engine: {0}")]
    Engine(String),
}

impl Error {
    /// The captured failure behind a task fault
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Failed { source, .. } | Error::Blocked { source, .. } => Some(source),
            Error::Panicked(fault) => Some(fault),
            Error::Join { faults, .. } => faults.iter().find_map(Error::fault),
            _ => None,
        }
    }

    /// The task that raised this error
    pub fn task(&self) -> Option<&TaskId> {
        match self {
            Error::Failed { task, .. } | Error::Blocked { task, .. } => Some(task),
            Error::AlreadyRun(task) => Some(task),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Error::Blocked { .. })
    }
}
