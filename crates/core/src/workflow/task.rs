use crate::env::{Clock, Environment};
use crate::error::{Error, Fault, Result};
use crate::time::Timestamp;
use crate::types::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

type Computation<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

/// One unit of computation with dependencies and a lifecycle.
///
/// `Task` is a shared handle: clones refer to the same task, so a task can be
/// placed in a group and listed as a dependency of other tasks at once. Every
/// lifecycle field is a write-once cell, so a task's outcome, once observed,
/// never changes.
pub struct Task<T> {
    state: Arc<TaskState<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

enum Outcome<T> {
    Finished(T),
    Faulted(Fault),
}

pub(crate) struct TaskState<T> {
    id: TaskId,
    parallel: bool,
    dependencies: RwLock<Vec<Arc<dyn Dispatch>>>,
    computation: Mutex<Option<Computation<T>>>,
    clock: Arc<dyn Clock>,
    created: Timestamp,
    submitted: OnceLock<Timestamp>,
    started: OnceLock<Timestamp>,
    finished: OnceLock<Timestamp>,
    completed: OnceLock<Timestamp>,
    outcome: OnceLock<Outcome<T>>,
}

/// Type-erased view of a task used by the dispatch loop and by dependents
pub(crate) trait Dispatch: Send + Sync {
    fn id(&self) -> &TaskId;
    fn is_parallel(&self) -> bool;
    fn is_finished(&self) -> bool;
    fn fault(&self) -> Option<Fault>;
    fn is_ready(&self) -> Result<bool>;
    fn dependencies(&self) -> Vec<Arc<dyn Dispatch>>;
    fn execute(&self) -> Result<()>;
    fn mark_submitted(&self);
    fn mark_completed(&self);
    fn record(&self) -> TaskRecord;

    fn is_done(&self) -> bool {
        self.is_finished() || self.fault().is_some()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Task with a fresh id, no dependencies, dispatched to the engine
    pub fn new<F>(computation: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::builder(computation).build()
    }

    pub fn builder<F>(computation: F) -> TaskBuilder<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        TaskBuilder {
            computation: Box::new(computation),
            id: None,
            dependencies: Vec::new(),
            parallel: true,
            environment: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.state.id
    }

    pub fn is_parallel(&self) -> bool {
        self.state.parallel
    }

    /// Run only after `dependency` has finished
    pub fn after<U: Send + Sync + 'static>(&self, dependency: &Task<U>) -> &Self {
        self.state.add_dependency(dependency.erased());
        self
    }

    /// Run only after every task in `dependencies` has finished
    pub fn after_all<U: Send + Sync + 'static>(&self, dependencies: &[Task<U>]) -> &Self {
        for dependency in dependencies {
            self.after(dependency);
        }
        self
    }

    /// Ids of the tasks this one waits for
    pub fn dependency_ids(&self) -> Vec<TaskId> {
        self.state
            .dependencies()
            .iter()
            .map(|d| d.id().clone())
            .collect()
    }

    /// Whether every dependency has finished.
    ///
    /// Returns [`Error::Blocked`] as soon as a faulted dependency is seen, and
    /// `Ok(false)` at the first dependency that has not finished yet. Has no
    /// side effects.
    pub fn is_ready(&self) -> Result<bool> {
        self.state.is_ready()
    }

    /// Run the computation on the calling thread.
    ///
    /// Records `started`, then `finished` on success. On failure (error or
    /// panic) the fault is stored on the task and returned as
    /// [`Error::Failed`]. A task runs at most once; later calls return
    /// [`Error::AlreadyRun`].
    pub fn run(&self) -> Result<&T> {
        self.state.run()
    }

    /// The computation's value, once finished
    pub fn result(&self) -> Option<&T> {
        match self.state.outcome.get() {
            Some(Outcome::Finished(value)) => Some(value),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<Fault> {
        self.state.fault()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_faulted(&self) -> bool {
        self.state.fault().is_some()
    }

    /// Finished or faulted
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn created(&self) -> Timestamp {
        self.state.created
    }

    pub fn submitted(&self) -> Option<Timestamp> {
        self.state.submitted.get().copied()
    }

    pub fn started(&self) -> Option<Timestamp> {
        self.state.started.get().copied()
    }

    pub fn finished(&self) -> Option<Timestamp> {
        self.state.finished.get().copied()
    }

    pub fn completed(&self) -> Option<Timestamp> {
        self.state.completed.get().copied()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn record(&self) -> TaskRecord {
        self.state.record()
    }

    pub(crate) fn erased(&self) -> Arc<dyn Dispatch> {
        self.state.clone()
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.state.id)
            .field("parallel", &self.state.parallel)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> TaskState<T> {
    fn add_dependency(&self, dependency: Arc<dyn Dispatch>) {
        let mut dependencies = self
            .dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !dependencies.iter().any(|d| d.id() == dependency.id()) {
            dependencies.push(dependency);
        }
    }

    fn run(&self) -> Result<&T> {
        let computation = self
            .computation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::AlreadyRun(self.id.clone()))?;

        self.started.get_or_init(|| self.clock.now());
        tracing::debug!(task = %self.id, "Task started");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(computation)) {
            Ok(Ok(value)) => Outcome::Finished(value),
            Ok(Err(e)) => Outcome::Faulted(Fault::new(e)),
            Err(payload) => Outcome::Faulted(Fault::from_panic(payload)),
        };

        // The outcome is published before `finished`, so anyone observing
        // `finished` also observes the result.
        match self.outcome.get_or_init(|| outcome) {
            Outcome::Finished(value) => {
                self.finished.get_or_init(|| self.clock.now());
                tracing::debug!(task = %self.id, "Task finished");
                Ok(value)
            }
            Outcome::Faulted(fault) => {
                tracing::error!(task = %self.id, error = %fault, "Task failed");
                Err(Error::Failed {
                    task: self.id.clone(),
                    source: fault.clone(),
                })
            }
        }
    }

    fn status(&self) -> TaskStatus {
        if self.fault().is_some() {
            TaskStatus::Failed
        } else if self.finished.get().is_some() {
            TaskStatus::Finished
        } else if self.started.get().is_some() {
            TaskStatus::Running
        } else if self.submitted.get().is_some() {
            TaskStatus::Submitted
        } else {
            TaskStatus::Pending
        }
    }
}

impl<T: Send + Sync + 'static> Dispatch for TaskState<T> {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn is_finished(&self) -> bool {
        self.finished.get().is_some()
    }

    fn fault(&self) -> Option<Fault> {
        match self.outcome.get() {
            Some(Outcome::Faulted(fault)) => Some(fault.clone()),
            _ => None,
        }
    }

    fn is_ready(&self) -> Result<bool> {
        for dependency in self.dependencies().iter() {
            if let Some(source) = dependency.fault() {
                return Err(Error::Blocked {
                    task: self.id.clone(),
                    dependency: dependency.id().clone(),
                    source,
                });
            }
            if !dependency.is_finished() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dispatch>> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn execute(&self) -> Result<()> {
        self.run().map(|_| ())
    }

    fn mark_submitted(&self) {
        self.submitted.get_or_init(|| self.clock.now());
    }

    fn mark_completed(&self) {
        // Inline tasks complete the moment they finish
        let finished = if self.parallel {
            None
        } else {
            self.finished.get().copied()
        };
        self.completed
            .get_or_init(|| finished.unwrap_or_else(|| self.clock.now()));
    }

    fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            status: self.status(),
            parallel: self.parallel,
            dependencies: self.dependencies().iter().map(|d| d.id().clone()).collect(),
            created: self.created,
            submitted: self.submitted.get().copied(),
            started: self.started.get().copied(),
            finished: self.finished.get().copied(),
            completed: self.completed.get().copied(),
            error: self.fault().map(|f| format!("{:#}", f.error())),
        }
    }
}

/// Builder for [`Task`]
pub struct TaskBuilder<T> {
    computation: Computation<T>,
    id: Option<TaskId>,
    dependencies: Vec<Arc<dyn Dispatch>>,
    parallel: bool,
    environment: Option<Environment>,
}

impl<T: Send + Sync + 'static> TaskBuilder<T> {
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn after<U: Send + Sync + 'static>(mut self, dependency: &Task<U>) -> Self {
        self.dependencies.push(dependency.erased());
        self
    }

    /// `false` runs the task inline on the scheduling thread
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn environment(mut self, environment: &Environment) -> Self {
        self.environment = Some(environment.clone());
        self
    }

    pub fn build(self) -> Task<T> {
        let environment = self.environment.unwrap_or_default();
        let id = self
            .id
            .unwrap_or_else(|| TaskId::new(environment.next_id()));

        let state = TaskState {
            id,
            parallel: self.parallel,
            dependencies: RwLock::new(Vec::new()),
            computation: Mutex::new(Some(self.computation)),
            created: environment.now(),
            clock: environment.clock(),
            submitted: OnceLock::new(),
            started: OnceLock::new(),
            finished: OnceLock::new(),
            completed: OnceLock::new(),
            outcome: OnceLock::new(),
        };
        for dependency in self.dependencies {
            state.add_dependency(dependency);
        }

        Task {
            state: Arc::new(state),
        }
    }
}

/// Serializable snapshot of a task's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub parallel: bool,
    pub dependencies: Vec<TaskId>,
    pub created: Timestamp,
    pub submitted: Option<Timestamp>,
    pub started: Option<Timestamp>,
    pub finished: Option<Timestamp>,
    pub completed: Option<Timestamp>,
    pub error: Option<String>,
}
