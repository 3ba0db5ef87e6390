use super::graph::DependencyGraph;
use super::task::{Dispatch, Task, TaskRecord};
use crate::engine::{ExecutionEngine, ExecutionHandle};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::types::{GroupId, TaskId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Re-check interval bounds for tasks waiting on another group
const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(20);

/// What runs after a group settles
#[derive(Default)]
pub enum Next {
    /// No further group
    #[default]
    Terminal,
    /// Builds the next group from the completed one. Evaluated exactly once.
    Continue(Box<dyn FnOnce(&TaskGroup) -> Option<TaskGroup> + Send>),
}

impl Next {
    pub fn continue_with<F>(factory: F) -> Self
    where
        F: FnOnce(&TaskGroup) -> Option<TaskGroup> + Send + 'static,
    {
        Next::Continue(Box::new(factory))
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Next::Terminal => write!(f, "Terminal"),
            Next::Continue(_) => write!(f, "Continue(..)"),
        }
    }
}

/// A set of tasks executed under one dispatch loop and one join barrier
pub struct TaskGroup {
    id: GroupId,
    tasks: Vec<Arc<dyn Dispatch>>,
    engine: ExecutionEngine,
    environment: Environment,
    next: Next,
}

/// Completion event sent by a parallel task once `completed` is recorded
struct Settled {
    position: usize,
    faulted: bool,
}

impl TaskGroup {
    pub fn builder(engine: &ExecutionEngine) -> TaskGroupBuilder {
        TaskGroupBuilder {
            engine: engine.clone(),
            id: None,
            tasks: Vec::new(),
            next: Next::Terminal,
            environment: None,
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id().clone()).collect()
    }

    /// Lifecycle snapshot of every member
    pub fn records(&self) -> Vec<TaskRecord> {
        self.tasks.iter().map(|t| t.record()).collect()
    }

    pub fn has_next(&self) -> bool {
        matches!(self.next, Next::Continue(_))
    }

    pub(crate) fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Run every member to completion, respecting dependencies.
    ///
    /// Blocks the calling thread until every task has settled. Parallel tasks
    /// go to the engine; inline tasks run here. A task is handed out only
    /// once all its dependencies have settled, and the loop sleeps on
    /// completion events rather than polling. A task waiting on a task of
    /// another group is re-checked until that dependency settles.
    ///
    /// A faulted dependency or a failing inline task aborts the run at once:
    /// remaining tasks are never executed and parallel tasks already in
    /// flight are left running, unjoined. Faults of parallel tasks with no
    /// dependents are collected at the join barrier and returned together as
    /// [`Error::Join`] once every handle has settled.
    ///
    /// Must not be called from inside an async context.
    pub fn run(&self) -> Result<()> {
        let span = tracing::info_span!("task_group", group = %self.id);
        let _enter = span.enter();
        tracing::info!(tasks = self.tasks.len(), "Running task group");

        let mut graph = DependencyGraph::build(&self.tasks);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Settled>();

        let mut ready: VecDeque<usize> = graph.take_entry_points().into();
        let mut waiting: VecDeque<usize> = VecDeque::new();
        let mut in_flight: Vec<(usize, ExecutionHandle<()>)> = Vec::new();
        let mut outstanding = 0usize;
        let mut undispatched = self.tasks.iter().filter(|t| !t.is_done()).count();
        let mut backoff = MIN_BACKOFF;

        loop {
            while let Some(position) = ready.pop_front() {
                let task = &self.tasks[position];

                match task.is_ready() {
                    Ok(true) => {}
                    // A dependency has not settled yet: it lives outside this
                    // group, or a faulted sibling released this task early
                    Ok(false) => {
                        waiting.push_back(position);
                        continue;
                    }
                    Err(e) => return Err(self.abort(e, &in_flight)),
                }
                undispatched -= 1;

                if task.is_parallel() {
                    if self.engine.is_closed() {
                        return Err(self.abort(Error::EngineClosed, &in_flight));
                    }

                    task.mark_submitted();
                    tracing::debug!(task = %task.id(), "Submitting task");

                    let dispatched = Arc::clone(task);
                    let events = events_tx.clone();
                    let handle = self.engine.submit(move || {
                        let result = dispatched.execute();
                        dispatched.mark_completed();
                        // The coordinator is gone if the run was aborted
                        let _ = events.send(Settled {
                            position,
                            faulted: result.is_err(),
                        });
                        result
                    });

                    in_flight.push((position, handle));
                    outstanding += 1;
                } else {
                    tracing::debug!(task = %task.id(), "Running task inline");

                    if let Err(e) = task.execute() {
                        return Err(self.abort(e, &in_flight));
                    }
                    task.mark_completed();
                    ready.extend(graph.settle(position, false));
                    ready.extend(waiting.drain(..));
                }
            }

            if undispatched == 0 {
                break;
            }

            if waiting.is_empty() {
                if outstanding == 0 {
                    let pending: Vec<TaskId> = graph
                        .unreleased()
                        .map(|p| self.tasks[p].id().clone())
                        .collect();
                    let cyclic = graph.is_cyclic();
                    tracing::error!(pending = pending.len(), cyclic, "Task group stalled");

                    return Err(Error::Stalled {
                        group: self.id.clone(),
                        pending,
                        cyclic,
                    });
                }

                let Some(event) = events_rx.blocking_recv() else {
                    return Err(Error::HandleDropped);
                };
                outstanding -= 1;
                ready.extend(graph.settle(event.position, event.faulted));
                backoff = MIN_BACKOFF;
            } else {
                // Dependencies outside this group settle without sending an
                // event here, so waiting tasks are re-checked on a timer
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            while let Ok(event) = events_rx.try_recv() {
                outstanding -= 1;
                ready.extend(graph.settle(event.position, event.faulted));
            }
            ready.extend(waiting.drain(..));
        }

        self.join(in_flight)
    }

    /// Consume the group and evaluate its continuation
    pub fn into_next(mut self) -> Option<TaskGroup> {
        match std::mem::take(&mut self.next) {
            Next::Terminal => None,
            Next::Continue(factory) => factory(&self),
        }
    }

    fn join(&self, in_flight: Vec<(usize, ExecutionHandle<()>)>) -> Result<()> {
        let faults: Vec<Error> = in_flight
            .into_iter()
            .filter_map(|(_, handle)| handle.join().err())
            .collect();

        if faults.is_empty() {
            tracing::info!("Task group completed");
            Ok(())
        } else {
            tracing::error!(faults = faults.len(), "Task group failed at join");
            Err(Error::Join {
                group: self.id.clone(),
                faults,
            })
        }
    }

    fn abort(&self, error: Error, in_flight: &[(usize, ExecutionHandle<()>)]) -> Error {
        let abandoned: Vec<&TaskId> = in_flight
            .iter()
            .map(|(position, _)| &self.tasks[*position])
            .filter(|task| !task.is_done())
            .map(|task| task.id())
            .collect();

        if !abandoned.is_empty() {
            tracing::warn!(
                abandoned = ?abandoned,
                "Aborting task group; in-flight tasks left running"
            );
        }
        tracing::error!(error = %error, "Task group aborted");
        error
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("tasks", &self.task_ids())
            .field("next", &self.next)
            .finish()
    }
}

/// Builder for [`TaskGroup`]
pub struct TaskGroupBuilder {
    engine: ExecutionEngine,
    id: Option<GroupId>,
    tasks: Vec<Arc<dyn Dispatch>>,
    next: Next,
    environment: Option<Environment>,
}

impl TaskGroupBuilder {
    pub fn id(mut self, id: impl Into<GroupId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn task<T: Send + Sync + 'static>(mut self, task: &Task<T>) -> Self {
        self.tasks.push(task.erased());
        self
    }

    pub fn tasks<T: Send + Sync + 'static>(mut self, tasks: &[Task<T>]) -> Self {
        self.tasks.extend(tasks.iter().map(Task::erased));
        self
    }

    /// Build the next group once this one has completed
    pub fn next<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&TaskGroup) -> Option<TaskGroup> + Send + 'static,
    {
        self.next = Next::continue_with(factory);
        self
    }

    pub fn environment(mut self, environment: &Environment) -> Self {
        self.environment = Some(environment.clone());
        self
    }

    pub fn build(self) -> TaskGroup {
        let environment = self.environment.unwrap_or_default();
        let id = self
            .id
            .unwrap_or_else(|| GroupId::new(environment.next_id()));

        // Members form a set keyed by task id
        let mut seen = HashSet::new();
        let tasks = self
            .tasks
            .into_iter()
            .filter(|t| seen.insert(t.id().clone()))
            .collect();

        TaskGroup {
            id,
            tasks,
            engine: self.engine,
            environment,
            next: self.next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{SequentialIds, SteppingClock};
    use crate::types::TaskStatus;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(4).unwrap()
    }

    fn stepping_env() -> Environment {
        let origin = DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap();
        Environment::system()
            .with_clock(Arc::new(SteppingClock::new(origin, 1)))
            .with_ids(Arc::new(SequentialIds::new("t")))
    }

    fn greeting(env: &Environment, name: &'static str) -> Task<String> {
        Task::builder(move || Ok(format!("Hello from task {}", name)))
            .id(name)
            .environment(env)
            .build()
    }

    #[test]
    fn test_diamond_completes_in_dependency_order() {
        let env = stepping_env();
        let a = greeting(&env, "A");
        let b = greeting(&env, "B");
        let c = greeting(&env, "C");
        let d = greeting(&env, "D");
        b.after(&a);
        c.after(&a);
        d.after_all(&[b.clone(), c.clone()]);

        let group = TaskGroup::builder(&engine())
            .tasks(&[d.clone(), c.clone(), b.clone(), a.clone()])
            .build();
        group.run().unwrap();

        assert!(b.completed().unwrap() > a.completed().unwrap());
        assert!(c.completed().unwrap() > a.completed().unwrap());
        assert!(d.completed().unwrap() > b.completed().unwrap());
        assert!(d.completed().unwrap() > c.completed().unwrap());
        assert_eq!(d.result().map(String::as_str), Some("Hello from task D"));
    }

    #[test]
    fn test_fan_in_starts_after_all_dependencies_finish() {
        let env = stepping_env();
        let slow = Task::builder(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(1)
        })
        .environment(&env)
        .build();
        let fast = Task::builder(|| Ok(2)).environment(&env).build();
        let sum = Task::builder(|| Ok(3))
            .environment(&env)
            .after(&slow)
            .after(&fast)
            .build();

        TaskGroup::builder(&engine())
            .environment(&env)
            .tasks(&[sum.clone(), slow.clone(), fast.clone()])
            .build()
            .run()
            .unwrap();

        let started = sum.started().unwrap();
        assert!(started > slow.finished().unwrap());
        assert!(started > fast.finished().unwrap());
        assert!(sum.submitted().unwrap() > slow.completed().unwrap());
    }

    #[test]
    fn test_inline_and_parallel_mix() {
        let env = stepping_env();
        let coordinator = std::thread::current().id();

        let load = Task::builder(move || Ok(std::thread::current().id() == coordinator))
            .environment(&env)
            .parallel(false)
            .build();
        let transform = Task::builder(|| {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            Ok(name.starts_with("workflows-worker"))
        })
        .environment(&env)
        .after(&load)
        .build();
        let store = Task::builder(|| Ok(true))
            .environment(&env)
            .after(&transform)
            .parallel(false)
            .build();

        TaskGroup::builder(&engine())
            .tasks(&[store.clone(), transform.clone(), load.clone()])
            .build()
            .run()
            .unwrap();

        assert_eq!(load.result(), Some(&true));
        assert_eq!(transform.result(), Some(&true));
        assert!(load.submitted().is_none());
        assert_eq!(load.completed(), load.finished());
        assert!(transform.submitted().is_some());
        assert!(store.completed().unwrap() > transform.completed().unwrap());
    }

    #[test]
    fn test_independent_tasks_run_concurrently() {
        // Deadlocks unless all three run at once
        let barrier = Arc::new(Barrier::new(3));
        let tasks: Vec<Task<()>> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                Task::new(move || {
                    barrier.wait();
                    Ok(())
                })
            })
            .collect();

        let engine = ExecutionEngine::new(3).unwrap();
        TaskGroup::builder(&engine).tasks(&tasks).build().run().unwrap();

        assert!(tasks.iter().all(Task::is_finished));
        assert_eq!(engine.status().largest_pool_size, 3);
    }

    #[test]
    fn test_fault_short_circuits_dependents() {
        let fetch: Task<u32> = Task::builder(|| Err(anyhow::anyhow!("connection reset")))
            .id("fetch")
            .build();
        let parse = Task::builder(|| Ok(1)).id("parse").after(&fetch).build();
        let report = Task::builder(|| Ok(2)).id("report").after(&parse).build();

        let error = TaskGroup::builder(&engine())
            .tasks(&[report.clone(), parse.clone(), fetch.clone()])
            .build()
            .run()
            .unwrap_err();

        match &error {
            Error::Blocked {
                task, dependency, ..
            } => {
                assert_eq!(task.as_str(), "parse");
                assert_eq!(dependency.as_str(), "fetch");
            }
            other => panic!("expected blocked, got {:?}", other),
        }
        assert_eq!(error.fault().unwrap().to_string(), "connection reset");
        assert!(!parse.is_finished());
        assert!(!report.is_finished());
        assert_eq!(report.status(), TaskStatus::Pending);
        assert_eq!(fetch.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_inline_failure_aborts_without_joining() {
        let slow = Task::builder(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok("late")
        })
        .id("slow")
        .build();
        let broken: Task<&'static str> = Task::builder(|| Err(anyhow::anyhow!("bad config")))
            .id("broken")
            .parallel(false)
            .build();
        let never = Task::builder(|| Ok("never")).id("never").after(&broken).build();

        let group = TaskGroup::builder(&engine())
            .task(&slow)
            .task(&broken)
            .task(&never)
            .build();
        let error = group.run().unwrap_err();

        assert!(matches!(&error, Error::Failed { task, .. } if task.as_str() == "broken"));
        assert!(!slow.is_finished(), "in-flight task must not be joined");
        assert!(never.started().is_none());

        // The abandoned task still runs to completion in the background
        let deadline = Instant::now() + Duration::from_secs(5);
        while !slow.is_done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(slow.result(), Some(&"late"));
    }

    #[test]
    fn test_parallel_faults_are_aggregated_at_join() {
        let ok = Task::builder(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(1)
        })
        .id("ok")
        .build();
        let first: Task<i32> = Task::builder(|| Err(anyhow::anyhow!("first")))
            .id("first")
            .build();
        let second: Task<i32> = Task::builder(|| panic!("second"))
            .id("second")
            .build();

        let error = TaskGroup::builder(&engine())
            .id("stage")
            .tasks(&[ok.clone(), first.clone(), second.clone()])
            .build()
            .run()
            .unwrap_err();

        match error {
            Error::Join { group, faults } => {
                assert_eq!(group.to_string(), "stage");
                let mut failed: Vec<String> = faults
                    .iter()
                    .filter_map(|f| f.task().map(|t| t.to_string()))
                    .collect();
                failed.sort();
                assert_eq!(failed, vec!["first", "second"]);
            }
            other => panic!("expected join error, got {:?}", other),
        }
        // The barrier waited for the successful sibling
        assert!(ok.is_finished());
        assert!(first.completed().is_some());
        assert!(second.completed().is_some());
    }

    #[test]
    fn test_cycle_stalls_instead_of_spinning() {
        let a = Task::builder(|| Ok(1)).id("a").build();
        let b = Task::builder(|| Ok(2)).id("b").after(&a).build();
        let free = Task::builder(|| Ok(3)).id("free").build();
        a.after(&b);

        let error = TaskGroup::builder(&engine())
            .tasks(&[a.clone(), b.clone(), free.clone()])
            .build()
            .run()
            .unwrap_err();

        match error {
            Error::Stalled {
                mut pending,
                cyclic,
                ..
            } => {
                pending.sort();
                assert_eq!(pending, vec![TaskId::new("a"), TaskId::new("b")]);
                assert!(cyclic);
            }
            other => panic!("expected stall, got {:?}", other),
        }
        assert!(free.is_finished());
    }

    #[test]
    fn test_waits_for_dependency_running_in_another_group() {
        let env = stepping_env();
        let upstream = Task::builder(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(1)
        })
        .id("upstream")
        .environment(&env)
        .build();
        let downstream = Task::builder(|| Ok(2))
            .id("downstream")
            .environment(&env)
            .after(&upstream)
            .build();

        let other = TaskGroup::builder(&engine()).id("other").task(&upstream).build();
        let background = std::thread::spawn(move || other.run());

        TaskGroup::builder(&engine())
            .id("mine")
            .task(&downstream)
            .build()
            .run()
            .unwrap();
        background.join().unwrap().unwrap();

        assert!(downstream.started().unwrap() > upstream.finished().unwrap());
        assert_eq!(downstream.result(), Some(&2));
    }

    #[test]
    fn test_early_release_by_faulted_sibling_still_blocks() {
        let slow = Task::builder(|| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(1)
        })
        .id("slow")
        .build();
        let failed: Task<i32> = Task::builder(|| Err(anyhow::anyhow!("quota exceeded")))
            .id("failed")
            .build();
        let merge = Task::builder(|| Ok(3))
            .id("merge")
            .after(&slow)
            .after(&failed)
            .build();

        let error = TaskGroup::builder(&engine())
            .tasks(&[slow.clone(), failed.clone(), merge.clone()])
            .build()
            .run()
            .unwrap_err();

        assert!(matches!(
            &error,
            Error::Blocked { task, dependency, .. }
                if task.as_str() == "merge" && dependency.as_str() == "failed"
        ));
        assert!(slow.is_finished());
        assert!(merge.started().is_none());
    }

    #[test]
    fn test_parallel_task_can_run_a_nested_group() {
        let engine = engine();
        let nested_engine = engine.clone();

        let outer = Task::new(move || {
            let leaf = Task::new(|| Ok(20));
            TaskGroup::builder(&nested_engine).task(&leaf).build().run()?;
            Ok(leaf.result().copied().unwrap_or_default() + 1)
        });

        TaskGroup::builder(&engine).task(&outer).build().run().unwrap();
        assert_eq!(outer.result(), Some(&21));
    }

    #[test]
    fn test_settled_external_dependency_is_ready() {
        let previous = Task::builder(|| Ok(10)).id("previous").build();
        previous.run().unwrap();
        let current = Task::builder(|| Ok(11)).after(&previous).build();

        TaskGroup::builder(&engine()).task(&current).build().run().unwrap();
        assert!(current.is_finished());
    }

    #[test]
    fn test_barrier_waits_for_every_task() {
        let tasks: Vec<Task<u64>> = (0..16)
            .map(|i| {
                Task::new(move || {
                    std::thread::sleep(Duration::from_millis(i % 4 * 5));
                    Ok(i)
                })
            })
            .collect();

        let group = TaskGroup::builder(&engine()).tasks(&tasks).build();
        group.run().unwrap();

        assert!(tasks.iter().all(|t| t.is_finished() && t.completed().is_some()));
        assert!(group
            .records()
            .iter()
            .all(|r| r.status == TaskStatus::Finished));
    }

    #[test]
    fn test_rerun_never_executes_a_task_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let group = TaskGroup::builder(&engine())
            .task(&task)
            .task(&task)
            .build();
        assert_eq!(group.len(), 1);

        group.run().unwrap();
        group.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_group_completes() {
        let group = TaskGroup::builder(&engine()).build();
        assert!(group.is_empty());
        group.run().unwrap();
        assert!(group.into_next().is_none());
    }
}
