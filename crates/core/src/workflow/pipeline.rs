use super::group::TaskGroup;
use crate::error::Result;
use crate::time::Timestamp;
use crate::types::{GroupId, PipelineId};
use serde::{Deserialize, Serialize};

/// A lazily unfolding chain of task groups.
///
/// Each group runs to completion before the next one is built, so a later
/// stage can be constructed from the results of the stage before it.
#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    root: TaskGroup,
}

/// One completed stage of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub group: GroupId,
    pub tasks: usize,
    pub started: Timestamp,
    pub finished: Timestamp,
}

/// Outcome of a successful pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: PipelineId,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    /// Wall time from the first stage's start to the last stage's end
    pub fn duration_ms(&self) -> i64 {
        match (self.stages.first(), self.stages.last()) {
            (Some(first), Some(last)) => last.finished.duration_ms(&first.started),
            _ => 0,
        }
    }
}

impl Pipeline {
    /// Pipeline starting at `root`, with an id from the root's environment
    pub fn new(root: TaskGroup) -> Self {
        let id = PipelineId::new(root.environment().next_id());
        Self { id, root }
    }

    pub fn with_id(id: impl Into<PipelineId>, root: TaskGroup) -> Self {
        Self {
            id: id.into(),
            root,
        }
    }

    pub fn id(&self) -> &PipelineId {
        &self.id
    }

    /// Run every stage in order.
    ///
    /// A stage's fault is returned unchanged and no later stage is built.
    pub fn run(self) -> Result<PipelineReport> {
        let span = tracing::info_span!("pipeline", pipeline = %self.id);
        let _enter = span.enter();
        tracing::info!("Starting pipeline");

        let mut stages = Vec::new();
        let mut current = Some(self.root);

        while let Some(group) = current {
            let started = group.environment().now();
            group.run()?;
            let finished = group.environment().now();

            stages.push(StageReport {
                group: group.id().clone(),
                tasks: group.len(),
                started,
                finished,
            });

            current = group.into_next();
        }

        tracing::info!(stages = stages.len(), "Pipeline completed");

        Ok(PipelineReport {
            pipeline: self.id,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionEngine;
    use crate::error::Error;
    use crate::workflow::task::Task;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_logarithm_tasks_recover_their_inputs() {
        let engine = ExecutionEngine::from_available_parallelism().unwrap();
        let tasks: Vec<Task<f64>> = (0..100)
            .map(|i| {
                let value = f64::from(i + 1);
                Task::new(move || Ok(value.ln()))
            })
            .collect();

        let group = TaskGroup::builder(&engine).tasks(&tasks).build();
        let report = Pipeline::new(group).run().unwrap();
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].tasks, 100);

        for (i, task) in tasks.iter().enumerate() {
            let submitted = task.submitted().unwrap();
            let started = task.started().unwrap();
            let finished = task.finished().unwrap();
            assert!(started >= submitted);
            assert!(finished >= started);

            let recovered = task.result().unwrap().exp();
            assert!((recovered - (i + 1) as f64).abs() < 1e-9);
        }
        assert_eq!(engine.status().task_count, 100);
    }

    #[test]
    fn test_next_stage_is_built_from_previous_results() {
        let engine = ExecutionEngine::new(4).unwrap();
        let built = Arc::new(AtomicBool::new(false));
        let totals: Arc<Mutex<Option<Task<u64>>>> = Arc::new(Mutex::new(None));

        let inputs: Vec<Task<u64>> = (1..=4).map(|n| Task::new(move || Ok(n * 10))).collect();

        let stage_inputs = inputs.clone();
        let stage_built = Arc::clone(&built);
        let stage_totals = Arc::clone(&totals);
        let next_engine = engine.clone();
        let first = TaskGroup::builder(&engine)
            .id("extract")
            .tasks(&inputs)
            .next(move |completed| {
                assert_eq!(completed.id().to_string(), "extract");
                assert!(stage_inputs.iter().all(Task::is_finished));
                stage_built.store(true, Ordering::SeqCst);

                let values: Vec<u64> = stage_inputs
                    .iter()
                    .filter_map(|t| t.result().copied())
                    .collect();
                let total = Task::new(move || Ok(values.iter().sum::<u64>()));
                *stage_totals.lock().unwrap() = Some(total.clone());

                Some(TaskGroup::builder(&next_engine).id("load").task(&total).build())
            })
            .build();

        assert!(first.has_next());
        assert!(!built.load(Ordering::SeqCst));

        let report = Pipeline::with_id("etl", first).run().unwrap();

        assert!(built.load(Ordering::SeqCst));
        let stage_ids: Vec<String> = report.stages.iter().map(|s| s.group.to_string()).collect();
        assert_eq!(stage_ids, vec!["extract", "load"]);
        assert!(report.stages[1].started >= report.stages[0].finished);
        assert_eq!(report.pipeline.to_string(), "etl");

        let total = totals.lock().unwrap().clone().unwrap();
        assert_eq!(total.result(), Some(&100));
    }

    #[test]
    fn test_fault_aborts_remaining_stages() {
        let engine = ExecutionEngine::new(2).unwrap();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&factory_calls);

        let broken: Task<()> = Task::builder(|| Err(anyhow::anyhow!("schema mismatch")))
            .id("validate")
            .build();
        let next_engine = engine.clone();
        let group = TaskGroup::builder(&engine)
            .task(&broken)
            .next(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(TaskGroup::builder(&next_engine).build())
            })
            .build();

        let error = Pipeline::new(group).run().unwrap_err();

        assert!(matches!(error, Error::Join { ref faults, .. } if faults.len() == 1));
        assert_eq!(error.fault().unwrap().to_string(), "schema mismatch");
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_continuation_may_end_the_pipeline() {
        let engine = ExecutionEngine::new(1).unwrap();
        let only = Task::new(|| Ok(1));
        let group = TaskGroup::builder(&engine)
            .task(&only)
            .next(|_| None)
            .build();

        let report = Pipeline::new(group).run().unwrap();
        assert_eq!(report.stages.len(), 1);
        assert!(report.duration_ms() >= 0);
    }
}
