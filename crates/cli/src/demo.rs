use anyhow::{Context, Result};
use serde::Serialize;
use workflows_core::{
    EngineStatus, ExecutionEngine, Pipeline, PipelineReport, Task, TaskGroup, TaskRecord,
};

/// Everything the demo prints in `--json` mode
#[derive(Debug, Serialize)]
pub struct DemoOutput {
    pub report: PipelineReport,
    pub engine: EngineStatus,
    pub tasks: Vec<TaskRecord>,
}

/// Compute `ln(i + 1)` for `i` in `0..tasks` as independent parallel tasks
pub fn run(engine: &ExecutionEngine, tasks: u32) -> Result<DemoOutput> {
    let workers: Vec<Task<f64>> = (0..tasks)
        .map(|i| {
            let value = f64::from(i) + 1.0;
            Task::new(move || Ok(value.ln()))
        })
        .collect();

    let group = TaskGroup::builder(engine).id("logarithms").tasks(&workers).build();
    let report = Pipeline::new(group)
        .run()
        .context("Demo pipeline failed")?;

    for worker in &workers {
        if let (Some(log_value), Some(completed)) = (worker.result(), worker.completed()) {
            tracing::info!(
                completed = %completed,
                value = log_value.exp(),
                log_value,
                "Task completed"
            );
        }
    }

    Ok(DemoOutput {
        report,
        engine: engine.status(),
        tasks: workers.iter().map(Task::record).collect(),
    })
}
