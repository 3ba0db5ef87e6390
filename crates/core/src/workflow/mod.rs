mod graph;
pub mod group;
pub mod pipeline;
pub mod task;

pub use group::{Next, TaskGroup, TaskGroupBuilder};
pub use pipeline::{Pipeline, PipelineReport, StageReport};
pub use task::{Task, TaskBuilder, TaskRecord};
