// Core scheduling engine for staged, dependency-aware task execution

pub mod engine;
pub mod env;
pub mod error;
pub mod time;
pub mod types;
pub mod workflow;

pub use engine::{EngineConfig, EngineStatus, ExecutionEngine, ExecutionHandle};
pub use env::{Clock, Environment, IdGenerator};
pub use error::{Error, Fault, Result};
pub use time::Timestamp;
pub use types::*;
pub use workflow::{Next, Pipeline, PipelineReport, Task, TaskGroup, TaskRecord};
