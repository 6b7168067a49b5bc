//! Tipos y lógica compartida entre el worker y el cliente: modelo de tareas
//! externas, persistencia, cliente del engine y el pipeline
//! fetch-and-lock -> execute -> complete.

pub mod app;
pub mod completer;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extender;
pub mod failure;
pub mod fetcher;
pub mod mapping;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod variables;
pub mod work_units;

#[cfg(test)]
pub mod testing;

pub use app::App;
pub use config::Config;
pub use engine::{EngineClient, HttpEngineClient};
pub use error::{EngineError, RegistryError, TaskError};
pub use mapping::{validate_mapping, TaskMapping};
pub use pipeline::{BatchReport, Pipeline, PipelineSettings};
pub use registry::{HandlerRegistry, WorkUnit};
pub use scheduler::{Scheduler, SchedulerSettings};
pub use store::{MappingStore, MemoryStore, SqliteStore, TaskStore};
pub use task::{ExternalTask, LocalId, TaskStatus};
pub use variables::{EngineVariables, ProcessVariables, TypedValue};
