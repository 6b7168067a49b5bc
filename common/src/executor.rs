//! Dispatch de una tarea guardada a su handler.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::EngineClient;
use crate::error::TaskError;
use crate::extender::LockExtender;
use crate::failure::fail_task;
use crate::registry::{HandlerRegistry, WorkUnit};
use crate::store::{CasOutcome, MappingStore, TaskStore};
use crate::task::{ExternalTask, LocalId, TaskStatus};

/// Resultado de `Executor::execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// El handler corrió y la tarea quedó en `performed`.
    Performed(ExternalTask),
    /// La tarea no estaba en `initial` (otro worker ya la tomó); no se hizo nada.
    Skipped(TaskStatus),
}

pub struct Executor {
    tasks: Arc<dyn TaskStore>,
    mappings: Arc<dyn MappingStore>,
    registry: Arc<HandlerRegistry>,
    engine: Arc<dyn EngineClient>,
    extender: LockExtender,
}

impl Executor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        mappings: Arc<dyn MappingStore>,
        registry: Arc<HandlerRegistry>,
        engine: Arc<dyn EngineClient>,
        extender: LockExtender,
    ) -> Self {
        Self {
            tasks,
            mappings,
            registry,
            engine,
            extender,
        }
    }

    /// Ejecuta la tarea `id`:
    /// 1. CAS `initial -> in_progress` (si falla, se ignora con un warning)
    /// 2. resuelve el handler del topic
    /// 3. extiende el lock si venció
    /// 4. corre el handler y guarda el resultado en `performed`
    ///
    /// Cualquier fallo permanente deja la tarea en `failed` y se reporta al engine
    /// antes de devolver el error.
    pub async fn execute(&self, id: LocalId) -> Result<Dispatch, TaskError> {
        let mut task = match self
            .tasks
            .compare_and_swap_status(id, TaskStatus::Initial, TaskStatus::InProgress)
            .await
            .map_err(TaskError::Store)?
        {
            CasOutcome::Swapped(task) => task,
            CasOutcome::Mismatch(status) => {
                warn!(
                    "tarea id={} ya está en {}, no se vuelve a ejecutar",
                    id, status
                );
                return Ok(Dispatch::Skipped(status));
            }
            CasOutcome::Missing => return Err(TaskError::NotFound(id)),
        };
        debug!("tarea id={} ({}) en progreso", task.id, task);

        let handler = match self.resolve(&task).await {
            Ok(handler) => handler,
            Err(err) => return self.abort(&mut task, err).await,
        };

        // si el lock se vence acá, el extender ya marcó la tarea como failed
        self.extender.ensure_lock(&mut task).await?;

        let result = run_handler(handler, &task).await;
        let variables = match result {
            Ok(variables) => variables,
            Err(err) => return self.abort(&mut task, err).await,
        };

        if task.is_expired() {
            warn!(
                "lock de la tarea id={} ({}) venció durante la ejecución",
                task.id, task
            );
            self.extender.extend(&mut task).await?;
        }

        task.result_variables = variables;
        task.advance(TaskStatus::Performed)?;
        self.tasks.save(&task).await.map_err(TaskError::Store)?;
        info!("tarea id={} ({}) ejecutada", task.id, task);

        Ok(Dispatch::Performed(task))
    }

    async fn resolve(&self, task: &ExternalTask) -> Result<Arc<dyn WorkUnit>, TaskError> {
        let mapping = self
            .mappings
            .mapping_for(&task.topic_name)
            .await
            .map_err(TaskError::Store)?
            .filter(|mapping| mapping.active)
            .ok_or_else(|| {
                TaskError::NoCallback(format!(
                    "Could not find a topic/callback mapping for topic '{}'.",
                    task.topic_name
                ))
            })?;

        self.registry
            .resolve(&mapping.callback)
            .map_err(|e| TaskError::NoCallback(e.to_string()))
    }

    async fn abort(&self, task: &mut ExternalTask, err: TaskError) -> Result<Dispatch, TaskError> {
        fail_task(self.tasks.as_ref(), self.engine.as_ref(), task, &err).await?;
        Err(err)
    }
}

/// Corre el handler en su propia tarea de tokio; un panic cuenta como error
/// del handler.
async fn run_handler(
    handler: Arc<dyn WorkUnit>,
    task: &ExternalTask,
) -> Result<crate::variables::ProcessVariables, TaskError> {
    let task = task.clone();
    match tokio::spawn(async move { handler.perform(&task).await }).await {
        Ok(result) => result.map_err(TaskError::Handler),
        Err(join_err) => Err(TaskError::Handler(anyhow::anyhow!(
            "handler panicked: {}",
            join_err
        ))),
    }
}
