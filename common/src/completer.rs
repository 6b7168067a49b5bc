use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::{CompleteRequest, EngineClient};
use crate::error::{EngineError, TaskError};
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::task::{ExternalTask, TaskStatus};
use crate::variables::serialize_variables;

pub const CALLBACK_URL_VARIABLE: &str = "callbackUrl";

/// Reporta al engine una tarea ejecutada con éxito.
pub struct Completer {
    engine: Arc<dyn EngineClient>,
    tasks: Arc<dyn TaskStore>,
    retry: RetryPolicy,
}

impl Completer {
    pub fn new(engine: Arc<dyn EngineClient>, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            engine,
            tasks,
            retry: RetryPolicy::new(3),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Requiere `status == performed`. Reintenta sólo los 5xx; si se agotan los
    /// reintentos el cuerpo del último 5xx queda en `engine_error`. Cualquier
    /// error se devuelve al llamador, que decide cómo fallar la tarea.
    pub async fn complete(&self, task: &mut ExternalTask) -> Result<(), TaskError> {
        if task.status != TaskStatus::Performed {
            return Err(TaskError::TaskNotPerformed(format!(
                "The task {} is {}. The task should be performed before sending results",
                task, task.status
            )));
        }

        let request = CompleteRequest {
            worker_id: task.worker_id.clone(),
            variables: serialize_variables(&task.result_variables),
        };
        let engine = self.engine.as_ref();
        let task_id = task.task_id.clone();
        let mut engine_error = None;

        let result = self
            .retry
            .run_with_hook(
                || engine.complete(&task_id, &request),
                EngineError::is_transient,
                |err: &EngineError, attempts| {
                    error!(
                        "complete de la tarea {} falló tras {} intento(s): {}",
                        task_id, attempts, err
                    );
                    engine_error = err.body().cloned();
                },
            )
            .await;

        if let Err(err) = result {
            if engine_error.is_some() {
                task.engine_error = engine_error;
                self.tasks.save(task).await.map_err(TaskError::Store)?;
            }
            return Err(err.into());
        }

        task.advance(TaskStatus::Completed)?;
        self.tasks.save(task).await.map_err(TaskError::Store)?;
        info!("tarea id={} ({}) completada en el engine", task.id, task);

        self.send_callback(task).await;
        Ok(())
    }

    /// POST vacío a `callbackUrl`, si la variable existe. Nunca es fatal.
    async fn send_callback(&self, task: &ExternalTask) {
        let variables = task.flat_variables();
        let url = match variables.get(CALLBACK_URL_VARIABLE).and_then(|v| v.as_str()) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return,
        };
        match self.engine.send_callback(&url).await {
            Ok(()) => info!("callback enviado a {} para tarea id={}", url, task.id),
            Err(e) => warn!(
                "callback a {} para tarea id={} falló: {}",
                url, task.id, e
            ),
        }
    }
}
