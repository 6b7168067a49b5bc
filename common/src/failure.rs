//! Registro local y reporte al engine de fallos permanentes.

use tracing::{error, info, warn};

use crate::engine::{EngineClient, FailureRequest};
use crate::error::{EngineError, TaskError};
use crate::store::TaskStore;
use crate::task::{ExternalTask, TaskStatus};

/// Última línea no vacía de un detalle de error.
pub fn last_line(detail: &str) -> &str {
    detail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// `errorMessage` es el motivo explícito o la última línea del detalle;
/// `errorDetail` es el error completo.
pub fn failure_request(worker_id: &str, detail: &str, reason: Option<&str>) -> FailureRequest {
    let message = match reason {
        Some(reason) if !reason.trim().is_empty() => reason.to_string(),
        _ => last_line(detail).to_string(),
    };
    FailureRequest {
        worker_id: worker_id.to_string(),
        error_message: message,
        error_detail: detail.to_string(),
        retries: 0,
        retry_timeout: 0,
    }
}

/// Informa al engine que la tarea falló, usando `execution_error` como detalle.
pub async fn report_failure(
    engine: &dyn EngineClient,
    task: &ExternalTask,
    reason: Option<&str>,
) -> Result<(), EngineError> {
    let request = failure_request(&task.worker_id, &task.execution_error, reason);
    info!(
        "reportando fallo de tarea id={} ({}) worker={}: {}",
        task.id, task, task.worker_id, request.error_message
    );
    engine.fail(&task.task_id, &request).await
}

/// Marca la tarea como `failed` con la traza del error, la guarda y avisa al
/// engine. Un fallo del reporte sólo se loguea; la fila local ya quedó en
/// `failed`.
pub async fn fail_task(
    store: &dyn TaskStore,
    engine: &dyn EngineClient,
    task: &mut ExternalTask,
    err: &TaskError,
) -> Result<(), TaskError> {
    task.execution_error = err.trace();

    if task.status.can_transition_to(TaskStatus::Failed) {
        task.set_status(TaskStatus::Failed);
    } else {
        warn!(
            "tarea id={} ({}) está en {}, no se puede marcar como failed",
            task.id, task, task.status
        );
    }

    store.save(task).await.map_err(TaskError::Store)?;
    warn!(
        "tarea id={} ({}) falló: {}",
        task.id,
        task,
        last_line(&task.execution_error)
    );

    if let Err(e) = report_failure(engine, task, None).await {
        error!(
            "no se pudo reportar el fallo de la tarea id={} al engine: {}",
            task.id, e
        );
    }
    Ok(())
}
