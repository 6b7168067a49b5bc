use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TaskError;
use crate::variables::{deserialize_variable, EngineVariables, ProcessVariables};

/// Identidad local de una tarea (asignada por el store).
pub type LocalId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initial,
    InProgress,
    Performed,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Initial => "initial",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Performed => "performed",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Completed)
    }

    /// Transiciones válidas de la máquina de estados:
    /// initial -> in_progress -> {performed, failed}; performed -> {completed, failed}.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Initial, InProgress)
                | (InProgress, Performed)
                | (InProgress, Failed)
                | (Performed, Completed)
                | (Performed, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Una tarea externa recibida del engine y guardada localmente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTask {
    pub id: LocalId,
    /// Worker que tiene el lock; sólo ese worker puede completar/fallar la tarea.
    pub worker_id: String,
    pub topic_name: String,
    /// Id asignado por el engine.
    pub task_id: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub variables: EngineVariables,
    #[serde(default)]
    pub result_variables: ProcessVariables,
    pub status: TaskStatus,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_error: String,
    /// Cuerpo de error que devolvió el engine al completar (si hubo).
    #[serde(default)]
    pub engine_error: Option<Value>,
    #[serde(default)]
    pub history: Vec<StatusEntry>,
}

/// Datos de una tarea recién bloqueada, antes de tener id local.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub worker_id: String,
    pub topic_name: String,
    pub task_id: String,
    pub priority: Option<i64>,
    pub process_instance_id: Option<String>,
    pub variables: EngineVariables,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl ExternalTask {
    pub fn from_new(id: LocalId, new: NewTask) -> Self {
        Self {
            id,
            worker_id: new.worker_id,
            topic_name: new.topic_name,
            task_id: new.task_id,
            priority: new.priority,
            process_instance_id: new.process_instance_id,
            variables: new.variables,
            result_variables: ProcessVariables::new(),
            status: TaskStatus::Initial,
            lock_expires_at: new.lock_expires_at,
            execution_error: String::new(),
            engine_error: None,
            history: vec![StatusEntry {
                status: TaskStatus::Initial,
                at: Utc::now(),
            }],
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Vencida sii `lock_expires_at` existe y es <= `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.lock_expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Variables de entrada ya deserializadas para el handler.
    pub fn get_variables(&self) -> anyhow::Result<ProcessVariables> {
        let mut out = ProcessVariables::new();
        for (name, typed) in &self.variables {
            let value = deserialize_variable(typed).map_err(|e| {
                anyhow::anyhow!("variable '{}' contains invalid JSON: {}", name, e)
            })?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// Sólo los `value` crudos, sin parsear.
    pub fn flat_variables(&self) -> ProcessVariables {
        self.variables
            .iter()
            .map(|(name, typed)| (name.clone(), typed.value.clone()))
            .collect()
    }

    /// Aplica una transición validada y la registra en el historial.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            let message = format!(
                "The task {} is {}, it cannot move to {}.",
                self, self.status, next
            );
            return Err(if next == TaskStatus::Completed {
                TaskError::TaskNotPerformed(message)
            } else {
                TaskError::TaskPerformed(message)
            });
        }
        self.set_status(next);
        Ok(())
    }

    /// Cambia el estado sin validar (sólo para el store y para `--force`).
    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.history.push(StatusEntry {
            status,
            at: Utc::now(),
        });
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.history.iter().map(|entry| entry.status).collect()
    }
}

impl fmt::Display for ExternalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.topic_name, self.task_id)
    }
}
