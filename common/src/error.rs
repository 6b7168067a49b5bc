use serde_json::Value;
use thiserror::Error;

use crate::task::LocalId;

/// Errores al hablar con el engine BPM por HTTP.
#[derive(Debug, Error)]
pub enum EngineError {
    /// El engine respondió con un status no exitoso.
    #[error("{status} {} for url: {url}", status_label(.status))]
    Status {
        status: u16,
        url: String,
        /// Cuerpo JSON de la respuesta, si el engine mandó uno.
        body: Option<Value>,
    },

    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid engine response: {0}")]
    InvalidResponse(String),
}

fn status_label(status: &u16) -> &'static str {
    if *status >= 500 {
        "Server Error"
    } else {
        "Client Error"
    }
}

impl EngineError {
    pub fn status(&self) -> Option<u16> {
        match self {
            EngineError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Sólo los 5xx se consideran transitorios (conflictos de optimistic locking
    /// dentro del engine, por ejemplo).
    pub fn is_transient(&self) -> bool {
        matches!(self.status(), Some(status) if status >= 500)
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            EngineError::Status { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

/// Conjunto cerrado de errores del pipeline de una tarea.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No hay mapping activo para el topic, o el callback no está registrado.
    #[error("{0}")]
    NoCallback(String),

    /// El lock venció y no se pudo extender.
    #[error("{0}")]
    TaskExpired(String),

    /// Guardas contra llamadas fuera de orden (bug de scheduling).
    #[error("{0}")]
    TaskPerformed(String),

    #[error("{0}")]
    TaskNotPerformed(String),

    #[error("task {0} does not exist in the local store")]
    NotFound(LocalId),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Error devuelto por el handler; se guarda tal cual con su cadena de causas.
    #[error("{0:#}")]
    Handler(anyhow::Error),

    #[error("task store error: {0:#}")]
    Store(anyhow::Error),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::NoCallback(_) => "NoCallback",
            TaskError::TaskExpired(_) => "TaskExpired",
            TaskError::TaskPerformed(_) => "TaskPerformed",
            TaskError::TaskNotPerformed(_) => "TaskNotPerformed",
            TaskError::NotFound(_) => "NotFound",
            TaskError::Engine(err) if err.is_transient() => "TransientEngineError",
            TaskError::Engine(_) => "EngineError",
            TaskError::Handler(_) => "HandlerError",
            TaskError::Store(_) => "StoreError",
        }
    }

    /// Mensaje de nivel superior, sin la cadena de causas.
    fn headline(&self) -> String {
        match self {
            TaskError::Handler(err) => err.to_string(),
            TaskError::Store(err) => format!("task store error: {err}"),
            other => other.to_string(),
        }
    }

    fn causes(&self) -> Vec<String> {
        match self {
            TaskError::Handler(err) | TaskError::Store(err) => {
                err.chain().skip(1).map(|cause| cause.to_string()).collect()
            }
            other => {
                let mut causes = Vec::new();
                let mut source = std::error::Error::source(other);
                while let Some(cause) = source {
                    causes.push(cause.to_string());
                    source = cause.source();
                }
                causes
            }
        }
    }

    /// Texto que se guarda en `execution_error`.
    ///
    /// Las causas van de la más interna a la más externa y la última línea es
    /// siempre `<Kind>: <mensaje>`, que es lo que recibe el engine como motivo.
    pub fn trace(&self) -> String {
        let mut lines: Vec<String> = self
            .causes()
            .into_iter()
            .rev()
            .map(|cause| format!("  caused by: {cause}"))
            .collect();
        if !lines.is_empty() {
            lines.insert(0, "Error trace (innermost cause first):".to_string());
        }
        lines.push(format!("{}: {}", self.kind(), self.headline()));
        lines.join("\n")
    }
}

/// Errores del registro de handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Callback '{0}' is not in the provided registry.")]
    UnknownHandler(String),

    #[error("invalid handler registration '{identifier}': {reason}")]
    InvalidHandlerShape { identifier: String, reason: String },
}
