//! Registro de handlers ("work units").
//!
//! Se construye una vez al arrancar y se comparte por `Arc`; el dispatcher sólo
//! lo consulta con `resolve`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::task::ExternalTask;
use crate::variables::ProcessVariables;

pub const MISSING_DOCUMENTATION: &str = "- docstring missing -";

/// Servicio externo que un handler necesita tener configurado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredService {
    pub service_type: String,
    pub description: String,
    pub alias: String,
}

impl RequiredService {
    pub fn new(service_type: &str, description: &str, alias: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            description: description.to_string(),
            alias: alias.to_string(),
        }
    }
}

/// Contrato de un handler: recibe la tarea y devuelve las variables resultado.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn perform(&self, task: &ExternalTask) -> anyhow::Result<ProcessVariables>;

    fn documentation(&self) -> &str {
        MISSING_DOCUMENTATION
    }

    fn required_services(&self) -> Vec<RequiredService> {
        Vec::new()
    }
}

/// Adaptador para handlers escritos como función async.
pub struct FnWorkUnit<F, Fut> {
    func: F,
    documentation: String,
    required_services: Vec<RequiredService>,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnWorkUnit<F, Fut>
where
    F: Fn(ExternalTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ProcessVariables>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            documentation: MISSING_DOCUMENTATION.to_string(),
            required_services: Vec::new(),
            _fut: PhantomData,
        }
    }

    pub fn with_documentation(mut self, documentation: &str) -> Self {
        self.documentation = documentation.to_string();
        self
    }

    pub fn with_required_service(mut self, service: RequiredService) -> Self {
        self.required_services.push(service);
        self
    }
}

#[async_trait]
impl<F, Fut> WorkUnit for FnWorkUnit<F, Fut>
where
    F: Fn(ExternalTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ProcessVariables>> + Send + 'static,
{
    async fn perform(&self, task: &ExternalTask) -> anyhow::Result<ProcessVariables> {
        (self.func)(task.clone()).await
    }

    fn documentation(&self) -> &str {
        &self.documentation
    }

    fn required_services(&self) -> Vec<RequiredService> {
        self.required_services.clone()
    }
}

#[derive(Clone)]
pub struct HandlerRegistration {
    pub identifier: String,
    /// Nombre para mostrar (último segmento del identificador).
    pub name: String,
    pub handler: Arc<dyn WorkUnit>,
}

impl HandlerRegistration {
    pub fn documentation(&self) -> &str {
        self.handler.documentation()
    }

    pub fn required_services(&self) -> Vec<RequiredService> {
        self.handler.required_services()
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .finish()
    }
}

/// Tabla identificador -> handler.
pub struct HandlerRegistry {
    handlers: DashMap<String, HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registra (o reemplaza) un handler. Valida la forma de la registración.
    pub fn register<W>(&self, identifier: &str, handler: W) -> Result<(), RegistryError>
    where
        W: WorkUnit + 'static,
    {
        self.register_arc(identifier, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        identifier: &str,
        handler: Arc<dyn WorkUnit>,
    ) -> Result<(), RegistryError> {
        validate_shape(identifier, handler.as_ref())?;

        let name = identifier
            .rsplit(|c| c == '.' || c == ':')
            .next()
            .unwrap_or(identifier)
            .to_string();

        if self.handlers.contains_key(identifier) {
            tracing::debug!("reemplazando handler registrado '{}'", identifier);
        }

        self.handlers.insert(
            identifier.to_string(),
            HandlerRegistration {
                identifier: identifier.to_string(),
                name,
                handler,
            },
        );
        Ok(())
    }

    /// Atajo para handlers función.
    pub fn register_fn<F, Fut>(&self, identifier: &str, func: F) -> Result<(), RegistryError>
    where
        F: Fn(ExternalTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProcessVariables>> + Send + 'static,
    {
        self.register(identifier, FnWorkUnit::new(func))
    }

    pub fn resolve(&self, identifier: &str) -> Result<Arc<dyn WorkUnit>, RegistryError> {
        self.handlers
            .get(identifier)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| RegistryError::UnknownHandler(identifier.to_string()))
    }

    pub fn registration(&self, identifier: &str) -> Option<HandlerRegistration> {
        self.handlers.get(identifier).map(|entry| entry.clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.handlers.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registraciones ordenadas por identificador.
    pub fn registrations(&self) -> Vec<HandlerRegistration> {
        let mut out: Vec<HandlerRegistration> =
            self.handlers.iter().map(|entry| entry.value().clone()).collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        out
    }
}

fn validate_shape(identifier: &str, handler: &dyn WorkUnit) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidHandlerShape {
        identifier: identifier.to_string(),
        reason,
    };

    if identifier.trim().is_empty() {
        return Err(invalid("identifier must not be empty".to_string()));
    }
    if identifier.chars().any(char::is_whitespace) {
        return Err(invalid("identifier must not contain whitespace".to_string()));
    }

    let mut seen = HashSet::new();
    for service in handler.required_services() {
        if service.alias.is_empty() {
            return Err(invalid("required service alias must not be empty".to_string()));
        }
        if !seen.insert(service.alias.clone()) {
            return Err(invalid(format!(
                "required service alias '{}' is declared twice",
                service.alias
            )));
        }
    }
    Ok(())
}
