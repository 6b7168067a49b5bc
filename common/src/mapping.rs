use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::RegistryError;
use crate::registry::HandlerRegistry;

/// Ruteo topic -> handler. Lo editan los administradores (CLI `mappings`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMapping {
    pub topic_name: String,
    pub callback: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Alias de servicios configurados para este topic.
    #[serde(default)]
    pub default_services: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl TaskMapping {
    pub fn new(topic_name: &str, callback: &str) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            callback: callback.to_string(),
            active: true,
            default_services: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("topic name must not be empty")]
    EmptyTopic,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("duplicate service alias '{0}' in the mapping")]
    DuplicateAlias(String),

    #[error("missing services with aliases: {}", .0.join(", "))]
    MissingServices(Vec<String>),
}

/// Valida un mapping contra el registro: el callback tiene que existir y todos
/// los alias requeridos por el handler tienen que estar configurados.
pub fn validate_mapping(
    mapping: &TaskMapping,
    registry: &HandlerRegistry,
) -> Result<(), MappingError> {
    if mapping.topic_name.trim().is_empty() {
        return Err(MappingError::EmptyTopic);
    }

    let registration = registry
        .registration(&mapping.callback)
        .ok_or_else(|| RegistryError::UnknownHandler(mapping.callback.clone()))?;

    let mut configured = HashSet::new();
    for alias in &mapping.default_services {
        if !configured.insert(alias.as_str()) {
            return Err(MappingError::DuplicateAlias(alias.clone()));
        }
    }

    let mut missing: Vec<String> = registration
        .required_services()
        .into_iter()
        .map(|service| service.alias)
        .filter(|alias| !configured.contains(alias.as_str()))
        .collect();
    missing.sort();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MappingError::MissingServices(missing))
    }
}
