//! Work units que vienen con el worker.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::engine::{EngineClient, StartProcessRequest};
use crate::error::RegistryError;
use crate::registry::{HandlerRegistry, WorkUnit};
use crate::task::ExternalTask;
use crate::variables::{check_variable, EngineVariables, ProcessVariables};

pub const CALL_ACTIVITY: &str = "camunda_api.CallActivity";

const LATEST: &str = "latest";

/// Arranca un subproceso en el engine.
///
/// Variables requeridas: `subprocessDefinition` (key de la definición).
/// Opcionales: `subprocessDefinitionVersion` (`latest` o un número de versión) y
/// `variablesMapping`, un objeto `{"origen": "destino"}`; sin mapping se
/// envían todas las variables del proceso padre.
///
/// Devuelve `processInstanceId` del subproceso.
pub struct CallActivity {
    engine: Arc<dyn EngineClient>,
}

impl CallActivity {
    pub fn new(engine: Arc<dyn EngineClient>) -> Self {
        Self { engine }
    }

    async fn definition_id(&self, key: &str, version: &str) -> anyhow::Result<String> {
        let mut definitions = self
            .engine
            .process_definitions(key, version)
            .await
            .with_context(|| format!("looking up process definition '{key}' version {version}"))?;
        if definitions.len() != 1 {
            bail!(
                "Expected 1 process definition for key {} and version {}, got {}.",
                key,
                version,
                definitions.len()
            );
        }
        Ok(definitions.remove(0).id)
    }

    fn construct_variables(source: EngineVariables, mapping: Option<&Value>) -> EngineVariables {
        let mapping = match mapping.and_then(Value::as_object) {
            Some(mapping) if !mapping.is_empty() => mapping,
            _ => return source,
        };
        mapping
            .iter()
            .filter_map(|(from, to)| {
                let to = to.as_str()?;
                source.get(from).map(|value| (to.to_string(), value.clone()))
            })
            .collect()
    }
}

const DOCUMENTATION: &str = "Start subprocess in the engine.

Required process variables:
* subprocessDefinition: process definition key of the subprocess to start.

Optional process variables:
* subprocessDefinitionVersion: 'latest' (default) or a specific version number.
  A specific version must match exactly one deployed process definition.
* variablesMapping: JSON object mapping parent variable names to subprocess
  variable names. When empty, all parent variables are sent unchanged.

Sets the process variables:
* processInstanceId: instance id of the created subprocess";

#[async_trait]
impl WorkUnit for CallActivity {
    async fn perform(&self, task: &ExternalTask) -> anyhow::Result<ProcessVariables> {
        let variables = task.get_variables()?;
        let definition_key = check_variable(&variables, "subprocessDefinition", false)?
            .as_str()
            .ok_or_else(|| anyhow!("subprocessDefinition must be a string"))?
            .to_string();

        let version = match variables.get("subprocessDefinitionVersion") {
            None | Some(Value::Null) => LATEST.to_string(),
            Some(Value::String(version)) => version.clone(),
            Some(Value::Number(version)) => version.to_string(),
            Some(other) => bail!("subprocessDefinitionVersion {} is not a valid version", other),
        };

        let instance_id = task
            .process_instance_id
            .as_deref()
            .ok_or_else(|| anyhow!("task {} has no process instance", task))?;

        let parent = self
            .engine
            .process_instance_variables(instance_id)
            .await
            .with_context(|| format!("reading variables of process instance {instance_id}"))?;

        let request = StartProcessRequest {
            business_key: None,
            variables: Self::construct_variables(parent, variables.get("variablesMapping")),
        };
        let started = if version == LATEST {
            self.engine
                .start_process(&definition_key, &request)
                .await
                .with_context(|| format!("starting subprocess '{definition_key}'"))?
        } else {
            let definition_id = self.definition_id(&definition_key, &version).await?;
            self.engine
                .start_process_by_id(&definition_id, &request)
                .await
                .with_context(|| format!("starting subprocess '{definition_id}'"))?
        };

        info!(
            "subproceso {} iniciado con instancia {} desde tarea {}",
            definition_key, started.id, task
        );

        let mut out = ProcessVariables::new();
        out.insert("processInstanceId".to_string(), Value::String(started.id));
        Ok(out)
    }

    fn documentation(&self) -> &str {
        DOCUMENTATION
    }
}

/// Registro con los work units incluidos.
pub fn builtin_registry(
    engine: Arc<dyn EngineClient>,
) -> Result<Arc<HandlerRegistry>, RegistryError> {
    let registry = HandlerRegistry::new();
    registry.register(CALL_ACTIVITY, CallActivity::new(engine))?;
    Ok(registry)
}
