//! Cliente del API REST del engine BPM (external tasks).
//!
//! Todos los paths son relativos a la raíz configurada, p.ej.
//! `https://camunda.example.com/engine-rest/`.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::EngineError;
use crate::variables::EngineVariables;

/* --------- DTOs de cable (camelCase) --------- */

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    pub topic_name: String,
    /// Milisegundos.
    pub lock_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAndLockRequest {
    pub worker_id: String,
    pub max_tasks: u32,
    pub topics: Vec<TopicRequest>,
    /// Long polling (ms); se omite si es `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_response_timeout: Option<u64>,
}

/// Una tarea bloqueada tal como la devuelve `fetchAndLock` / `GET external-task/{id}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedTask {
    pub id: String,
    #[serde(default)]
    pub topic_name: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_engine_datetime")]
    pub lock_expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub process_instance_id: Option<String>,
    #[serde(default)]
    pub variables: EngineVariables,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub worker_id: String,
    pub variables: EngineVariables,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRequest {
    pub worker_id: String,
    pub error_message: String,
    pub error_detail: String,
    /// Siempre 0: el engine crea un incidente en vez de reintentar.
    pub retries: u32,
    pub retry_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendLockRequest {
    pub worker_id: String,
    /// Milisegundos desde ahora.
    pub new_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    pub variables: EngineVariables,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartedProcess {
    pub id: String,
}

/// Fila de `GET process-definition`; el resto de campos se ignora.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub key: String,
    pub version: i64,
}

/// Acepta RFC 3339 y el formato del engine con offset sin dos puntos
/// (`2025-10-06T16:34:42.000+0200`).
pub fn parse_engine_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::<FixedOffset>::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn deserialize_engine_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_engine_datetime(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid engine datetime '{raw}'"))),
    }
}

/* --------- Trait del cliente --------- */

#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError>;

    async fn complete(&self, task_id: &str, request: &CompleteRequest) -> Result<(), EngineError>;

    async fn fail(&self, task_id: &str, request: &FailureRequest) -> Result<(), EngineError>;

    /// Cualquier respuesta distinta de 204 es un rechazo.
    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<(), EngineError>;

    /// Expiración autoritativa del lock (`GET external-task/{id}`).
    async fn lock_expiration(&self, task_id: &str) -> Result<Option<DateTime<Utc>>, EngineError>;

    /// POST vacío a una URL arbitraria (variable `callbackUrl`).
    async fn send_callback(&self, url: &str) -> Result<(), EngineError>;

    async fn process_instance_variables(
        &self,
        process_instance_id: &str,
    ) -> Result<EngineVariables, EngineError>;

    /// Arranca la última versión desplegada de la definición.
    async fn start_process(
        &self,
        definition_key: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError>;

    /// Definiciones con ese key y versión (`GET process-definition?key=&version=`).
    async fn process_definitions(
        &self,
        key: &str,
        version: &str,
    ) -> Result<Vec<ProcessDefinition>, EngineError>;

    async fn start_process_by_id(
        &self,
        definition_id: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError>;
}

/* --------- Implementación HTTP --------- */

#[derive(Clone)]
pub struct HttpEngineClient {
    client: Client,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpEngineClient {
    pub fn new(
        base_url: &str,
        auth_header: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder().timeout(timeout).build()?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.client.post(self.url(path)))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.client.get(self.url(path)))
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(value) => builder.header(reqwest::header::AUTHORIZATION, value),
            None => builder,
        }
    }
}

/// Convierte una respuesta no exitosa en `EngineError::Status`, guardando el
/// cuerpo JSON si lo hay.
async fn check_status(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.json::<Value>().await.ok();
    Err(EngineError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

async fn parse_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, EngineError> {
    let url = response.url().to_string();
    response
        .json::<T>()
        .await
        .map_err(|e| EngineError::InvalidResponse(format!("{url}: {e}")))
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError> {
        debug!(
            "fetchAndLock worker={} max_tasks={} topics={}",
            request.worker_id,
            request.max_tasks,
            request.topics.len()
        );
        let response = self
            .post("external-task/fetchAndLock")
            .json(request)
            .send()
            .await?;
        parse_json(check_status(response).await?).await
    }

    async fn complete(&self, task_id: &str, request: &CompleteRequest) -> Result<(), EngineError> {
        let response = self
            .post(&format!("external-task/{task_id}/complete"))
            .json(request)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn fail(&self, task_id: &str, request: &FailureRequest) -> Result<(), EngineError> {
        let response = self
            .post(&format!("external-task/{task_id}/failure"))
            .json(request)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<(), EngineError> {
        let response = self
            .post(&format!("external-task/{task_id}/extendLock"))
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(EngineError::Status {
                status: response.status().as_u16(),
                url: response.url().to_string(),
                body: None,
            });
        }
        Ok(())
    }

    async fn lock_expiration(&self, task_id: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
        let response = self
            .get(&format!("external-task/{task_id}"))
            .send()
            .await?;
        let task: LockedTask = parse_json(check_status(response).await?).await?;
        Ok(task.lock_expiration_time)
    }

    async fn send_callback(&self, url: &str) -> Result<(), EngineError> {
        let response = self.client.post(url).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn process_instance_variables(
        &self,
        process_instance_id: &str,
    ) -> Result<EngineVariables, EngineError> {
        let response = self
            .get(&format!("process-instance/{process_instance_id}/variables"))
            .send()
            .await?;
        parse_json(check_status(response).await?).await
    }

    async fn start_process(
        &self,
        definition_key: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError> {
        let response = self
            .post(&format!("process-definition/key/{definition_key}/start"))
            .json(request)
            .send()
            .await?;
        parse_json(check_status(response).await?).await
    }

    async fn process_definitions(
        &self,
        key: &str,
        version: &str,
    ) -> Result<Vec<ProcessDefinition>, EngineError> {
        let response = self
            .get("process-definition")
            .query(&[("key", key), ("version", version)])
            .send()
            .await?;
        parse_json(check_status(response).await?).await
    }

    async fn start_process_by_id(
        &self,
        definition_id: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError> {
        let response = self
            .post(&format!("process-definition/{definition_id}/start"))
            .json(request)
            .send()
            .await?;
        parse_json(check_status(response).await?).await
    }
}
