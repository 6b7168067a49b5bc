//! Dobles de prueba: un engine falso que graba las llamadas y responde con
//! status guionados, más constructores de tareas de ejemplo.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::engine::{
    CompleteRequest, EngineClient, ExtendLockRequest, FailureRequest, FetchAndLockRequest,
    LockedTask, ProcessDefinition, StartProcessRequest, StartedProcess,
};
use crate::error::EngineError;
use crate::task::{ExternalTask, LocalId, NewTask};
use crate::variables::EngineVariables;

#[derive(Default)]
struct FakeState {
    to_lock: VecDeque<Vec<LockedTask>>,
    fetch_status: Option<u16>,
    fetch_requests: Vec<FetchAndLockRequest>,

    complete_script: VecDeque<u16>,
    complete_calls: Vec<(String, CompleteRequest)>,

    fail_script: VecDeque<u16>,
    failure_calls: Vec<(String, FailureRequest)>,

    extend_script: VecDeque<u16>,
    extend_calls: Vec<(String, ExtendLockRequest)>,

    lock_expiration: Option<DateTime<Utc>>,
    lock_expiration_status: Option<u16>,

    callback_calls: Vec<String>,
    callback_script: VecDeque<u16>,

    process_variables: EngineVariables,
    started: Vec<(String, StartProcessRequest)>,

    definitions: Vec<ProcessDefinition>,
    definition_queries: Vec<(String, String)>,
    started_by_id: Vec<(String, StartProcessRequest)>,
}

/// Engine en memoria. Sin guion, todas las llamadas responden 204.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

fn respond(script: &mut VecDeque<u16>, path: String) -> Result<(), EngineError> {
    let status = script.pop_front().unwrap_or(204);
    if (200..300).contains(&status) {
        return Ok(());
    }
    Err(EngineError::Status {
        status,
        url: format!("http://fake-engine/engine-rest/{path}"),
        body: Some(json!({
            "type": if status >= 500 { "ProcessEngineException" } else { "InvalidRequestException" },
            "message": format!("scripted {status}"),
        })),
    })
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Encola la respuesta del próximo fetchAndLock.
    pub fn push_locked(&self, tasks: Vec<LockedTask>) {
        self.state().to_lock.push_back(tasks);
    }

    pub fn fail_fetch_with(&self, status: u16) {
        self.state().fetch_status = Some(status);
    }

    pub fn script_complete(&self, statuses: Vec<u16>) {
        self.state().complete_script = statuses.into();
    }

    pub fn script_fail(&self, statuses: Vec<u16>) {
        self.state().fail_script = statuses.into();
    }

    pub fn script_extend(&self, statuses: Vec<u16>) {
        self.state().extend_script = statuses.into();
    }

    pub fn script_callback(&self, statuses: Vec<u16>) {
        self.state().callback_script = statuses.into();
    }

    pub fn set_lock_expiration(&self, expires_at: Option<DateTime<Utc>>) {
        self.state().lock_expiration = expires_at;
    }

    pub fn fail_lock_expiration_with(&self, status: u16) {
        self.state().lock_expiration_status = Some(status);
    }

    pub fn set_process_variables(&self, variables: EngineVariables) {
        self.state().process_variables = variables;
    }

    pub fn set_process_definitions(&self, definitions: Vec<ProcessDefinition>) {
        self.state().definitions = definitions;
    }

    pub fn fetch_requests(&self) -> Vec<FetchAndLockRequest> {
        self.state().fetch_requests.clone()
    }

    pub fn complete_calls(&self) -> Vec<(String, CompleteRequest)> {
        self.state().complete_calls.clone()
    }

    pub fn failure_calls(&self) -> Vec<(String, FailureRequest)> {
        self.state().failure_calls.clone()
    }

    pub fn extend_calls(&self) -> Vec<(String, ExtendLockRequest)> {
        self.state().extend_calls.clone()
    }

    pub fn callback_calls(&self) -> Vec<String> {
        self.state().callback_calls.clone()
    }

    pub fn started_processes(&self) -> Vec<(String, StartProcessRequest)> {
        self.state().started.clone()
    }

    pub fn started_by_id(&self) -> Vec<(String, StartProcessRequest)> {
        self.state().started_by_id.clone()
    }

    pub fn definition_queries(&self) -> Vec<(String, String)> {
        self.state().definition_queries.clone()
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
    ) -> Result<Vec<LockedTask>, EngineError> {
        let mut state = self.state();
        state.fetch_requests.push(request.clone());
        if let Some(status) = state.fetch_status {
            let mut script = VecDeque::from(vec![status]);
            respond(&mut script, "external-task/fetchAndLock".to_string())?;
        }
        Ok(state.to_lock.pop_front().unwrap_or_default())
    }

    async fn complete(&self, task_id: &str, request: &CompleteRequest) -> Result<(), EngineError> {
        let mut state = self.state();
        state
            .complete_calls
            .push((task_id.to_string(), request.clone()));
        respond(
            &mut state.complete_script,
            format!("external-task/{task_id}/complete"),
        )
    }

    async fn fail(&self, task_id: &str, request: &FailureRequest) -> Result<(), EngineError> {
        let mut state = self.state();
        state
            .failure_calls
            .push((task_id.to_string(), request.clone()));
        respond(
            &mut state.fail_script,
            format!("external-task/{task_id}/failure"),
        )
    }

    async fn extend_lock(
        &self,
        task_id: &str,
        request: &ExtendLockRequest,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        state
            .extend_calls
            .push((task_id.to_string(), request.clone()));
        respond(
            &mut state.extend_script,
            format!("external-task/{task_id}/extendLock"),
        )
    }

    async fn lock_expiration(&self, task_id: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
        let state = self.state();
        if let Some(status) = state.lock_expiration_status {
            let mut script = VecDeque::from(vec![status]);
            respond(&mut script, format!("external-task/{task_id}"))?;
        }
        Ok(state.lock_expiration)
    }

    async fn send_callback(&self, url: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.callback_calls.push(url.to_string());
        respond(&mut state.callback_script, url.to_string())
    }

    async fn process_instance_variables(
        &self,
        _process_instance_id: &str,
    ) -> Result<EngineVariables, EngineError> {
        Ok(self.state().process_variables.clone())
    }

    async fn start_process(
        &self,
        definition_key: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError> {
        let mut state = self.state();
        state
            .started
            .push((definition_key.to_string(), request.clone()));
        Ok(StartedProcess {
            id: format!("{definition_key}-{}", state.started.len()),
        })
    }

    async fn process_definitions(
        &self,
        key: &str,
        version: &str,
    ) -> Result<Vec<ProcessDefinition>, EngineError> {
        let mut state = self.state();
        state
            .definition_queries
            .push((key.to_string(), version.to_string()));
        Ok(state
            .definitions
            .iter()
            .filter(|definition| definition.key == key && definition.version.to_string() == version)
            .cloned()
            .collect())
    }

    async fn start_process_by_id(
        &self,
        definition_id: &str,
        request: &StartProcessRequest,
    ) -> Result<StartedProcess, EngineError> {
        let mut state = self.state();
        state
            .started_by_id
            .push((definition_id.to_string(), request.clone()));
        Ok(StartedProcess {
            id: format!("{definition_id}-{}", state.started_by_id.len()),
        })
    }
}

pub fn process_definition(key: &str, version: i64) -> ProcessDefinition {
    ProcessDefinition {
        id: format!("{key}:{version}:{}", uuid::Uuid::new_v4()),
        key: key.to_string(),
        version,
    }
}

pub fn sample_new_task(topic_name: &str) -> NewTask {
    NewTask {
        worker_id: "test-worker-id".to_string(),
        topic_name: topic_name.to_string(),
        task_id: uuid::Uuid::new_v4().to_string(),
        priority: None,
        process_instance_id: Some("aProcessInstanceId".to_string()),
        variables: EngineVariables::new(),
        lock_expires_at: Some(Utc::now() + Duration::minutes(10)),
    }
}

pub fn sample_task(id: LocalId, topic_name: &str) -> ExternalTask {
    ExternalTask::from_new(id, sample_new_task(topic_name))
}

pub fn locked_task(task_id: &str, topic_name: &str) -> LockedTask {
    LockedTask {
        id: task_id.to_string(),
        topic_name: topic_name.to_string(),
        worker_id: None,
        priority: Some(0),
        lock_expiration_time: Some(Utc::now() + Duration::minutes(10)),
        process_instance_id: Some("aProcessInstanceId".to_string()),
        variables: EngineVariables::new(),
    }
}
