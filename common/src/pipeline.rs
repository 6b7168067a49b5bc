//! Fetch -> execute -> complete, por tarea y por lote.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::completer::Completer;
use crate::engine::EngineClient;
use crate::error::TaskError;
use crate::executor::{Dispatch, Executor};
use crate::extender::LockExtender;
use crate::failure::fail_task;
use crate::fetcher::{FetchOutcome, LockFetcher, DEFAULT_LOCK_DURATION};
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::store::{MappingStore, TaskStore};
use crate::task::{ExternalTask, LocalId, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub lock_duration: Duration,
    pub long_polling_timeout: Option<Duration>,
    /// Reintentos de complete y extendLock.
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            long_polling_timeout: None,
            retry: RetryPolicy::new(3),
        }
    }
}

/// Conteos por fase de `run_batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub worker_id: String,
    pub fetched: usize,
    pub executed: usize,
    pub execution_failed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub completion_failed: usize,
}

pub struct Pipeline {
    tasks: Arc<dyn TaskStore>,
    engine: Arc<dyn EngineClient>,
    fetcher: LockFetcher,
    executor: Executor,
    completer: Completer,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        mappings: Arc<dyn MappingStore>,
        engine: Arc<dyn EngineClient>,
        registry: Arc<HandlerRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        let fetcher = LockFetcher::new(engine.clone(), tasks.clone(), mappings.clone())
            .with_lock_duration(settings.lock_duration)
            .with_long_polling(settings.long_polling_timeout);
        let extender = LockExtender::new(engine.clone(), tasks.clone())
            .with_lock_duration(settings.lock_duration)
            .with_retry(settings.retry.clone());
        let executor = Executor::new(
            tasks.clone(),
            mappings,
            registry,
            engine.clone(),
            extender,
        );
        let completer =
            Completer::new(engine.clone(), tasks.clone()).with_retry(settings.retry.clone());

        Self {
            tasks,
            engine,
            fetcher,
            executor,
            completer,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn fetch_and_lock(&self, max_tasks: u32) -> Result<FetchOutcome, TaskError> {
        self.fetcher.fetch_and_lock(max_tasks).await
    }

    pub async fn execute(&self, id: LocalId) -> Result<Dispatch, TaskError> {
        self.executor.execute(id).await
    }

    /// Completa una tarea ya `performed`; un fallo permanente la deja en
    /// `failed` y se reporta al engine.
    pub async fn complete(&self, task: &mut ExternalTask) -> Result<(), TaskError> {
        match self.completer.complete(task).await {
            Ok(()) => Ok(()),
            Err(err @ TaskError::TaskNotPerformed(_)) => Err(err),
            Err(err) => {
                fail_task(self.tasks.as_ref(), self.engine.as_ref(), task, &err).await?;
                Err(err)
            }
        }
    }

    /// Execute + complete de una tarea. Devuelve el status final.
    pub async fn execute_and_complete(&self, id: LocalId) -> Result<TaskStatus, TaskError> {
        match self.execute(id).await? {
            Dispatch::Skipped(status) => Ok(status),
            Dispatch::Performed(mut task) => {
                self.complete(&mut task).await?;
                Ok(task.status)
            }
        }
    }

    /// Fetch, luego ejecución de todo el lote, luego complete de las exitosas.
    /// Un fallo de una tarea nunca corta el lote.
    pub async fn run_batch(&self, max_tasks: u32) -> Result<BatchReport, TaskError> {
        let outcome = self.fetch_and_lock(max_tasks).await?;
        let mut report = BatchReport {
            worker_id: outcome.worker_id.clone(),
            fetched: outcome.count,
            ..BatchReport::default()
        };

        let mut performed = Vec::new();
        for task in &outcome.tasks {
            match self.execute(task.id).await {
                Ok(Dispatch::Performed(task)) => {
                    report.executed += 1;
                    performed.push(task);
                }
                Ok(Dispatch::Skipped(_)) => report.skipped += 1,
                Err(err) => {
                    warn!("tarea id={} ({}) falló en ejecución: {}", task.id, task, err);
                    report.execution_failed += 1;
                }
            }
        }

        for mut task in performed {
            match self.complete(&mut task).await {
                Ok(()) => report.completed += 1,
                Err(err) => {
                    warn!("tarea id={} ({}) falló al completar: {}", task.id, task, err);
                    report.completion_failed += 1;
                }
            }
        }

        info!(
            "lote worker={}: fetched={} executed={} failed={} completed={} completion_failed={}",
            report.worker_id,
            report.fetched,
            report.executed,
            report.execution_failed,
            report.completed,
            report.completion_failed
        );
        Ok(report)
    }

    /// Ids de tareas en `initial` (nunca despachadas).
    pub async fn pending_ids(&self) -> Result<Vec<LocalId>, TaskError> {
        Ok(self
            .tasks
            .with_status(TaskStatus::Initial)
            .await
            .map_err(TaskError::Store)?
            .into_iter()
            .map(|task| task.id)
            .collect())
    }

    pub async fn in_progress(&self) -> Result<Vec<ExternalTask>, TaskError> {
        self.tasks
            .with_status(TaskStatus::InProgress)
            .await
            .map_err(TaskError::Store)
    }

    /// Vuelve la tarea a `initial` con un lock local nuevo (`execute-task --force`).
    pub async fn force_reset(&self, id: LocalId) -> Result<ExternalTask, TaskError> {
        let mut task = self
            .tasks
            .load(id)
            .await
            .map_err(TaskError::Store)?
            .ok_or(TaskError::NotFound(id))?;

        let lock = chrono::Duration::from_std(self.settings.lock_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        task.set_status(TaskStatus::Initial);
        task.lock_expires_at = Some(Utc::now() + lock);
        task.execution_error.clear();
        task.engine_error = None;
        self.tasks.save(&task).await.map_err(TaskError::Store)?;

        warn!("tarea id={} ({}) reiniciada a initial (--force)", task.id, task);
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TaskMapping;
    use crate::store::MemoryStore;
    use crate::testing::{locked_task, FakeEngine};
    use crate::variables::{ProcessVariables, TypedValue};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Setup {
        engine: Arc<FakeEngine>,
        store: Arc<MemoryStore>,
        calls: Arc<AtomicUsize>,
        pipeline: Pipeline,
    }

    fn setup() -> Setup {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::with_mappings(vec![TaskMapping::new(
            "zaak-initialize",
            "zgw.CreateCase",
        )]));
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry
            .register_fn("zgw.CreateCase", move |_task| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let mut out = ProcessVariables::new();
                    out.insert("caseUrl".to_string(), json!("https://x/y"));
                    Ok::<_, anyhow::Error>(out)
                }
            })
            .unwrap();

        let settings = PipelineSettings {
            retry: RetryPolicy::new(3).with_delay(Duration::ZERO),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(
            store.clone(),
            store.clone(),
            engine.clone(),
            registry,
            settings,
        );
        Setup {
            engine,
            store,
            calls,
            pipeline,
        }
    }

    async fn fetch_one(setup: &Setup, topic: &str) -> LocalId {
        setup.engine.push_locked(vec![locked_task("test-task-id", topic)]);
        let outcome = setup.pipeline.fetch_and_lock(1).await.unwrap();
        outcome.tasks[0].id
    }

    #[tokio::test]
    async fn camino_feliz_zaak_initialize() {
        let s = setup();
        let id = fetch_one(&s, "zaak-initialize").await;

        let status = s.pipeline.execute_and_complete(id).await.unwrap();

        assert_eq!(status, TaskStatus::Completed);
        let calls = s.engine.complete_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "test-task-id");
        assert_eq!(calls[0].1.variables.len(), 1);
        assert_eq!(
            calls[0].1.variables["caseUrl"],
            TypedValue::new("String", json!("https://x/y"))
        );
        let stored = s.store.load(id).await.unwrap().unwrap();
        assert_eq!(
            stored.statuses(),
            vec![
                TaskStatus::Initial,
                TaskStatus::InProgress,
                TaskStatus::Performed,
                TaskStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn sin_mapping_queda_failed_sin_complete() {
        let s = setup();
        s.store
            .upsert_mapping(TaskMapping::new("other-topic", "zgw.CreateCase"))
            .await
            .unwrap();
        let id = fetch_one(&s, "other-topic").await;
        let mut inactive = TaskMapping::new("other-topic", "zgw.CreateCase");
        inactive.active = false;
        s.store.upsert_mapping(inactive).await.unwrap();

        let err = s.pipeline.execute_and_complete(id).await.unwrap_err();

        assert!(matches!(err, TaskError::NoCallback(_)));
        let stored = s.store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .execution_error
            .ends_with("Could not find a topic/callback mapping for topic 'other-topic'."));
        assert!(s.engine.complete_calls().is_empty());
    }

    #[tokio::test]
    async fn complete_500_y_luego_204() {
        let s = setup();
        s.engine.script_complete(vec![500, 204]);
        let id = fetch_one(&s, "zaak-initialize").await;

        let status = s.pipeline.execute_and_complete(id).await.unwrap();

        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(s.engine.complete_calls().len(), 2);
    }

    #[tokio::test]
    async fn complete_agotado_falla_y_reporta() {
        let s = setup();
        s.engine.script_complete(vec![500, 500, 500, 500]);
        let id = fetch_one(&s, "zaak-initialize").await;

        let err = s.pipeline.execute_and_complete(id).await.unwrap_err();

        assert_eq!(err.kind(), "TransientEngineError");
        assert_eq!(s.engine.complete_calls().len(), 4);
        let stored = s.store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.engine_error.is_some());

        let failures = s.engine.failure_calls();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.error_message.contains("500 Server Error"));
    }

    #[tokio::test]
    async fn lock_vencido_con_extension_exitosa_completa() {
        let s = setup();
        let mut locked = locked_task("test-task-id", "zaak-initialize");
        locked.lock_expiration_time = Some(Utc::now() - ChronoDuration::seconds(1));
        s.engine.push_locked(vec![locked]);
        let id = s.pipeline.fetch_and_lock(1).await.unwrap().tasks[0].id;

        let status = s.pipeline.execute_and_complete(id).await.unwrap();

        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(s.engine.extend_calls().len(), 1);
        assert_eq!(s.engine.complete_calls().len(), 1);
    }

    #[tokio::test]
    async fn lock_vencido_con_extension_rechazada_falla() {
        let s = setup();
        s.engine.script_extend(vec![404]);
        let mut locked = locked_task("test-task-id", "zaak-initialize");
        locked.lock_expiration_time = Some(Utc::now() - ChronoDuration::seconds(1));
        s.engine.push_locked(vec![locked]);
        let id = s.pipeline.fetch_and_lock(1).await.unwrap().tasks[0].id;

        let err = s.pipeline.execute_and_complete(id).await.unwrap_err();

        assert!(matches!(err, TaskError::TaskExpired(_)));
        assert_eq!(s.calls.load(Ordering::SeqCst), 0);
        assert_eq!(s.engine.failure_calls().len(), 1);
        assert!(s.engine.complete_calls().is_empty());
        assert_eq!(
            s.store.load(id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn historial_es_monotono_en_todos_los_caminos() {
        let allowed = [
            TaskStatus::Initial,
            TaskStatus::InProgress,
            TaskStatus::Performed,
            TaskStatus::Failed,
            TaskStatus::Completed,
        ];
        let s = setup();
        s.engine.script_complete(vec![400]);
        s.engine.push_locked(vec![
            locked_task("a", "zaak-initialize"),
            locked_task("b", "unmapped"),
        ]);
        let outcome = s.pipeline.fetch_and_lock(2).await.unwrap();
        for task in &outcome.tasks {
            let _ = s.pipeline.execute_and_complete(task.id).await;
        }

        for task in s.store.list().await.unwrap() {
            let statuses = task.statuses();
            for pair in statuses.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{:?}", statuses);
            }
            assert!(statuses.iter().all(|s| allowed.contains(s)));
            assert!(task.status.is_terminal());
        }
    }

    #[tokio::test]
    async fn lote_cuenta_por_fase() {
        let s = setup();
        s.engine.push_locked(vec![
            locked_task("a", "zaak-initialize"),
            locked_task("b", "zaak-initialize"),
            locked_task("c", "unmapped"),
        ]);

        let report = s.pipeline.run_batch(3).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.executed, 2);
        assert_eq!(report.execution_failed, 1);
        assert_eq!(report.completed, 2);
        assert_eq!(report.completion_failed, 0);
        assert!(s.pipeline.pending_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_reset_permite_reejecutar() {
        let s = setup();
        let id = fetch_one(&s, "zaak-initialize").await;
        s.pipeline.execute_and_complete(id).await.unwrap();

        let reset = s.pipeline.force_reset(id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Initial);
        assert!(!reset.is_expired());

        let status = s.pipeline.execute_and_complete(id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(s.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_reset_de_id_inexistente() {
        let s = setup();
        let err = s.pipeline.force_reset(77).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(77)));
    }
}
