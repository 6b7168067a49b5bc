use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{EngineClient, ExtendLockRequest};
use crate::error::{EngineError, TaskError};
use crate::failure::fail_task;
use crate::fetcher::DEFAULT_LOCK_DURATION;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::task::ExternalTask;

/// Extiende locks vencidos. Si el engine rechaza la extensión la tarea termina
/// en `failed` con `TaskExpired`.
pub struct LockExtender {
    engine: Arc<dyn EngineClient>,
    tasks: Arc<dyn TaskStore>,
    lock_duration: Duration,
    retry: RetryPolicy,
}

impl LockExtender {
    pub fn new(engine: Arc<dyn EngineClient>, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            engine,
            tasks,
            lock_duration: DEFAULT_LOCK_DURATION,
            retry: RetryPolicy::new(3),
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// No hace nada si el lock sigue vigente.
    pub async fn ensure_lock(&self, task: &mut ExternalTask) -> Result<(), TaskError> {
        if !task.is_expired() {
            return Ok(());
        }
        warn!(
            "lock de la tarea id={} ({}) venció en {:?}, extendiendo",
            task.id, task, task.lock_expires_at
        );
        self.extend(task).await
    }

    pub async fn extend(&self, task: &mut ExternalTask) -> Result<(), TaskError> {
        let request = ExtendLockRequest {
            worker_id: task.worker_id.clone(),
            new_duration: self.lock_duration.as_millis() as u64,
        };
        let engine = self.engine.as_ref();
        let task_id = task.task_id.clone();

        let extended = self
            .retry
            .run(
                || engine.extend_lock(&task_id, &request),
                EngineError::is_transient,
            )
            .await;

        if let Err(e) = extended {
            let err = TaskError::TaskExpired(format!(
                "The lock expired for task {} and could not be extended: {}",
                task, e
            ));
            fail_task(self.tasks.as_ref(), engine, task, &err).await?;
            return Err(err);
        }

        let estimate = Utc::now()
            + chrono::Duration::from_std(self.lock_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        task.lock_expires_at = match engine.lock_expiration(&task.task_id).await {
            Ok(Some(expires_at)) => Some(expires_at),
            Ok(None) => Some(estimate),
            Err(e) => {
                warn!(
                    "no se pudo releer la expiración de la tarea id={}, usando estimación local: {}",
                    task.id, e
                );
                Some(estimate)
            }
        };
        self.tasks.save(task).await.map_err(TaskError::Store)?;

        info!(
            "lock de la tarea id={} ({}) extendido hasta {:?}",
            task.id, task, task.lock_expires_at
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::TaskStatus;
    use crate::testing::{sample_new_task, FakeEngine};
    use chrono::Duration as ChronoDuration;

    async fn expired_task(store: &MemoryStore) -> ExternalTask {
        let mut new = sample_new_task("zaak-initialize");
        new.lock_expires_at = Some(Utc::now() - ChronoDuration::seconds(5));
        let mut task = store.insert(new).await.unwrap();
        task.set_status(TaskStatus::InProgress);
        store.save(&task).await.unwrap();
        task
    }

    fn extender(engine: &Arc<FakeEngine>, store: &Arc<MemoryStore>) -> LockExtender {
        LockExtender::new(engine.clone(), store.clone())
            .with_retry(RetryPolicy::new(3).with_delay(std::time::Duration::ZERO))
    }

    #[tokio::test]
    async fn lock_vigente_no_llama_al_engine() {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::new());
        let mut task = store.insert(sample_new_task("t")).await.unwrap();

        extender(&engine, &store).ensure_lock(&mut task).await.unwrap();
        assert!(engine.extend_calls().is_empty());
    }

    #[tokio::test]
    async fn extension_exitosa_usa_expiracion_del_engine() {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::new());
        let authoritative = Utc::now() + ChronoDuration::minutes(7);
        engine.set_lock_expiration(Some(authoritative));
        let mut task = expired_task(&store).await;

        extender(&engine, &store).ensure_lock(&mut task).await.unwrap();

        let calls = engine.extend_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.new_duration, 600_000);
        assert_eq!(calls[0].1.worker_id, "test-worker-id");
        assert_eq!(task.lock_expires_at, Some(authoritative));
        assert!(!store.load(task.id).await.unwrap().unwrap().is_expired());
    }

    #[tokio::test]
    async fn si_falla_la_relectura_se_usa_la_estimacion() {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::new());
        engine.fail_lock_expiration_with(500);
        let mut task = expired_task(&store).await;

        extender(&engine, &store).ensure_lock(&mut task).await.unwrap();

        let expires = task.lock_expires_at.unwrap();
        assert!(expires > Utc::now() + ChronoDuration::minutes(9));
    }

    #[tokio::test]
    async fn extension_rechazada_falla_la_tarea() {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::new());
        engine.script_extend(vec![404]);
        let mut task = expired_task(&store).await;

        let err = extender(&engine, &store)
            .ensure_lock(&mut task)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::TaskExpired(_)));
        assert_eq!(engine.extend_calls().len(), 1);
        let stored = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);

        let failures = engine.failure_calls();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.error_message.contains("lock expired"));
    }

    #[tokio::test]
    async fn extension_con_5xx_se_reintenta() {
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(MemoryStore::new());
        engine.script_extend(vec![500, 500, 500, 500]);
        let mut task = expired_task(&store).await;

        let err = extender(&engine, &store)
            .ensure_lock(&mut task)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::TaskExpired(_)));
        assert_eq!(engine.extend_calls().len(), 4);
    }
}
