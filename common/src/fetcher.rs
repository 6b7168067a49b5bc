use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::{EngineClient, FetchAndLockRequest, TopicRequest};
use crate::error::TaskError;
use crate::store::{MappingStore, TaskStore};
use crate::task::{ExternalTask, NewTask};

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(10 * 60);

/// Resultado de un fetch-and-lock.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub worker_id: String,
    pub count: usize,
    pub tasks: Vec<ExternalTask>,
}

/// Un worker id nuevo por lote.
pub fn generate_worker_id() -> String {
    format!("bptl-{}", uuid::Uuid::new_v4())
}

pub struct LockFetcher {
    engine: Arc<dyn EngineClient>,
    tasks: Arc<dyn TaskStore>,
    mappings: Arc<dyn MappingStore>,
    lock_duration: Duration,
    long_polling_timeout: Option<Duration>,
}

impl LockFetcher {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        tasks: Arc<dyn TaskStore>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            engine,
            tasks,
            mappings,
            lock_duration: DEFAULT_LOCK_DURATION,
            long_polling_timeout: None,
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_long_polling(mut self, timeout: Option<Duration>) -> Self {
        self.long_polling_timeout = timeout;
        self
    }

    /// Pide hasta `max_tasks` tareas para todos los topics activos y las
    /// persiste en `initial`. Los errores del engine se propagan tal cual.
    pub async fn fetch_and_lock(&self, max_tasks: u32) -> Result<FetchOutcome, TaskError> {
        let worker_id = generate_worker_id();

        let topics: Vec<TopicRequest> = self
            .mappings
            .active_mappings()
            .await
            .map_err(TaskError::Store)?
            .into_iter()
            .map(|mapping| TopicRequest {
                topic_name: mapping.topic_name,
                lock_duration: self.lock_duration.as_millis() as u64,
            })
            .collect();

        if topics.is_empty() {
            debug!("no hay mappings activos, no se consulta al engine");
            return Ok(FetchOutcome {
                worker_id,
                count: 0,
                tasks: Vec::new(),
            });
        }

        let request = FetchAndLockRequest {
            worker_id: worker_id.clone(),
            max_tasks,
            topics,
            async_response_timeout: self
                .long_polling_timeout
                .map(|timeout| timeout.as_millis() as u64),
        };

        let locked = self.engine.fetch_and_lock(&request).await?;

        let mut tasks = Vec::with_capacity(locked.len());
        let mut seen = HashSet::new();
        for item in locked {
            let task = self
                .tasks
                .insert(NewTask {
                    worker_id: worker_id.clone(),
                    topic_name: item.topic_name,
                    task_id: item.id,
                    priority: item.priority,
                    process_instance_id: item.process_instance_id,
                    variables: item.variables,
                    lock_expires_at: item.lock_expiration_time,
                })
                .await
                .map_err(TaskError::Store)?;
            // una tarea repetida en la respuesta cuenta una sola vez
            if !seen.insert(task.id) {
                debug!("tarea {} repetida en la respuesta del engine", task);
                continue;
            }
            debug!("tarea persistida id={} ({})", task.id, task);
            tasks.push(task);
        }

        info!(
            "fetch-and-lock worker={} bloqueó {} tarea(s) de {} topic(s)",
            worker_id,
            tasks.len(),
            request.topics.len()
        );

        Ok(FetchOutcome {
            worker_id,
            count: tasks.len(),
            tasks,
        })
    }
}
