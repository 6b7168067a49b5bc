//! Persistencia local de tareas y mappings.
//!
//! Dos implementaciones: `MemoryStore` (tests, CLI efímero) y `SqliteStore`
//! (`bptl.sqlite3` en el directorio de datos, compartido entre procesos).

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::mapping::TaskMapping;
use crate::task::{ExternalTask, LocalId, NewTask, TaskStatus};

pub const DATABASE_FILE: &str = "bptl.sqlite3";

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS external_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        worker_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        topic_name TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        UNIQUE (worker_id, task_id)
    )",
    "CREATE INDEX IF NOT EXISTS external_tasks_status ON external_tasks (status)",
    "CREATE TABLE IF NOT EXISTS task_mappings (
        topic_name TEXT PRIMARY KEY,
        callback TEXT NOT NULL,
        active INTEGER NOT NULL,
        default_services TEXT NOT NULL
    )",
];

/// Resultado de un compare-and-swap de status.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Swapped(ExternalTask),
    /// El status actual no era el esperado; no se tocó nada.
    Mismatch(TaskStatus),
    Missing,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persiste una tarea nueva en `initial`. Si ya existe una fila para el par
    /// (worker_id, task_id) se devuelve esa.
    async fn insert(&self, new: NewTask) -> anyhow::Result<ExternalTask>;

    async fn load(&self, id: LocalId) -> anyhow::Result<Option<ExternalTask>>;

    /// Reemplaza la fila completa (la tarea tiene que existir).
    async fn save(&self, task: &ExternalTask) -> anyhow::Result<()>;

    /// Cambia `expected -> next` de forma atómica y lo registra en el historial.
    async fn compare_and_swap_status(
        &self,
        id: LocalId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> anyhow::Result<CasOutcome>;

    async fn list(&self) -> anyhow::Result<Vec<ExternalTask>>;

    async fn with_status(&self, status: TaskStatus) -> anyhow::Result<Vec<ExternalTask>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|task| task.status == status)
            .collect())
    }
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn mappings(&self) -> anyhow::Result<Vec<TaskMapping>>;

    /// Crea o reemplaza el mapping del topic.
    async fn upsert_mapping(&self, mapping: TaskMapping) -> anyhow::Result<()>;

    async fn active_mappings(&self) -> anyhow::Result<Vec<TaskMapping>> {
        Ok(self
            .mappings()
            .await?
            .into_iter()
            .filter(|mapping| mapping.active)
            .collect())
    }

    async fn mapping_for(&self, topic_name: &str) -> anyhow::Result<Option<TaskMapping>> {
        Ok(self
            .mappings()
            .await?
            .into_iter()
            .find(|mapping| mapping.topic_name == topic_name))
    }
}

/// Filas en memoria + contador de ids.
#[derive(Debug, Default, Clone)]
pub struct StoreState {
    pub next_id: LocalId,
    pub tasks: BTreeMap<LocalId, ExternalTask>,
}

impl StoreState {
    fn insert(&mut self, new: NewTask) -> ExternalTask {
        if let Some(existing) = self
            .tasks
            .values()
            .find(|task| task.worker_id == new.worker_id && task.task_id == new.task_id)
        {
            debug!(
                "tarea {} / {} ya persistida como id={}",
                existing.topic_name, existing.task_id, existing.id
            );
            return existing.clone();
        }

        self.next_id += 1;
        let task = ExternalTask::from_new(self.next_id, new);
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn save(&mut self, task: &ExternalTask) -> anyhow::Result<()> {
        match self.tasks.get_mut(&task.id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => Err(anyhow!("task {} does not exist", task.id)),
        }
    }

    fn compare_and_swap(
        &mut self,
        id: LocalId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> CasOutcome {
        match self.tasks.get_mut(&id) {
            None => CasOutcome::Missing,
            Some(task) if task.status != expected => CasOutcome::Mismatch(task.status),
            Some(task) => {
                task.set_status(next);
                CasOutcome::Swapped(task.clone())
            }
        }
    }
}

fn upsert(mappings: &mut Vec<TaskMapping>, mapping: TaskMapping) {
    match mappings
        .iter_mut()
        .find(|existing| existing.topic_name == mapping.topic_name)
    {
        Some(existing) => *existing = mapping,
        None => mappings.push(mapping),
    }
}

/// Store en memoria.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    mappings: Mutex<Vec<TaskMapping>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(mappings: Vec<TaskMapping>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            mappings: Mutex::new(mappings),
        }
    }

    fn state(&self) -> anyhow::Result<std::sync::MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| anyhow!("lock tasks envenenado"))
    }

    fn mapping_table(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Vec<TaskMapping>>> {
        self.mappings
            .lock()
            .map_err(|_| anyhow!("lock mappings envenenado"))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, new: NewTask) -> anyhow::Result<ExternalTask> {
        Ok(self.state()?.insert(new))
    }

    async fn load(&self, id: LocalId) -> anyhow::Result<Option<ExternalTask>> {
        Ok(self.state()?.tasks.get(&id).cloned())
    }

    async fn save(&self, task: &ExternalTask) -> anyhow::Result<()> {
        self.state()?.save(task)
    }

    async fn compare_and_swap_status(
        &self,
        id: LocalId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> anyhow::Result<CasOutcome> {
        Ok(self.state()?.compare_and_swap(id, expected, next))
    }

    async fn list(&self) -> anyhow::Result<Vec<ExternalTask>> {
        Ok(self.state()?.tasks.values().cloned().collect())
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn mappings(&self) -> anyhow::Result<Vec<TaskMapping>> {
        Ok(self.mapping_table()?.clone())
    }

    async fn upsert_mapping(&self, mapping: TaskMapping) -> anyhow::Result<()> {
        let mut table = self.mapping_table()?;
        upsert(&mut table, mapping);
        Ok(())
    }
}


/// Store en SQLite. Varios procesos (workers y CLI) pueden abrir el mismo
/// directorio: la unicidad de (worker_id, task_id) y el compare-and-swap de
/// status los resuelve la base, no un lock del proceso.
pub struct SqliteStore {
    path: PathBuf,
    pool: SqlitePool,
}

type TaskRow = (i64, String);
type MappingRow = (String, String, bool, String);

fn row_id(id: LocalId) -> anyhow::Result<i64> {
    i64::try_from(id).map_err(|_| anyhow!("id {} fuera de rango", id))
}

fn parse_status(raw: &str) -> anyhow::Result<TaskStatus> {
    serde_json::from_value(Value::String(raw.to_string()))
        .with_context(|| format!("status desconocido '{}'", raw))
}

/// El id de la fila manda sobre el que haya quedado en el payload.
fn decode_task((id, payload): TaskRow) -> anyhow::Result<ExternalTask> {
    let mut task: ExternalTask = serde_json::from_str(&payload)
        .with_context(|| format!("payload inválido en la tarea {}", id))?;
    task.id = LocalId::try_from(id).map_err(|_| anyhow!("id {} fuera de rango", id))?;
    Ok(task)
}

fn decode_mapping(
    (topic_name, callback, active, default_services): MappingRow,
) -> anyhow::Result<TaskMapping> {
    Ok(TaskMapping {
        default_services: serde_json::from_str(&default_services)
            .with_context(|| format!("default_services inválido en el mapping {}", topic_name))?,
        topic_name,
        callback,
        active,
    })
}

impl SqliteStore {
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creando directorio de datos {}", dir.display()))?;

        let path = dir.join(DATABASE_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("abriendo {}", path.display()))?;

        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&pool)
                .await
                .context("creando el esquema")?;
        }

        info!("store SQLite en {}", path.display());
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn fetch_tasks(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<ExternalTask>> {
        let rows: Vec<TaskRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, payload FROM external_tasks WHERE status = ? ORDER BY id",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT id, payload FROM external_tasks ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(decode_task).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, new: NewTask) -> anyhow::Result<ExternalTask> {
        let task = ExternalTask::from_new(0, new);
        let payload = serde_json::to_string(&task)?;

        let inserted = sqlx::query(
            "INSERT INTO external_tasks (worker_id, task_id, topic_name, status, payload)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (worker_id, task_id) DO NOTHING",
        )
        .bind(&task.worker_id)
        .bind(&task.task_id)
        .bind(&task.topic_name)
        .bind(task.status.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return decode_task((inserted.last_insert_rowid(), payload));
        }

        let row: TaskRow = sqlx::query_as(
            "SELECT id, payload FROM external_tasks WHERE worker_id = ? AND task_id = ?",
        )
        .bind(&task.worker_id)
        .bind(&task.task_id)
        .fetch_one(&self.pool)
        .await?;
        let existing = decode_task(row)?;
        debug!(
            "tarea {} / {} ya persistida como id={}",
            existing.topic_name, existing.task_id, existing.id
        );
        Ok(existing)
    }

    async fn load(&self, id: LocalId) -> anyhow::Result<Option<ExternalTask>> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT id, payload FROM external_tasks WHERE id = ?")
                .bind(row_id(id)?)
                .fetch_optional(&self.pool)
                .await?;
        row.map(decode_task).transpose()
    }

    async fn save(&self, task: &ExternalTask) -> anyhow::Result<()> {
        let updated = sqlx::query(
            "UPDATE external_tasks SET topic_name = ?, status = ?, payload = ? WHERE id = ?",
        )
        .bind(&task.topic_name)
        .bind(task.status.as_str())
        .bind(serde_json::to_string(task)?)
        .bind(row_id(task.id)?)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(anyhow!("task {} does not exist", task.id));
        }
        Ok(())
    }

    async fn compare_and_swap_status(
        &self,
        id: LocalId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> anyhow::Result<CasOutcome> {
        let key = row_id(id)?;
        // La primera sentencia escribe: toma el lock de escritura antes de leer nada.
        let mut tx = self.pool.begin().await?;
        let swapped = sqlx::query("UPDATE external_tasks SET status = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(key)
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?;

        if swapped.rows_affected() == 0 {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM external_tasks WHERE id = ?")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return match current {
                None => Ok(CasOutcome::Missing),
                Some((status,)) => Ok(CasOutcome::Mismatch(parse_status(&status)?)),
            };
        }

        let row: TaskRow = sqlx::query_as("SELECT id, payload FROM external_tasks WHERE id = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        let mut task = decode_task(row)?;
        task.set_status(next);
        sqlx::query("UPDATE external_tasks SET payload = ? WHERE id = ?")
            .bind(serde_json::to_string(&task)?)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CasOutcome::Swapped(task))
    }

    async fn list(&self) -> anyhow::Result<Vec<ExternalTask>> {
        self.fetch_tasks(None).await
    }

    async fn with_status(&self, status: TaskStatus) -> anyhow::Result<Vec<ExternalTask>> {
        self.fetch_tasks(Some(status)).await
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn mappings(&self) -> anyhow::Result<Vec<TaskMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(
            "SELECT topic_name, callback, active, default_services
             FROM task_mappings ORDER BY topic_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_mapping).collect()
    }

    async fn upsert_mapping(&self, mapping: TaskMapping) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO task_mappings (topic_name, callback, active, default_services)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (topic_name) DO UPDATE SET
                callback = excluded.callback,
                active = excluded.active,
                default_services = excluded.default_services",
        )
        .bind(&mapping.topic_name)
        .bind(&mapping.callback)
        .bind(mapping.active)
        .bind(serde_json::to_string(&mapping.default_services)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mapping_for(&self, topic_name: &str) -> anyhow::Result<Option<TaskMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(
            "SELECT topic_name, callback, active, default_services
             FROM task_mappings WHERE topic_name = ?",
        )
        .bind(topic_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_mapping).transpose()
    }
}
