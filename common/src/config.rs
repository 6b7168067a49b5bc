use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::engine::HttpEngineClient;
use crate::error::EngineError;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerSettings;

const DEFAULT_ENGINE_URL: &str = "http://localhost:8080/engine-rest/";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_MAX_TASKS: u32 = 10;
const DEFAULT_LOCK_DURATION_SECS: u64 = 10 * 60;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_COMPLETE_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Configuración leída de variables de entorno.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub engine_url: String,
    /// Valor completo del header Authorization (`Bearer ...` / `Basic ...`).
    pub engine_auth: Option<String>,
    pub data_dir: PathBuf,
    pub max_tasks: u32,
    pub lock_duration: Duration,
    pub long_polling_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub worker_concurrency: usize,
    pub complete_retries: u32,
    pub retry_delay: Duration,
    pub http_timeout: Duration,
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{}='{}' no es válido, usando el valor por defecto", key, raw);
            default
        }),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine_url = lookup("ENGINE_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string());
        let engine_auth = lookup("ENGINE_AUTH").filter(|auth| !auth.trim().is_empty());
        let data_dir = lookup("BPTL_DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

        let long_polling_timeout = match lookup("LONG_POLLING_TIMEOUT_MS") {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!("LONG_POLLING_TIMEOUT_MS='{}' no es válido, long polling desactivado", raw);
                    None
                }
            },
        };

        Self {
            engine_url,
            engine_auth,
            data_dir: PathBuf::from(data_dir),
            max_tasks: parse_or(&lookup, "MAX_TASKS", DEFAULT_MAX_TASKS),
            lock_duration: Duration::from_secs(parse_or(
                &lookup,
                "LOCK_DURATION_SECS",
                DEFAULT_LOCK_DURATION_SECS,
            )),
            long_polling_timeout,
            poll_interval: Duration::from_secs(
                parse_or(&lookup, "POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS).max(1),
            ),
            worker_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)
                .max(1),
            complete_retries: parse_or(&lookup, "COMPLETE_RETRIES", DEFAULT_COMPLETE_RETRIES),
            retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
            http_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            lock_duration: self.lock_duration,
            long_polling_timeout: self.long_polling_timeout,
            retry: RetryPolicy::new(self.complete_retries).with_delay(self.retry_delay),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: self.poll_interval,
            max_tasks: self.max_tasks,
            concurrency: self.worker_concurrency,
            queue_capacity: (self.max_tasks as usize).max(self.worker_concurrency) * 2,
        }
    }

    pub fn engine_client(&self) -> Result<HttpEngineClient, EngineError> {
        HttpEngineClient::new(&self.engine_url, self.engine_auth.clone(), self.http_timeout)
    }
}
