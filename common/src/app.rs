//! Arma las piezas del worker a partir de la configuración.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::engine::EngineClient;
use crate::pipeline::Pipeline;
use crate::registry::HandlerRegistry;
use crate::store::SqliteStore;
use crate::work_units::builtin_registry;

/// Store, engine, registro y pipeline compartidos por el worker y el CLI.
pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub engine: Arc<dyn EngineClient>,
    pub registry: Arc<HandlerRegistry>,
    pub pipeline: Arc<Pipeline>,
}

impl App {
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.data_dir).await?);
        let engine: Arc<dyn EngineClient> = Arc::new(
            config
                .engine_client()
                .context("creando el cliente HTTP del engine")?,
        );
        let registry = builtin_registry(engine.clone())?;
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            store.clone(),
            engine.clone(),
            registry.clone(),
            config.pipeline_settings(),
        ));

        info!(
            "engine={} data_dir={} handlers={}",
            config.engine_url,
            config.data_dir.display(),
            registry.len()
        );

        Ok(Self {
            config,
            store,
            engine,
            registry,
            pipeline,
        })
    }
}
