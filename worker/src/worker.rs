use anyhow::Result;
use bptl_common::{App, Config, MappingStore, Scheduler};
use tracing::{info, warn};

/// Loop principal del worker.
/// - Lee la configuración del entorno y abre el store.
/// - Re-encola las tareas que quedaron en `initial`.
/// - Cada `POLL_INTERVAL_SECS` hace fetch-and-lock y reparte las tareas
///   entre `WORKER_CONCURRENCY` workers.
/// - Con Ctrl-C deja de pedir tareas y espera las que están en vuelo.
pub async fn run() -> Result<()> {
    let config = Config::from_env();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let scheduler_settings = config.scheduler_settings();
    let app = App::bootstrap(config).await?;

    info!(
        "worker iniciado en {} (max_tasks={}, concurrency={})",
        hostname, scheduler_settings.max_tasks, scheduler_settings.concurrency
    );

    let active: Vec<String> = app
        .store
        .active_mappings()
        .await?
        .into_iter()
        .map(|mapping| mapping.topic_name)
        .collect();
    if active.is_empty() {
        warn!("no hay mappings activos; no se piden tareas hasta configurar alguno");
    } else {
        info!("topics activos: {}", active.join(", "));
    }

    let scheduler = Scheduler::new(app.pipeline.clone(), scheduler_settings);
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("no se pudo escuchar Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("worker detenido");
    Ok(())
}
