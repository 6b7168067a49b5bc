//! Scheduler del worker: ticker periódico -> fetch-and-lock -> canal acotado
//! -> pool fijo de workers que hacen execute + complete.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::pipeline::Pipeline;
use crate::task::LocalId;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub max_tasks: u32,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_tasks: 10,
            concurrency: 4,
            queue_capacity: 100,
        }
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, settings: SchedulerSettings) -> Self {
        Self { pipeline, settings }
    }

    /// Tareas que quedaron en `initial` tras una caída se re-encolan; las que
    /// quedaron en `in_progress` sólo se reportan.
    pub async fn recover(&self) -> Result<Vec<LocalId>, TaskError> {
        let pending = self.pipeline.pending_ids().await?;
        if !pending.is_empty() {
            info!("recuperando {} tarea(s) en initial", pending.len());
        }
        for task in self.pipeline.in_progress().await? {
            warn!(
                "tarea id={} ({}) quedó en in_progress; no se re-ejecuta automáticamente",
                task.id, task
            );
        }
        Ok(pending)
    }

    /// Una pasada de fetch; encola los ids obtenidos.
    async fn tick(&self, tx: &mpsc::Sender<LocalId>) {
        match self.pipeline.fetch_and_lock(self.settings.max_tasks).await {
            Ok(outcome) => {
                if outcome.count > 0 {
                    info!(
                        "worker={} obtuvo {} tarea(s), encolando",
                        outcome.worker_id, outcome.count
                    );
                }
                for task in outcome.tasks {
                    if tx.send(task.id).await.is_err() {
                        warn!("canal de trabajo cerrado, tarea id={} queda en initial", task.id);
                        return;
                    }
                }
            }
            Err(e) => error!("fetch-and-lock falló, se reintenta en el próximo tick: {}", e),
        }
    }

    /// Corre hasta que `shutdown` se resuelve. Las tareas en vuelo terminan
    /// antes de devolver.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let concurrency = self.settings.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<LocalId>(self.settings.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(concurrency);
        for slot in 0..concurrency {
            let rx = rx.clone();
            let pipeline = self.pipeline.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let id = match next {
                        Some(id) => id,
                        None => break,
                    };
                    debug!("worker {} toma tarea id={}", slot, id);
                    match pipeline.execute_and_complete(id).await {
                        Ok(status) => info!("tarea id={} terminó en {}", id, status),
                        Err(e) => warn!("tarea id={} falló: {}", id, e),
                    }
                }
            }));
        }

        tokio::pin!(shutdown);

        let recovered = async {
            match self.recover().await {
                Ok(pending) => {
                    for id in pending {
                        if tx.send(id).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => error!("no se pudo recuperar tareas pendientes: {}", e),
            }
        };
        let stopped = tokio::select! {
            biased;
            _ = &mut shutdown => true,
            _ = recovered => false,
        };

        info!(
            "scheduler iniciado: intervalo={:?} max_tasks={} concurrency={}",
            self.settings.poll_interval, self.settings.max_tasks, concurrency
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Con la cola llena el tick queda esperando en `send`; el shutdown lo
        // interrumpe y lo que no se encoló sigue en initial hasta el próximo arranque.
        while !stopped {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = self.tick(&tx) => {}
                    }
                }
            }
        }
        info!("shutdown recibido, esperando tareas en vuelo");

        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("worker del pool terminó con error: {}", e);
            }
        }
        info!("scheduler detenido");
        Ok(())
    }
}
