use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG tiene prioridad sobre el filtro por defecto
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bptl_common=info,bptl_worker=debug,reqwest=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    worker::run().await
}
