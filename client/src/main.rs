use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    // El CLI imprime su propia salida; los logs sólo muestran avisos salvo RUST_LOG
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bptl_common=warn,bptl_client=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cli::run().await
}
