use std::net::SocketAddr;

use tracing::info;

use super::GlobalOpts;

pub async fn serve(globals: &GlobalOpts, port: u16) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let store = globals.open_store(&config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
    };
    cutover_api::serve(store, addr, shutdown).await?;
    info!("status API stopped");
    Ok(())
}
