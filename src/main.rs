mod bus;
mod cache;
mod clock;
mod config;
mod controller;
mod domain;
mod hardware;
mod provider;
mod push;
mod settings;
mod soc;
mod telemetry;
#[cfg(test)]
mod testutil;
mod util;

use anyhow::Result;
use config::AppConfig;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let mut state = controller::AppState::new(config).await?;

    info!(
        site = %state.site.config().title,
        loadpoints = state.site.loadpoints().len(),
        "starting Open Charge Controller"
    );

    let cancel = CancellationToken::new();
    let handles = state.spawn_tasks(&cancel);

    telemetry::shutdown_signal().await;

    // stop the tick loop first; the bus tasks drain once the loadpoints'
    // senders are gone
    cancel.cancel();
    drop(state);
    for handle in handles {
        let _ = handle.await;
    }

    warn!("shutdown complete");
    Ok(())
}
