use std::sync::Arc;
use tracing::{error, info};

use nvr_camlink::adapter::{LoggingAdapter, NoopEvents};
use nvr_camlink::{telemetry, web, AppConfig, CameraCore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    eprintln!("🚀 Starting NVR camera link...");

    telemetry::init_telemetry();

    let config = AppConfig::load("config.json")?;
    info!(
        "⚙️ Configuration loaded: {} cameras, web port {}",
        config.cameras.len(),
        config.web_port
    );

    let core = CameraCore::new(&config, Arc::new(LoggingAdapter), Arc::new(NoopEvents))?;
    core.run();

    let web_core = core.clone();
    let web_port = config.web_port;
    let web_handle = tokio::spawn(async move {
        info!("🔧 Web server task started");
        if let Err(e) = web::start_web_server(web_port, web_core).await {
            error!("Web server failed: {}", e);
        }
    });

    info!("🔧 All tasks started, waiting for Ctrl-C...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }

    web_handle.abort();
    core.shutdown().await;

    info!("🛑 Server shutdown complete");
    Ok(())
}
