use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize telemetry with debug logging for this crate
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nvr_camlink=debug"));

    // try_init so tests and embedders that already installed a subscriber keep theirs
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();

    if result.is_ok() {
        info!("📊 Telemetry initialized");
    }
}
