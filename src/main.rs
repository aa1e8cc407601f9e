use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use adminpanel::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env();
    // Startup banner at info level so something always prints at default verbosity.
    // The backend key is never logged.
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "adminpanel starting: RUST_LOG='{}', http_port={}, backend_url='{}', files_url='{}', audit_limit={}, reconnect_ms={}, secure_cookie={}",
        rust_log,
        config.http_port,
        config.backend_url,
        config.files_url,
        config.audit_limit,
        config.reconnect_delay.as_millis(),
        config.secure_cookie
    );

    adminpanel::server::run(config).await
}
