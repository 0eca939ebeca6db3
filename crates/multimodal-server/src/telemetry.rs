// multimodal-server/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` wins; otherwise `debug` when the service runs with DEBUG set.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
