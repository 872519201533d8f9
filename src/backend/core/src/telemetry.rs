//! Logging initialization.
//!
//! Structured logging via `tracing`; metrics use the `metrics` facade and are
//! emitted inline where the instrumented code lives. Exporters are the
//! embedding application's concern.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilitySettings;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Call once at startup; a second
/// call returns an error from the global registry.
pub fn init(settings: &ObservabilitySettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_logging {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer().pretty()).try_init()?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        json = settings.json_logging,
        "Telemetry initialized"
    );
    Ok(())
}
