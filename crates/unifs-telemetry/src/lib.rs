//! Logging and trace export for unifs binaries.
//!
//! Log output goes to stderr, filtered by `RUST_LOG` (default `info`).
//! With the `telemetry` feature, spans are also exported over OTLP when the
//! standard OTel environment variables ask for it:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 unifs ls sftp://host/tmp
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to turn export off even when an endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps exporters alive; flushes pending spans on drop.
#[must_use = "dropping the guard stops trace export"]
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "telemetry")]
    _otel: Option<OtelGuard>,
}

/// Check whether OTel export should be enabled.
///
/// `OTEL_SDK_DISABLED=true` wins. Otherwise export is on when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set, or `OTEL_TRACES_EXPORTER` is set to
/// anything but `none`.
pub fn otel_enabled() -> bool {
    let var = |name: &str| std::env::var(name).ok();
    otel_enabled_from(
        var("OTEL_SDK_DISABLED").as_deref(),
        var("OTEL_EXPORTER_OTLP_ENDPOINT").as_deref(),
        var("OTEL_TRACES_EXPORTER").as_deref(),
    )
}

fn otel_enabled_from(disabled: Option<&str>, endpoint: Option<&str>, exporter: Option<&str>) -> bool {
    if disabled.is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if endpoint.is_some() {
        return true;
    }
    exporter.is_some_and(|e| !e.eq_ignore_ascii_case("none"))
}

/// Install the global subscriber.
///
/// `verbosity` raises the default level when `RUST_LOG` is unset: 0 is
/// `info`, 1 is `debug`, anything higher is `trace`.
pub fn init(service_name: &str, verbosity: u8) -> TelemetryGuard {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    if otel_enabled() {
        match otel_layer(service_name) {
            Ok((layer, guard)) => {
                registry.with(layer).init();
                return TelemetryGuard { _otel: Some(guard) };
            }
            Err(e) => eprintln!("OTel export disabled: {e}"),
        }
    }

    #[cfg(not(feature = "telemetry"))]
    let _ = service_name;

    registry.init();
    TelemetryGuard::default()
}
