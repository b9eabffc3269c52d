//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// `json` switches log lines to JSON.
const LOG_FORMAT_ENV: &str = "QUEUECTL_LOG_FORMAT";

/// Logs go to stderr so stdout stays machine-readable. Level from `RUST_LOG`,
/// default `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
