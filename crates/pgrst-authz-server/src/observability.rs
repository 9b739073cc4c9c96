//! Tracing setup for the service.
//!
//! The filter sits behind a reload layer so the level read from the
//! configuration file can replace the startup default once the config is
//! loaded. `RUST_LOG` always wins over both.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Install the global subscriber at `info` until the configuration is read.
pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(filter_directives(level)));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();
}

/// Apply the configured logging level, unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(filter_directives(level));
        });
    }
}

/// Filter for `level`. File watcher internals stay at `warn` unless the
/// service itself logs at `trace`.
fn filter_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    if level == "trace" || level == "off" {
        level
    } else {
        format!("{level},notify=warn,notify_debouncer_mini=warn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives("info"),
            "info,notify=warn,notify_debouncer_mini=warn"
        );
        assert_eq!(
            filter_directives(" DEBUG "),
            "debug,notify=warn,notify_debouncer_mini=warn"
        );
        assert_eq!(filter_directives("trace"), "trace");
        assert_eq!(filter_directives("off"), "off");
        assert!(EnvFilter::try_new(filter_directives("warn")).is_ok());
    }
}
