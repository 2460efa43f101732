#![forbid(unsafe_code)]

//! Log setup for binaries and test harnesses that embed degu.
//!
//! The library itself only emits `tracing` events:
//!
//! | Level | Event |
//! |-------|-------|
//! | `trace` | observed and deferred writes, newly observed keys |
//! | `debug` | flushes at unfreeze; every publish when `StreamConfig::debug` is set |
//! | `warn` | strict `update()` rejections |
//!
//! With the `log-init` feature, [`init`] installs a `tracing-subscriber`
//! formatter filtered by `DEGU_LOG` (default `warn`), emitting JSON lines
//! when `DEGU_LOG_FORMAT=json`.

/// Filter used when `DEGU_LOG` is unset or empty.
pub const DEFAULT_DIRECTIVE: &str = "warn";

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Filter directive and format resolved from an environment lookup.
#[must_use]
pub fn settings_from_env_with<F>(get_env: F) -> (String, LogFormat)
where
    F: Fn(&str) -> Option<String>,
{
    let directive = get_env("DEGU_LOG")
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned());
    let format = match get_env("DEGU_LOG_FORMAT") {
        Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Text,
    };
    (directive, format)
}

/// Install a global subscriber configured from the environment.
///
/// Returns `false` if a global subscriber was already installed.
#[cfg(feature = "log-init")]
pub fn init() -> bool {
    use tracing_subscriber::EnvFilter;

    let (directive, format) = settings_from_env_with(|key| std::env::var(key).ok());
    let filter =
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.is_ok()
}
