#![forbid(unsafe_code)]

//! Stream configuration.
//!
//! Every recognized option is a field of [`StreamConfig`]. JSON sources are
//! parsed with unknown fields rejected; environment sources read the
//! `DEGU_STREAM_*` variables.
//!
//! | Variable | Values | Field |
//! |----------|--------|-------|
//! | `DEGU_STREAM_DEBUG` | `1`, `true`, `yes`, `on` | `debug` |
//! | `DEGU_STREAM_FREEZE_MODE` | `flat`, `nested` | `freeze_mode` |
//! | `DEGU_STREAM_STRICT` | `1`, `true`, `yes`, `on` | `strict_keys` |

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// How repeated `freeze()` calls combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezeMode {
    /// A single flag: any number of `freeze()` calls is undone by one
    /// `unfreeze()`.
    #[default]
    Flat,
    /// A depth counter: each `freeze()` needs a matching `unfreeze()`.
    Nested,
}

impl FreezeMode {
    fn parse(value: &str) -> Result<Self, StreamError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "nested" => Ok(Self::Nested),
            other => Err(StreamError::Config(format!(
                "unknown freeze mode '{other}' (expected 'flat' or 'nested')"
            ))),
        }
    }
}

/// Options for a [`PropertyStream`](crate::PropertyStream).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Name attached to log events. Default: none.
    pub label: Option<String>,

    /// Emit a `debug` event for every watcher and change publish.
    /// Default: false.
    pub debug: bool,

    /// Freeze combination rule. Default: [`FreezeMode::Flat`].
    pub freeze_mode: FreezeMode,

    /// Reject `update()` entries for keys the container does not hold.
    /// Default: false.
    pub strict_keys: bool,
}

impl StreamConfig {
    /// Set the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Enable or disable per-notification debug events.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the freeze combination rule.
    #[must_use]
    pub fn with_freeze_mode(mut self, mode: FreezeMode) -> Self {
        self.freeze_mode = mode;
        self
    }

    /// Enable or disable strict keys for `update()`.
    #[must_use]
    pub fn with_strict_keys(mut self, strict: bool) -> Self {
        self.strict_keys = strict;
        self
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Read configuration through a custom environment lookup.
    pub fn from_env_with<F>(get_env: F) -> Result<Self, StreamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = get_env("DEGU_STREAM_DEBUG") {
            config.debug = env_flag(&value);
        }
        if let Some(value) = get_env("DEGU_STREAM_FREEZE_MODE") {
            config.freeze_mode = FreezeMode::parse(&value)?;
        }
        if let Some(value) = get_env("DEGU_STREAM_STRICT") {
            config.strict_keys = env_flag(&value);
        }
        Ok(config)
    }

    /// Parse configuration from a JSON object. Unknown fields are rejected.
    pub fn from_json(source: &str) -> Result<Self, StreamError> {
        serde_json::from_str(source).map_err(|err| StreamError::Config(err.to_string()))
    }
}

#[inline]
fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
