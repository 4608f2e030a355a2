// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Logging setup and structured events for the bridge.
//!
//! All events go through `tracing` under these targets:
//!
//! | Target | Events |
//! |--------|--------|
//! | `arraybridge::convert` | completed conversions, zero-copy fallbacks |
//! | `arraybridge::oom` | attempts, retries, exhausted budgets |
//! | `arraybridge::memory` | allocation tracking |
//! | `arraybridge::stream` | stream creation and release |
//!
//! [`init_logging`] installs a `tracing-subscriber` fmt subscriber once per
//! process. `RUST_LOG` replaces the configured directives entirely.

use crate::backend::BackendId;
use crate::dtype::DType;
use crate::error::{BridgeError, Result};
use crate::memory::MemoryTracker;
use std::fmt;
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Verbosity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and above.
    Warn,
    /// Informational messages and above.
    #[default]
    Info,
    /// Debug messages and above.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Directive spelling (`"warn"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(BridgeError::invalid_config(format!("unknown log level: {other}"))),
        }
    }
}

/// Subscriber settings for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for every target without an override.
    pub level: LogLevel,
    /// Per-target overrides, e.g. `("arraybridge::oom", Debug)`.
    pub overrides: Vec<(String, LogLevel)>,
    /// Prefix events with a timestamp.
    pub timestamps: bool,
    /// Print the event target.
    pub show_target: bool,
    /// Print source file and line.
    pub file_line: bool,
    /// Colored output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            overrides: Vec::new(),
            timestamps: true,
            show_target: true,
            file_line: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Defaults: info, timestamps, targets, colors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base level.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Override the level of one target (and its children).
    #[must_use]
    pub fn with_target_level(mut self, target: impl Into<String>, level: LogLevel) -> Self {
        self.overrides.push((target.into(), level));
        self
    }

    /// Enable or disable timestamps.
    #[must_use]
    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.timestamps = enable;
        self
    }

    /// Enable or disable ANSI colors.
    #[must_use]
    pub fn with_ansi(mut self, enable: bool) -> Self {
        self.ansi = enable;
        self
    }

    /// Debug everywhere with file and line, for following single attempts.
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            file_line: true,
            ..Self::default()
        }
    }

    /// Info without colors; per-attempt OOM bookkeeping stays quiet but
    /// retries (warn) and exhausted budgets (error) still show.
    #[must_use]
    pub fn production() -> Self {
        Self {
            ansi: false,
            ..Self::default()
        }
        .with_target_level("arraybridge::oom", LogLevel::Warn)
    }

    /// Warnings only, no timestamps or colors.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            level: LogLevel::Warn,
            timestamps: false,
            show_target: false,
            ansi: false,
            ..Self::default()
        }
    }

    /// `EnvFilter` directive string for this configuration.
    #[must_use]
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        directives.extend(
            self.overrides
                .iter()
                .map(|(target, level)| format!("{target}={level}")),
        );
        directives.join(",")
    }
}

static INIT_LOGGING: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops, and a subscriber
/// already installed by the application is left in place.
///
/// ## Example
///
/// ```rust
/// use arraybridge::{init_logging, LogConfig, LogLevel};
///
/// init_logging(&LogConfig::testing().with_target_level("arraybridge::oom", LogLevel::Debug));
/// ```
pub fn init_logging(config: &LogConfig) {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.directives()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.ansi)
            .with_target(config.show_target)
            .with_file(config.file_line)
            .with_line_number(config.file_line);

        let installed = if config.timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already set; keeping it");
        }
    });
}

/// Log a completed conversion.
pub fn log_conversion(
    source: BackendId,
    target: BackendId,
    shape: &[usize],
    dtype: DType,
    zero_copy: bool,
    elapsed: Duration,
) {
    tracing::debug!(
        target: "arraybridge::convert",
        %source,
        %target,
        ?shape,
        %dtype,
        zero_copy,
        elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        "converted buffer"
    );
}

/// Log the tracked memory of a backend.
pub fn log_memory_usage(backend: BackendId, tracker: &MemoryTracker, context: &str) {
    #[allow(clippy::cast_precision_loss)]
    let mib = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);

    tracing::debug!(
        target: "arraybridge::memory",
        %backend,
        allocated_mib = format!("{:.2}", mib(tracker.allocated_bytes())),
        cached_mib = format!("{:.2}", mib(tracker.cached_bytes())),
        peak_mib = format!("{:.2}", mib(tracker.peak_bytes())),
        limit_bytes = tracker.limit_bytes(),
        context,
        "memory usage"
    );
}
