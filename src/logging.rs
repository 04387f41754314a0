//! Structured logging, replacing the original's ad hoc `DB_LOG`/`LOG`
//! macros (`Logger.h`) with `tracing`.
//!
//! Grounded on `omendb-rust/src/logging.rs`'s `LogConfig` struct and
//! `default()`/`production()`/`development()`/`init_logging()`/
//! `init_from_env()` shape, trimmed to the fields slotdb actually
//! varies (no query-logging toggle, no log-file redirection — the
//! dispatcher and data file emit spans straight to stdout/stderr).

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"`.
    pub level: String,
    /// JSON lines instead of human-readable pretty output.
    pub json_format: bool,
    /// Emit span open/close events (useful for seeing commit/rollback
    /// and row-wait spans complete, noisy otherwise).
    pub log_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, log_spans: false }
    }
}

impl LogConfig {
    pub fn production() -> Self {
        Self { level: "info".to_string(), json_format: true, log_spans: false }
    }

    pub fn development() -> Self {
        Self { level: "debug".to_string(), json_format: false, log_spans: true }
    }
}

/// Installs a global `tracing` subscriber built from `config`. Safe to
/// call once per process; a second call returns an error rather than
/// panicking.
pub fn init_logging(config: LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let span_events = if config.log_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let builder = fmt::fmt().with_env_filter(filter).with_span_events(span_events);
    if config.json_format {
        builder.json().try_init().map_err(|err| anyhow::anyhow!(err))?;
    } else {
        builder.try_init().map_err(|err| anyhow::anyhow!(err))?;
    }
    Ok(())
}

/// Reads `RUST_LOG` and `SLOTDB_LOG_FORMAT` (`"json"` or anything
/// else for pretty) from the environment and initializes logging.
pub fn init_from_env() -> anyhow::Result<()> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let json_format = std::env::var("SLOTDB_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    init_logging(LogConfig { level, json_format, log_spans: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_pretty_info() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json_format);
    }

    #[test]
    fn production_config_is_json() {
        let config = LogConfig::production();
        assert!(config.json_format);
    }

    #[test]
    fn development_config_enables_spans() {
        let config = LogConfig::development();
        assert!(config.log_spans);
        assert_eq!(config.level, "debug");
    }
}
