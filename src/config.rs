//! Layered configuration: defaults, then an optional `slotdb.toml`,
//! then `SLOTDB_`-prefixed environment variables.
//!
//! Grounded on `omendb/server/src/config.rs`'s `Config` struct and
//! `from_file`/`from_env`/`validate` methods, but loaded through
//! `figment` instead of hand-rolled `toml::from_str` plus one `if let
//! Ok(var) = env::var(...)` per field. This is the Rust-native
//! replacement for the original's `webConfiguration` global map
//! (`Common.h`); HTTP/URL-routing configuration has no counterpart
//! here since this crate has no HTTP surface.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::dispatcher::DEFAULT_SESSION_SLOTS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one file per table, plus each table's
    /// `<name>.toml` schema.
    pub data_dir: PathBuf,
    /// Fixed session slot count.
    pub session_slots: usize,
    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"`
    /// or `"slotdb=debug,info"`.
    pub log_level: String,
    /// Emit JSON-formatted logs instead of pretty-printed ones.
    pub log_json: bool,
    /// `host:port` the TCP gateway binds to.
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./database/data"),
            session_slots: DEFAULT_SESSION_SLOTS,
            log_level: "info".to_string(),
            log_json: false,
            listen_addr: "127.0.0.1:7878".to_string(),
        }
    }
}

impl Config {
    /// Loads defaults, then merges an optional config file, then
    /// `SLOTDB_`-prefixed environment variables (highest precedence).
    pub fn load(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SLOTDB_"));
        figment.extract()
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.session_slots == 0 {
            return Err(crate::error::Error::Parse(
                "session_slots must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn loads_defaults_with_no_file_or_env() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.session_slots, DEFAULT_SESSION_SLOTS);
        assert_eq!(config.data_dir, PathBuf::from("./database/data"));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slotdb.toml");
        std::fs::write(&path, "session_slots = 5\nlisten_addr = \"0.0.0.0:9000\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.session_slots, 5);
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn rejects_zero_session_slots() {
        let mut config = Config::default();
        config.session_slots = 0;
        assert!(config.validate().is_err());
    }
}
