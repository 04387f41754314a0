//! Loads per-table definitions from disk into the raw
//! `map<column_name, "type:width">` shape `TableDescriptor::parse`
//! expects.
//!
//! Grounded on `omendb-rust/src/catalog.rs`'s `Catalog`, which persists
//! one metadata file per table directory and loads it back at startup;
//! here each table's definition is its own `<data_dir>/<name>.toml`
//! file, and `figment` (already pulled in for [`crate::config`]) does
//! the deserializing rather than hand-rolled JSON.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use figment::providers::{Format, Toml};
use figment::Figment;

use crate::error::{Error, Result};

/// One table's raw definition: column entries (`<COL> -> "type:width"`),
/// `COLUMN_ORDER`, and the four operation permission lists, all
/// flattened into one string map.
pub type TableDefinition = BTreeMap<String, String>;

/// Scans `data_dir` for `*.toml` schema files and loads each into a
/// [`TableDefinition`] keyed by its lower-cased table name (the file
/// stem). The corresponding row-storage file `<data_dir>/<name>` is
/// expected to already exist, created out-of-band; this function only
/// loads schemas, it does not touch row files.
pub fn load_table_definitions(data_dir: &Path) -> Result<HashMap<String, TableDefinition>> {
    let mut definitions = HashMap::new();
    let entries = std::fs::read_dir(data_dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Parse(format!("non-UTF8 table schema file name: {path:?}")))?
            .to_ascii_lowercase();
        let definition: TableDefinition = Figment::new()
            .merge(Toml::file(&path))
            .extract()
            .map_err(|err| Error::Parse(format!("invalid table schema '{path:?}': {err}")))?;
        definitions.insert(name, definition);
    }
    Ok(definitions)
}
