//! slotdb — an in-process, file-backed storage engine with row-level
//! transactional locking, exposed through a fixed-slot session
//! dispatcher and a tiny `please:<verb>` query language.
//!
//! Module layout mirrors the dependency order in which the engine is
//! built up, leaves first: identifiers and digests ([`ids`]), table
//! descriptors ([`column`]), the on-disk row codec ([`row`]) and data
//! file ([`datafile`]), the transaction/table registry ([`registry`]),
//! the wire parser ([`parser`]), the session dispatcher
//! ([`dispatcher`]), and finally the client-side driver ([`driver`])
//! and the thin TCP gateway ([`gateway`]) that wires a socket to a
//! dispatcher connection.

pub mod catalog;
pub mod column;
pub mod config;
pub mod datafile;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod logging;
pub mod parser;
pub mod registry;
pub mod row;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use driver::{Connection, DriverError};
pub use error::{Error, Result};
pub use registry::Registry;
