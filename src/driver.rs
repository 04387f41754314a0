//! Client-side façade: a `Connection` that owns a connection id and a
//! shared handle to the [`Dispatcher`] it was allocated from, plus
//! small request builders for the `please:<verb>` grammar.
//!
//! The original expresses a back-reference from connection to the
//! dispatcher, which Rust's ownership rules make awkward to keep
//! verbatim. `Connection` is re-architected here as an opaque handle
//! plus a method table dispatched against a shared-ownership
//! dispatcher reference — an `Arc<Dispatcher>` plus a [`ConnectionId`],
//! with every operation forwarded to the dispatcher's
//! `send`/`notify`/`wait`/`receive` quartet. The connection never owns
//! the dispatcher.

use std::sync::Arc;
use thiserror::Error;

use crate::dispatcher::Dispatcher;
use crate::ids::ConnectionId;
use crate::parser::{self, escape_value};

/// Fixed sentinel response strings the engine can return.
/// A driver-side caller distinguishes these from success text since
/// the wire protocol carries no structured status code.
const KNOWN_ERROR_PREFIXES: &[&str] = &[
    "parse error.",
    "transaction is already exists.",
    "cannot find transaction.",
    "transaction start is failed.",
    "permission denied",
    "io error",
    "row conflict",
    "unknown table",
    "unknown column",
    "arithmetic overflow",
];

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Engine(#[from] crate::error::Error),
    #[error("connection was closed by the dispatcher")]
    ConnectionClosed,
    #[error("server returned an error: {0}")]
    Remote(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// An opaque handle to one session. Holds no file or transaction state
/// of its own — every operation is a round trip through the dispatcher
/// it was allocated from.
pub struct Connection {
    id: ConnectionId,
    dispatcher: Arc<Dispatcher>,
}

impl Connection {
    /// Allocates a new connection from `dispatcher`.
    pub fn open(dispatcher: Arc<Dispatcher>) -> DriverResult<Self> {
        let id = dispatcher.get_connection()?;
        Ok(Self { id, dispatcher })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Sends one already-formatted `please:<verb> ...` request and
    /// blocks for the worker's reply. Per-connection requests are
    /// strictly FIFO: the caller cannot issue the next request until
    /// this one returns.
    pub fn execute(&self, request: &str) -> DriverResult<String> {
        if self.dispatcher.is_closed(&self.id) {
            return Err(DriverError::ConnectionClosed);
        }
        self.dispatcher.send(&self.id, request.as_bytes().to_vec())?;
        self.dispatcher.notify(&self.id, true);
        self.dispatcher.wait(&self.id);
        let bytes = self.dispatcher.receive(&self.id)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if is_error_response(&text) {
            return Err(DriverError::Remote(text));
        }
        Ok(text)
    }

    pub fn authenticate(&self, user: &str, password: &str) -> DriverResult<()> {
        self.execute(&format!("please:user {user} {password}")).map(|_| ())
    }

    pub fn begin_transaction(&self) -> DriverResult<()> {
        self.execute("please:transaction").map(|_| ())
    }

    pub fn commit(&self) -> DriverResult<()> {
        self.execute("please:commit").map(|_| ())
    }

    pub fn rollback(&self) -> DriverResult<()> {
        self.execute("please:rollback").map(|_| ())
    }

    pub fn insert(&self, table: &str, values: &[(&str, &[u8])]) -> DriverResult<()> {
        let group = encode_group(values);
        self.execute(&format!("please:insert {table} ({group})")).map(|_| ())
    }

    pub fn update(&self, table: &str, set: &[(&str, &[u8])], predicate: &[(&str, &[u8])]) -> DriverResult<()> {
        let set_group = encode_group(set);
        let where_group = encode_group(predicate);
        self.execute(&format!("please:update {table} set ({set_group}) where ({where_group})")).map(|_| ())
    }

    pub fn delete(&self, table: &str, predicate: &[(&str, &[u8])]) -> DriverResult<()> {
        let where_group = encode_group(predicate);
        self.execute(&format!("please:delete {table} where ({where_group})")).map(|_| ())
    }

    /// Runs a `select` and decodes the response lines back into rows,
    /// using `column_type` to resolve each result column's wire
    /// encoding the same way the request grammar does.
    pub fn select(
        &self,
        table: &str,
        predicate: &[(&str, &[u8])],
        column_type: impl Fn(&str) -> Option<crate::column::ColumnType>,
    ) -> DriverResult<Vec<crate::datafile::ColumnValues>> {
        let request = if predicate.is_empty() {
            format!("please:select {table}")
        } else {
            format!("please:select {table} where ({})", encode_group(predicate))
        };
        let response = self.execute(&request)?;
        if response.trim().is_empty() {
            return Ok(Vec::new());
        }
        response
            .lines()
            .map(|line| parser::decode_row(line.as_bytes(), &column_type).map_err(DriverError::from))
            .collect()
    }

    /// Sends the `close` pseudo-request and frees the session slot.
    pub fn close(self) -> DriverResult<()> {
        self.execute("please:close").map(|_| ())
    }
}

fn encode_group(pairs: &[(&str, &[u8])]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!(r#"{k}="{}""#, String::from_utf8_lossy(&escape_value(v))))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_error_response(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    KNOWN_ERROR_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_sentinels_are_recognized() {
        assert!(is_error_response("parse error."));
        assert!(is_error_response("cannot find transaction."));
        assert!(is_error_response("Permission denied: user 'x' cannot insert on table 'y'"));
        assert!(!is_error_response("commit succeeded."));
        assert!(!is_error_response("order_name=\"order1\""));
    }

    #[test]
    fn encode_group_quotes_and_joins_pairs() {
        let pairs: &[(&str, &[u8])] = &[("a", b"1"), ("b", b"x\"y")];
        assert_eq!(encode_group(pairs), r#"a="1", b="x\"y""#);
    }
}
