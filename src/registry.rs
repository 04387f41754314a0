//! Transaction/table registry.
//!
//! Maps the verbs dispatched by the session worker onto concrete
//! `DataFile` operations, owns the authenticated-user map and the
//! per-connection transaction table, and fans `commit`/`rollback` out
//! across every data file a transaction touched. Grounded on the
//! `Transaction`/`Table` nested classes of `Database.h`: that original
//! only ever records which table a transaction "targets" and leaves
//! `Transaction::commit()` as a `// TODO:` stub, so the actual
//! per-table dispatch here is built up from scratch rather than
//! translated line-for-line.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::column::{Operation, TableDescriptor};
use crate::datafile::{ColumnValues, DataFile};
use crate::error::{Error, Result};
use crate::ids::{digest_password, ConnectionId, IdGenerator};

/// Transaction id used for reads the registry performs on its own
/// behalf (authentication lookups) rather than on behalf of a client
/// transaction. Chosen far outside the range `IdGenerator` ever
/// produces so it can never collide with a real transaction id.
const SYSTEM_TX_ID: i16 = i16::MIN;

struct Transaction {
    id: i16,
    touched_tables: HashSet<String>,
}

/// Tracks open transactions and the tables each has touched;
/// drives commit/rollback across every file a transaction reached.
pub struct Registry {
    tables: HashMap<String, DataFile>,
    transactions: Mutex<HashMap<ConnectionId, Transaction>>,
    next_id: Mutex<IdGenerator<i16>>,
    authenticated: Mutex<HashMap<ConnectionId, String>>,
}

impl Registry {
    /// Loads every table named in `definitions` from `<base_dir>/<name>`.
    /// `definitions` is the on-disk table metadata; parsing it into
    /// this shape is a config-layer concern, not the registry's.
    pub fn open(base_dir: &Path, definitions: &HashMap<String, BTreeMap<String, String>>) -> Result<Self> {
        let mut tables = HashMap::with_capacity(definitions.len());
        for (name, definition) in definitions {
            let descriptor = TableDescriptor::parse(definition)?;
            let data_file = DataFile::open(name, descriptor, base_dir)?;
            tables.insert(data_file.table_name().to_string(), data_file);
        }
        Ok(Self {
            tables,
            transactions: Mutex::new(HashMap::new()),
            next_id: Mutex::new(IdGenerator::new(0)),
            authenticated: Mutex::new(HashMap::new()),
        })
    }

    fn table(&self, name: &str) -> Result<&DataFile> {
        self.tables.get(&name.to_ascii_lowercase()).ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn descriptor(&self, table_name: &str) -> Result<&TableDescriptor> {
        Ok(self.table(table_name)?.descriptor())
    }

    fn user_for(&self, connection: &ConnectionId) -> String {
        self.authenticated.lock().unwrap().get(connection).cloned().unwrap_or_default()
    }

    /// `user <name> <password>`: verifies the password's digest against
    /// the `users` table and records the authenticated user for later
    /// permission checks (digest scheme supplemented from `BCryptHash.h`).
    pub fn authenticate(&self, connection: &ConnectionId, name: &str, password: &str) -> Result<()> {
        let users = self.table("users")?;
        let mut predicate = ColumnValues::new();
        predicate.insert("name".to_string(), name.as_bytes().to_vec());
        let rows = users.select(SYSTEM_TX_ID, &predicate)?;
        let row = rows.into_iter().next().ok_or_else(|| Error::PermissionDenied {
            user: name.to_string(),
            operation: "authenticate".to_string(),
            table: "users".to_string(),
        })?;
        let stored = row.get("password").ok_or_else(|| Error::UnknownColumn("password".to_string()))?;
        let digest = digest_password(password);
        if stored.as_slice() != digest.as_slice() {
            return Err(Error::PermissionDenied {
                user: name.to_string(),
                operation: "authenticate".to_string(),
                table: "users".to_string(),
            });
        }
        self.authenticated.lock().unwrap().insert(connection.clone(), name.to_string());
        Ok(())
    }

    /// `transaction`: starts a new transaction for this connection.
    /// Errors with `TransactionExists` if one is already open.
    pub fn begin_transaction(&self, connection: &ConnectionId) -> Result<i16> {
        let mut transactions = self.transactions.lock().unwrap();
        if transactions.contains_key(connection) {
            return Err(Error::TransactionExists);
        }
        let id = self.next_id.lock().unwrap().next();
        transactions.insert(connection.clone(), Transaction { id, touched_tables: HashSet::new() });
        Ok(id)
    }

    pub fn has_transaction(&self, connection: &ConnectionId) -> bool {
        self.transactions.lock().unwrap().contains_key(connection)
    }

    /// Records that `connection`'s open transaction has touched
    /// `table_name`, returning its transaction id.
    fn touch(&self, connection: &ConnectionId, table_name: &str) -> Result<i16> {
        let mut transactions = self.transactions.lock().unwrap();
        let tx = transactions.get_mut(connection).ok_or(Error::NoTransaction)?;
        tx.touched_tables.insert(table_name.to_ascii_lowercase());
        Ok(tx.id)
    }

    fn check_permission(&self, connection: &ConnectionId, table_name: &str, operation: Operation, op_name: &str) -> Result<()> {
        let user = self.user_for(connection);
        let table = self.table(table_name)?;
        if !table.is_permitted(operation, &user) {
            return Err(Error::PermissionDenied {
                user,
                operation: op_name.to_string(),
                table: table_name.to_string(),
            });
        }
        Ok(())
    }

    pub fn insert(&self, connection: &ConnectionId, table_name: &str, values: ColumnValues) -> Result<()> {
        self.check_permission(connection, table_name, Operation::Insert, "insert")?;
        let tid = self.touch(connection, table_name)?;
        self.table(table_name)?.insert(tid, values)
    }

    pub fn update(&self, connection: &ConnectionId, table_name: &str, values: &ColumnValues, predicate: &ColumnValues) -> Result<bool> {
        self.check_permission(connection, table_name, Operation::Update, "update")?;
        let tid = self.touch(connection, table_name)?;
        self.table(table_name)?.update(tid, values, predicate)
    }

    pub fn delete(&self, connection: &ConnectionId, table_name: &str, predicate: &ColumnValues) -> Result<bool> {
        self.check_permission(connection, table_name, Operation::Delete, "delete")?;
        let tid = self.touch(connection, table_name)?;
        self.table(table_name)?.delete(tid, predicate)
    }

    pub fn select(&self, connection: &ConnectionId, table_name: &str, predicate: &ColumnValues) -> Result<Vec<ColumnValues>> {
        self.check_permission(connection, table_name, Operation::Select, "select")?;
        let tid = self.touch(connection, table_name)?;
        self.table(table_name)?.select(tid, predicate)
    }

    /// `commit`: commits every table the transaction touched, then
    /// drops it. Idempotent on a transaction with no staged mutations.
    pub fn commit(&self, connection: &ConnectionId) -> Result<()> {
        let tx = self.transactions.lock().unwrap().remove(connection).ok_or(Error::NoTransaction)?;
        for table_name in &tx.touched_tables {
            if let Some(table) = self.tables.get(table_name) {
                table.commit(tx.id)?;
            }
        }
        Ok(())
    }

    pub fn rollback(&self, connection: &ConnectionId) -> Result<()> {
        let tx = self.transactions.lock().unwrap().remove(connection).ok_or(Error::NoTransaction)?;
        for table_name in &tx.touched_tables {
            if let Some(table) = self.tables.get(table_name) {
                table.rollback(tx.id)?;
            }
        }
        Ok(())
    }

    /// Rolls back and forgets any open transaction and clears
    /// authentication state for a connection that has closed
    /// (`close` pseudo-verb; grounded on `Connection::close()`).
    pub fn forget_connection(&self, connection: &ConnectionId) {
        if let Some(tx) = self.transactions.lock().unwrap().remove(connection) {
            for table_name in &tx.touched_tables {
                if let Some(table) = self.tables.get(table_name) {
                    if let Err(err) = table.rollback(tx.id) {
                        tracing::warn!(%err, table = %table_name, "rollback on connection close failed");
                    }
                }
            }
        }
        self.authenticated.lock().unwrap().remove(connection);
    }

    /// Breaks a deadlock by terminating `connection`'s transaction
    /// across every table it has touched. The engine has no cycle
    /// detector of its own; this is the external caller's lever.
    pub fn force_terminate(&self, connection: &ConnectionId) -> Result<()> {
        let tx_id;
        let touched;
        {
            let transactions = self.transactions.lock().unwrap();
            let tx = transactions.get(connection).ok_or(Error::NoTransaction)?;
            tx_id = tx.id;
            touched = tx.touched_tables.clone();
        }
        for table_name in &touched {
            if let Some(table) = self.tables.get(table_name) {
                table.set_to_terminate(tx_id)?;
            }
        }
        Ok(())
    }
}

impl Registry {
    /// Seeds a row directly through a table's data file, bypassing
    /// permission checks and the wire protocol, and commits it under
    /// `tx_id`. There is no `please:<verb>` for provisioning the very
    /// first `users` row a fresh deployment needs to authenticate
    /// anyone at all, so bootstrap tooling and fixtures both call this
    /// directly against an already-open `Registry`.
    pub fn seed_for_test(&self, table_name: &str, tx_id: i16, values: ColumnValues) {
        let table = self.table(table_name).expect("seed table must exist");
        table.insert(tx_id, values).expect("seed insert must succeed");
        table.commit(tx_id).expect("seed commit must succeed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn users_definition() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("NAME".to_string(), "string:32".to_string());
        m.insert("PASSWORD".to_string(), "password:32".to_string());
        m.insert("COLUMN_ORDER".to_string(), "NAME,PASSWORD".to_string());
        m.insert("SELECT".to_string(), "".to_string());
        m
    }

    fn orders_definition() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("ORDER_NAME".to_string(), "string:32".to_string());
        m.insert("CUSTOMER_NAME".to_string(), "string:64".to_string());
        m.insert("PRODUCT_NAME".to_string(), "string:64".to_string());
        m.insert(
            "COLUMN_ORDER".to_string(),
            "ORDER_NAME,CUSTOMER_NAME,PRODUCT_NAME".to_string(),
        );
        m.insert("INSERT".to_string(), "admin".to_string());
        m.insert("SELECT".to_string(), "admin".to_string());
        m
    }

    fn open_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("users")).unwrap();
        File::create(dir.path().join("order")).unwrap();
        let mut defs = HashMap::new();
        defs.insert("users".to_string(), users_definition());
        defs.insert("order".to_string(), orders_definition());
        let registry = Registry::open(dir.path(), &defs).unwrap();

        // Seed the admin user directly through the data file, bypassing
        // the wire protocol (the registry has no "create user" verb).
        let mut values = ColumnValues::new();
        values.insert("name".to_string(), b"admin".to_vec());
        values.insert("password".to_string(), digest_password("adminpass").to_vec());
        registry.table("users").unwrap().insert(0, values).unwrap();
        registry.table("users").unwrap().commit(0).unwrap();

        (dir, registry)
    }

    #[test]
    fn insert_select_round_trip_matches_s1() {
        let (_dir, registry) = open_registry();
        let conn = ConnectionId::new();
        registry.authenticate(&conn, "admin", "adminpass").unwrap();
        registry.begin_transaction(&conn).unwrap();

        let mut row1 = ColumnValues::new();
        row1.insert("order_name".to_string(), b"order1".to_vec());
        row1.insert("customer_name".to_string(), b"A".to_vec());
        row1.insert("product_name".to_string(), b"P1".to_vec());
        registry.insert(&conn, "order", row1).unwrap();

        let mut row2 = ColumnValues::new();
        row2.insert("order_name".to_string(), b"order2".to_vec());
        row2.insert("customer_name".to_string(), b"B".to_vec());
        row2.insert("product_name".to_string(), b"P2".to_vec());
        registry.insert(&conn, "order", row2).unwrap();

        registry.commit(&conn).unwrap();

        registry.begin_transaction(&conn).unwrap();
        let rows = registry.select(&conn, "order", &ColumnValues::new()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn permission_denied_without_authentication() {
        let (_dir, registry) = open_registry();
        let conn = ConnectionId::new();
        registry.begin_transaction(&conn).unwrap();
        let err = registry.insert(&conn, "order", ColumnValues::new()).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[test]
    fn second_transaction_on_same_connection_errors() {
        let (_dir, registry) = open_registry();
        let conn = ConnectionId::new();
        registry.begin_transaction(&conn).unwrap();
        assert!(matches!(registry.begin_transaction(&conn), Err(Error::TransactionExists)));
    }

    #[test]
    fn commit_without_transaction_errors() {
        let (_dir, registry) = open_registry();
        let conn = ConnectionId::new();
        assert!(matches!(registry.commit(&conn), Err(Error::NoTransaction)));
    }
}
