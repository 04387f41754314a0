//! End-to-end scenarios driven entirely through the public
//! `Connection`/`Dispatcher` surface rather than internal module
//! tests.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use slotdb::column::ColumnType;
use slotdb::dispatcher::Dispatcher;
use slotdb::driver::Connection;
use slotdb::ids::digest_password;
use slotdb::registry::Registry;
use tempfile::TempDir;

fn users_definition() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("NAME".to_string(), "string:32".to_string());
    m.insert("PASSWORD".to_string(), "password:32".to_string());
    m.insert("COLUMN_ORDER".to_string(), "NAME,PASSWORD".to_string());
    m.insert("SELECT".to_string(), "".to_string());
    m
}

fn order_definition() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("ORDER_NAME".to_string(), "string:32".to_string());
    m.insert("CUSTOMER_NAME".to_string(), "string:64".to_string());
    m.insert("PRODUCT_NAME".to_string(), "string:64".to_string());
    m.insert("COLUMN_ORDER".to_string(), "ORDER_NAME,CUSTOMER_NAME,PRODUCT_NAME".to_string());
    m.insert("INSERT".to_string(), "admin".to_string());
    m.insert("UPDATE".to_string(), "admin".to_string());
    m.insert("DELETE".to_string(), "admin".to_string());
    m.insert("SELECT".to_string(), "admin".to_string());
    m
}

fn order_column_type(name: &str) -> Option<ColumnType> {
    match name {
        "order_name" | "customer_name" | "product_name" => Some(ColumnType::String),
        _ => None,
    }
}

/// Builds a registry + started dispatcher with `users` and `order`
/// tables, seeding the `admin`/`adminpass` user row directly.
fn build(session_slots: usize) -> (TempDir, Arc<Dispatcher>) {
    let dir = TempDir::new().unwrap();
    File::create(dir.path().join("users")).unwrap();
    File::create(dir.path().join("order")).unwrap();

    let mut defs = HashMap::new();
    defs.insert("users".to_string(), users_definition());
    defs.insert("order".to_string(), order_definition());
    let registry = Arc::new(Registry::open(dir.path(), &defs).unwrap());

    let mut seed = HashMap::new();
    seed.insert("name".to_string(), b"admin".to_vec());
    seed.insert("password".to_string(), digest_password("adminpass").to_vec());
    registry.seed_for_test("users", 0, seed);

    let dispatcher = Dispatcher::new(registry, session_slots);
    dispatcher.start();
    (dir, dispatcher)
}

/// S1: insert two rows, commit, then select both back in a fresh
/// transaction on the same connection, sorted by `order_name`.
#[test]
fn s1_insert_then_select() {
    let (_dir, dispatcher) = build(4);
    let conn = Connection::open(dispatcher.clone()).unwrap();
    conn.authenticate("admin", "adminpass").unwrap();

    conn.begin_transaction().unwrap();
    conn.insert("order", &[("ORDER_NAME", b"order1"), ("CUSTOMER_NAME", b"A"), ("PRODUCT_NAME", b"P1")]).unwrap();
    conn.insert("order", &[("ORDER_NAME", b"order2"), ("CUSTOMER_NAME", b"B"), ("PRODUCT_NAME", b"P2")]).unwrap();
    conn.commit().unwrap();

    conn.begin_transaction().unwrap();
    let mut rows = conn.select("order", &[], order_column_type).unwrap();
    assert_eq!(rows.len(), 2);
    rows.sort_by(|a, b| a["order_name"].cmp(&b["order_name"]));
    assert_eq!(&rows[0]["order_name"][..6], b"order1");
    assert_eq!(&rows[0]["customer_name"][..1], b"A");
    assert_eq!(&rows[1]["order_name"][..6], b"order2");
    assert_eq!(&rows[1]["customer_name"][..1], b"B");

    dispatcher.stop();
}

/// S2: two connections race to update the same row; the second
/// transaction blocks until the first commits, then wins the row, and
/// its value is the one left on disk.
#[test]
fn s2_update_under_conflict_second_writer_wins() {
    let (_dir, dispatcher) = build(4);

    let conn1 = Connection::open(dispatcher.clone()).unwrap();
    conn1.authenticate("admin", "adminpass").unwrap();
    conn1.begin_transaction().unwrap();
    conn1.insert("order", &[("ORDER_NAME", b"order1"), ("CUSTOMER_NAME", b"alice"), ("PRODUCT_NAME", b"P1")]).unwrap();
    conn1.commit().unwrap();

    conn1.begin_transaction().unwrap();
    conn1
        .update("order", &[("CUSTOMER_NAME", b"t1-write")], &[("ORDER_NAME", b"order1")])
        .unwrap();

    let dispatcher2 = dispatcher.clone();
    let handle = std::thread::spawn(move || {
        let conn2 = Connection::open(dispatcher2).unwrap();
        conn2.authenticate("admin", "adminpass").unwrap();
        conn2.begin_transaction().unwrap();
        conn2.update("order", &[("CUSTOMER_NAME", b"t2-write")], &[("ORDER_NAME", b"order1")]).unwrap();
        conn2.commit().unwrap();
    });

    std::thread::sleep(Duration::from_millis(100));
    conn1.commit().unwrap();
    handle.join().unwrap();

    conn1.begin_transaction().unwrap();
    let rows = conn1.select("order", &[("ORDER_NAME", b"order1")], order_column_type).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0]["customer_name"][..8], b"t2-write");

    dispatcher.stop();
}

/// S4: insert + commit, then delete + commit tombstones the row so a
/// subsequent select returns nothing.
#[test]
fn s4_delete_tombstones_row() {
    let (_dir, dispatcher) = build(4);
    let conn = Connection::open(dispatcher.clone()).unwrap();
    conn.authenticate("admin", "adminpass").unwrap();

    conn.begin_transaction().unwrap();
    conn.insert("order", &[("ORDER_NAME", b"order1"), ("CUSTOMER_NAME", b"A"), ("PRODUCT_NAME", b"P1")]).unwrap();
    conn.commit().unwrap();

    conn.begin_transaction().unwrap();
    conn.delete("order", &[("ORDER_NAME", b"order1")]).unwrap();
    conn.commit().unwrap();

    conn.begin_transaction().unwrap();
    let rows = conn.select("order", &[], order_column_type).unwrap();
    assert!(rows.is_empty());

    dispatcher.stop();
}

/// S5: insert then rollback leaves no row visible.
#[test]
fn s5_rollback_is_invisible() {
    let (_dir, dispatcher) = build(4);
    let conn = Connection::open(dispatcher.clone()).unwrap();
    conn.authenticate("admin", "adminpass").unwrap();

    conn.begin_transaction().unwrap();
    conn.insert("order", &[("ORDER_NAME", b"order1"), ("CUSTOMER_NAME", b"A"), ("PRODUCT_NAME", b"P1")]).unwrap();
    conn.rollback().unwrap();

    conn.begin_transaction().unwrap();
    let rows = conn.select("order", &[], order_column_type).unwrap();
    assert!(rows.is_empty());

    dispatcher.stop();
}

/// B4: starting a second transaction on the same connection without
/// committing or rolling back the first is rejected.
#[test]
fn b4_transaction_twice_is_rejected() {
    let (_dir, dispatcher) = build(4);
    let conn = Connection::open(dispatcher.clone()).unwrap();
    conn.begin_transaction().unwrap();
    let err = conn.begin_transaction().unwrap_err();
    assert!(err.to_string().contains("already exists"));
    dispatcher.stop();
}

/// B1: every slot occupied fails fast with `NoFreeSlot` rather than
/// blocking indefinitely.
#[test]
fn b1_slot_exhaustion_fails_fast() {
    let (_dir, dispatcher) = build(1);
    let _conn = Connection::open(dispatcher.clone()).unwrap();
    let err = Connection::open(dispatcher.clone()).unwrap_err();
    assert!(err.to_string().to_ascii_lowercase().contains("no free"));
    dispatcher.stop();
}

/// B2: two threads racing `getConnection` — exactly one succeeds, the
/// other observes a concurrent allocation already pending.
#[test]
fn b2_concurrent_get_connection_one_wins() {
    let (_dir, dispatcher) = build(4);
    let d1 = dispatcher.clone();
    let handle = std::thread::spawn(move || Connection::open(d1));
    std::thread::sleep(Duration::from_millis(50));
    let second = Connection::open(dispatcher.clone());
    assert!(second.is_err());
    assert!(handle.join().unwrap().is_ok());
    dispatcher.stop();
}
