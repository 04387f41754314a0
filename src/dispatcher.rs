//! Fixed-slot session dispatcher (the "database" of the original).
//!
//! Grounded on `Database.h`'s `Database`/`Connection` classes:
//! `getConnection`/`startChildThread`/`startService` map onto
//! [`Dispatcher::get_connection`], [`Dispatcher::spawn_worker`] and
//! [`Dispatcher::service_loop`] respectively, keeping the same
//! mutex/condvar/shared-lock split the original uses (a plain mutex for
//! the connection list and buffers, a `RwLock` for slot ownership, one
//! mutex/condvar pair per slot for the pending-request flag). Worker
//! thread bookkeeping is ported from `ThreadsMap.h`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ids::ConnectionId;
use crate::parser;
use crate::registry::Registry;

/// N=50 fixed session slots.
pub const DEFAULT_SESSION_SLOTS: usize = 50;

/// How many finished worker threads may accumulate before `cleanUp()`
/// joins and drops them (`ThreadsMap.h`'s `cleanUpPoint_`).
const CLEANUP_POINT: usize = 10;

struct WorkerRegistry {
    cleanup_point: usize,
    threads: HashMap<std::thread::ThreadId, JoinHandle<()>>,
    finished: HashMap<std::thread::ThreadId, bool>,
}

impl WorkerRegistry {
    fn new(cleanup_point: usize) -> Self {
        Self { cleanup_point, threads: HashMap::new(), finished: HashMap::new() }
    }

    fn add(&mut self, handle: JoinHandle<()>) {
        let id = handle.thread().id();
        self.threads.insert(id, handle);
        self.finished.entry(id).or_insert(false);
    }

    fn mark_finished(&mut self, id: std::thread::ThreadId) {
        self.finished.insert(id, true);
    }

    fn clean_up(&mut self) {
        if self.threads.len() <= self.cleanup_point {
            return;
        }
        let done: Vec<_> = self.finished.iter().filter(|(_, &f)| f).map(|(&id, _)| id).collect();
        for id in done {
            if let Some(handle) = self.threads.remove(&id) {
                let _ = handle.join();
            }
            self.finished.remove(&id);
        }
    }

    fn join_all(&mut self) {
        for (_, handle) in self.threads.drain() {
            let _ = handle.join();
        }
    }
}

struct PendingConnectionRequest {
    requested: bool,
    result: Option<Result<ConnectionId>>,
}

enum Outcome {
    Reply(Vec<u8>),
    Close(Vec<u8>),
}

/// One of the `N` fixed worker contexts: its own mutex/condvar guard
/// `requestPending`, matching a session slot.
struct SlotState {
    pending: Mutex<bool>,
    condvar: Condvar,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    /// Which connection (if any, `""` if free) owns each slot. Guarded
    /// by a shared lock: read for lookup, write for assignment.
    slot_owners: RwLock<Vec<ConnectionId>>,
    slots: Vec<SlotState>,
    buffers: Mutex<HashMap<ConnectionId, Vec<u8>>>,
    connections: Mutex<Vec<ConnectionId>>,
    connection_request: Mutex<PendingConnectionRequest>,
    connection_request_cv: Condvar,
    started: AtomicBool,
    stopping: AtomicBool,
    /// The dispatcher's service thread handle (spec.md §4.1's "service
    /// thread handle" state), joined by `stop()`.
    service_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<WorkerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, session_slots: usize) -> Arc<Self> {
        let slots = (0..session_slots).map(|_| SlotState { pending: Mutex::new(false), condvar: Condvar::new() }).collect();
        Arc::new(Self {
            registry,
            slot_owners: RwLock::new(vec![ConnectionId::empty(); session_slots]),
            slots,
            buffers: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            connection_request: Mutex::new(PendingConnectionRequest { requested: false, result: None }),
            connection_request_cv: Condvar::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            service_thread: Mutex::new(None),
            workers: Mutex::new(WorkerRegistry::new(CLEANUP_POINT)),
        })
    }

    /// Idempotent: launches the service thread once.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let dispatcher = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("slotdb-service".to_string())
            .spawn(move || dispatcher.service_loop())
            .expect("failed to spawn the dispatcher service thread");
        *self.service_thread.lock().unwrap() = Some(handle);
    }

    /// Signals global stop, wakes every worker and the service thread,
    /// then joins them before returning. Joining the service thread
    /// first ensures it has fully exited `service_loop` — and is no
    /// longer mutating `slot_owners`/`connections` or spawning new
    /// workers — before worker threads are joined.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            *slot.pending.lock().unwrap() = true;
            slot.condvar.notify_all();
        }
        self.connection_request_cv.notify_all();
        if let Some(handle) = self.service_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.workers.lock().unwrap().join_all();
    }

    /// Requests a new connection. Fails with `ConcurrencyViolation` if
    /// another allocation is already pending, or with `NoFreeSlot` if
    /// every slot is occupied.
    pub fn get_connection(self: &Arc<Self>) -> Result<ConnectionId> {
        let guard = self.connection_request.lock().unwrap();
        let mut guard = guard;
        if guard.requested {
            return Err(Error::ConcurrencyViolation);
        }
        guard.requested = true;
        guard.result = None;
        let mut guard = self.connection_request_cv.wait_while(guard, |g| g.requested).unwrap();
        guard.result.take().unwrap_or(Err(Error::NoFreeSlot))
    }

    pub fn send(&self, connection_id: &ConnectionId, data: Vec<u8>) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let slot = buffers.get_mut(connection_id).ok_or_else(|| Error::Parse("unknown connection".to_string()))?;
        *slot = data;
        Ok(())
    }

    pub fn receive(&self, connection_id: &ConnectionId) -> Result<Vec<u8>> {
        let mut buffers = self.buffers.lock().unwrap();
        let slot = buffers.get_mut(connection_id).ok_or_else(|| Error::Parse("unknown connection".to_string()))?;
        Ok(std::mem::take(slot))
    }

    /// Sets the owning slot's `requestPending` flag and wakes it.
    /// Returns `false` if no slot currently owns `connection_id`.
    pub fn notify(&self, connection_id: &ConnectionId, pending: bool) -> bool {
        match self.slot_index_for(connection_id) {
            Some(idx) => {
                *self.slots[idx].pending.lock().unwrap() = pending;
                self.slots[idx].condvar.notify_one();
                true
            }
            None => false,
        }
    }

    /// Blocks until the owning slot's `requestPending` drops to
    /// `false`. Returns `-1` if no slot owns `connection_id`.
    pub fn wait(&self, connection_id: &ConnectionId) -> i32 {
        let idx = match self.slot_index_for(connection_id) {
            Some(idx) => idx,
            None => return -1,
        };
        let guard = self.slots[idx].pending.lock().unwrap();
        let _ = self.slots[idx].condvar.wait_while(guard, |pending| *pending).unwrap();
        0
    }

    pub fn is_closed(&self, connection_id: &ConnectionId) -> bool {
        !self.connections.lock().unwrap().iter().any(|c| c == connection_id)
    }

    fn slot_index_for(&self, connection_id: &ConnectionId) -> Option<usize> {
        self.slot_owners.read().unwrap().iter().position(|owner| owner == connection_id)
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slot_owners.read().unwrap().iter().position(|owner| owner.is_empty())
    }

    fn service_loop(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));

            let should_handle = self.connection_request.lock().unwrap().requested;
            if !should_handle {
                continue;
            }

            let outcome = self.create_and_assign();
            {
                let mut guard = self.connection_request.lock().unwrap();
                guard.result = Some(outcome);
                guard.requested = false;
            }
            self.connection_request_cv.notify_all();
            self.workers.lock().unwrap().clean_up();
        }
    }

    fn create_and_assign(self: &Arc<Self>) -> Result<ConnectionId> {
        let slot_index = self.find_free_slot().ok_or(Error::NoFreeSlot)?;
        let connection_id = ConnectionId::new();
        self.connections.lock().unwrap().push(connection_id.clone());
        self.buffers.lock().unwrap().insert(connection_id.clone(), Vec::new());
        self.slot_owners.write().unwrap()[slot_index] = connection_id.clone();
        self.spawn_worker(slot_index, connection_id.clone());
        Ok(connection_id)
    }

    fn spawn_worker(self: &Arc<Self>, slot_index: usize, connection_id: ConnectionId) {
        let dispatcher = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("slotdb-worker-{slot_index}"))
            .spawn(move || dispatcher.worker_loop(slot_index, connection_id))
            .expect("failed to spawn a worker thread");
        self.workers.lock().unwrap().add(handle);
    }

    fn worker_loop(self: Arc<Self>, slot_index: usize, connection_id: ConnectionId) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            {
                let guard = self.slots[slot_index].pending.lock().unwrap();
                let guard = self.slots[slot_index].condvar.wait_while(guard, |pending| !*pending).unwrap();
                drop(guard);
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let request = self.buffers.lock().unwrap().get_mut(&connection_id).map(std::mem::take).unwrap_or_default();
            let outcome = self.handle_request(&connection_id, &request);

            let close = matches!(outcome, Outcome::Close(_));
            let response = match outcome {
                Outcome::Reply(bytes) | Outcome::Close(bytes) => bytes,
            };
            if let Some(buf) = self.buffers.lock().unwrap().get_mut(&connection_id) {
                *buf = response;
            }
            *self.slots[slot_index].pending.lock().unwrap() = false;
            self.slots[slot_index].condvar.notify_all();

            if close {
                self.connections.lock().unwrap().retain(|c| c != &connection_id);
                self.buffers.lock().unwrap().remove(&connection_id);
                self.slot_owners.write().unwrap()[slot_index] = ConnectionId::empty();
                break;
            }
        }
        self.workers.lock().unwrap().mark_finished(std::thread::current().id());
    }

    /// Never panics the worker: catches every error and renders it as
    /// response bytes.
    fn handle_request(&self, connection_id: &ConnectionId, raw: &[u8]) -> Outcome {
        match self.dispatch(connection_id, raw) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(connection = %connection_id, %err, "request failed");
                Outcome::Reply(err.to_string().into_bytes())
            }
        }
    }

    fn dispatch(&self, connection_id: &ConnectionId, raw: &[u8]) -> Result<Outcome> {
        let (request, rest) = parser::split_request(raw)?;
        let has_transaction = self.registry.has_transaction(connection_id);

        if request.verb == "transaction" && has_transaction {
            return Err(Error::TransactionExists);
        }
        let requires_transaction = !matches!(request.verb.as_str(), "transaction" | "user" | "close");
        if requires_transaction && !has_transaction {
            return Err(Error::NoTransaction);
        }

        match request.verb.as_str() {
            "close" => {
                self.registry.forget_connection(connection_id);
                Ok(Outcome::Close(b"closed.".to_vec()))
            }
            "user" => {
                self.registry.authenticate(connection_id, &request.args[0], &request.args[1])?;
                Ok(Outcome::Reply(b"user accepted.".to_vec()))
            }
            "transaction" => {
                self.registry.begin_transaction(connection_id)?;
                Ok(Outcome::Reply(b"transaction start is succeed.".to_vec()))
            }
            "commit" => {
                self.registry.commit(connection_id)?;
                Ok(Outcome::Reply(b"commit succeeded.".to_vec()))
            }
            "rollback" => {
                self.registry.rollback(connection_id)?;
                Ok(Outcome::Reply(b"rollback succeeded.".to_vec()))
            }
            "insert" => {
                let table = request.table.as_deref().expect("insert always carries a table name");
                let descriptor = self.registry.descriptor(table)?;
                let open = parser::find_group_open(rest, None)?;
                let (values, _) = parser::parse_group(rest, open, |c| descriptor.column(c).ok().map(|col| col.ty))?;
                self.registry.insert(connection_id, table, values)?;
                Ok(Outcome::Reply(b"insert succeeded.".to_vec()))
            }
            "update" => {
                let table = request.table.as_deref().expect("update always carries a table name");
                let descriptor = self.registry.descriptor(table)?;
                let type_lookup = |c: &str| descriptor.column(c).ok().map(|col| col.ty);
                let open = parser::find_group_open(rest, Some("set"))?;
                let (values, consumed) = parser::parse_group(rest, open, type_lookup)?;
                let rest = &rest[consumed..];
                let open = parser::find_group_open(rest, Some("where"))?;
                let (predicate, _) = parser::parse_group(rest, open, type_lookup)?;
                let aborted = !self.registry.update(connection_id, table, &values, &predicate)?;
                if aborted {
                    Err(Error::RowConflictAborted)
                } else {
                    Ok(Outcome::Reply(b"update succeeded.".to_vec()))
                }
            }
            "delete" => {
                let table = request.table.as_deref().expect("delete always carries a table name");
                let descriptor = self.registry.descriptor(table)?;
                let type_lookup = |c: &str| descriptor.column(c).ok().map(|col| col.ty);
                let open = parser::find_group_open(rest, Some("where"))?;
                let (predicate, _) = parser::parse_group(rest, open, type_lookup)?;
                let aborted = !self.registry.delete(connection_id, table, &predicate)?;
                if aborted {
                    Err(Error::RowConflictAborted)
                } else {
                    Ok(Outcome::Reply(b"delete succeeded.".to_vec()))
                }
            }
            "select" => {
                let table = request.table.as_deref().expect("select always carries a table name");
                let descriptor = self.registry.descriptor(table)?;
                let type_lookup = |c: &str| descriptor.column(c).ok().map(|col| col.ty);
                let predicate = if rest.iter().any(|b| !b.is_ascii_whitespace()) {
                    let open = parser::find_group_open(rest, Some("where"))?;
                    parser::parse_group(rest, open, type_lookup)?.0
                } else {
                    crate::datafile::ColumnValues::new()
                };
                let rows = self.registry.select(connection_id, table, &predicate)?;
                let columns = descriptor.columns();
                let mut body = Vec::new();
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        body.push(b'\n');
                    }
                    body.extend(parser::encode_row(row, columns));
                }
                Ok(Outcome::Reply(body))
            }
            other => Err(Error::Parse(format!("parse error. unhandled verb '{other}'."))),
        }
    }
}
