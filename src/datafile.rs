//! A single table's on-disk file with row-level, transaction-scoped
//! locking.
//!
//! Grounded on `Datafile.h` from original_source: the control-byte +
//! transaction-id row lock, the staged-mutation list, and the
//! commit/rollback writer are all direct ports of that file's
//! `update`/`select`/`commit`/`rollback`/`write` methods, replacing
//! Win32 `HANDLE`/`SetFilePointerEx` calls with `std::fs::File` +
//! `Seek`, and the raw mutex/condvar pair with the same primitives
//! from `std::sync`.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, RwLock};

use crate::column::{Operation, TableDescriptor, CONTROL_DATA_SIZE};
use crate::error::{Error, Result};
use crate::row::Control;

pub type ColumnValues = HashMap<String, Vec<u8>>;

/// A pending insert/update/delete, not yet (or no longer) visible on
/// disk. The original overloads an empty values map to mean delete;
/// this replaces that with an explicit sum type.
#[derive(Debug, Clone)]
enum MutationKind {
    Insert(ColumnValues),
    Update(ColumnValues),
    Delete,
}

#[derive(Debug, Clone)]
struct StagedMutation {
    /// Row's start-of-row file offset; `None` denotes "append as new row".
    position: Option<u64>,
    tx_id: i16,
    kind: MutationKind,
    to_commit: bool,
    finished: bool,
}

#[derive(Default)]
struct FileState {
    staged: Vec<StagedMutation>,
    to_terminate: HashSet<i16>,
}

pub struct DataFile {
    table_name: String,
    descriptor: TableDescriptor,
    path: PathBuf,
    /// Per-transaction file handle, so each transaction drives its own
    /// cursor without disturbing another transaction's scan position.
    handles: Mutex<HashMap<i16, File>>,
    /// Guards the staged-mutation list and the termination list.
    staging: Mutex<FileState>,
    /// Guards the per-row control header and the waiter queue.
    control: Mutex<()>,
    control_cv: Condvar,
    /// Guards the data-column bytes: readers for `select`, writer for
    /// `commit`/`rollback`.
    data: RwLock<()>,
}

impl DataFile {
    /// Opens `<base_dir>/<name>`. The file must already exist; table
    /// files are created out-of-band.
    pub fn open(name: &str, descriptor: TableDescriptor, base_dir: &Path) -> Result<Self> {
        let table_name = name.to_ascii_lowercase();
        let path = base_dir.join(&table_name);
        // Touch the file once up front so a missing table fails fast
        // with a clear not-found error rather than on first query.
        OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            table_name,
            descriptor,
            path,
            handles: Mutex::new(HashMap::new()),
            staging: Mutex::new(FileState::default()),
            control: Mutex::new(()),
            control_cv: Condvar::new(),
            data: RwLock::new(()),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn is_permitted(&self, operation: Operation, user: &str) -> bool {
        self.descriptor.is_permitted(operation, user)
    }

    fn open_handle(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(path)?)
    }

    fn with_handle<R>(&self, tx_id: i16, f: impl FnOnce(&mut File) -> std::io::Result<R>) -> Result<R> {
        let mut handles = self.handles.lock().unwrap();
        if !handles.contains_key(&tx_id) {
            let file = Self::open_handle(&self.path)?;
            handles.insert(tx_id, file);
        }
        let file = handles.get_mut(&tx_id).expect("just inserted");
        Ok(f(file)?)
    }

    fn seek_to_start(&self, tx_id: i16) -> Result<()> {
        self.with_handle(tx_id, |f| f.seek(SeekFrom::Start(0)).map(|_| ()))
    }

    fn row_data_offset(&self, row_start: u64, col_offset: usize) -> Result<u64> {
        row_start
            .checked_add(CONTROL_DATA_SIZE as u64)
            .and_then(|v| v.checked_add(col_offset as u64))
            .ok_or(Error::Overflow)
    }

    fn next_row_offset(&self, row_start: u64) -> Result<u64> {
        row_start
            .checked_add(self.descriptor.row_width() as u64)
            .ok_or(Error::Overflow)
    }

    /// Reads exactly one control header, or `None` on clean EOF. Any
    /// short read (0 or partial) at the row boundary is treated as
    /// end-of-scan.
    fn read_control_or_eof(&self, tx_id: i16) -> Result<Option<Control>> {
        self.with_handle(tx_id, |f| {
            let mut buf = [0u8; CONTROL_DATA_SIZE];
            let mut total = 0;
            while total < buf.len() {
                let n = f.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            if total == CONTROL_DATA_SIZE {
                Ok(Some(Control::decode(&buf)))
            } else {
                Ok(None)
            }
        })
    }

    fn read_column(&self, tx_id: i16, row_start: u64, offset: usize, width: usize) -> Result<Vec<u8>> {
        let pos = self.row_data_offset(row_start, offset)?;
        let mut buf = vec![0u8; width];
        self.with_handle(tx_id, |f| {
            f.seek(SeekFrom::Start(pos))?;
            f.read_exact(&mut buf)
        })?;
        Ok(buf)
    }

    fn where_matches(&self, tx_id: i16, row_start: u64, predicate: &ColumnValues) -> Result<bool> {
        for (col_name, want) in predicate {
            let col = self.descriptor.column(col_name)?;
            let got = self.read_column(tx_id, row_start, col.offset, col.width)?;
            if !self.descriptor.values_equal(col, want, &got)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn normalize_value(&self, col_name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        let col = self.descriptor.column(col_name)?;
        if bytes.len() > col.width {
            return Err(Error::Parse(format!(
                "value for column '{col_name}' exceeds its declared width"
            )));
        }
        let mut v = bytes.to_vec();
        v.resize(col.width, 0);
        Ok(v)
    }

    /// Appends a staged insert, filling any column the caller omitted
    /// with its type's default value.
    pub fn insert(&self, tx_id: i16, values: ColumnValues) -> Result<()> {
        let mut filled = ColumnValues::with_capacity(self.descriptor.columns().len());
        for col in self.descriptor.columns() {
            let bytes = match values.get(&col.name) {
                Some(v) => self.normalize_value(&col.name, v)?,
                None => self.descriptor.default_value(col)?,
            };
            filled.insert(col.name.clone(), bytes);
        }
        let mut state = self.staging.lock().unwrap();
        state.staged.push(StagedMutation {
            position: None,
            tx_id,
            kind: MutationKind::Insert(filled),
            to_commit: false,
            finished: false,
        });
        Ok(())
    }

    /// Shared implementation of `update` and `delete`: an empty
    /// `values` map denotes a delete at commit time.
    fn update_or_delete(&self, tx_id: i16, values: &ColumnValues, predicate: &ColumnValues) -> Result<bool> {
        let normalized: ColumnValues = values
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.normalize_value(k, v)?)))
            .collect::<Result<_>>()?;

        self.seek_to_start(tx_id)?;
        loop {
            let row_start = self.with_handle(tx_id, |f| f.stream_position())?;
            let control_guard = self.control.lock().unwrap();
            let control = match self.read_control_or_eof(tx_id)? {
                None => break,
                Some(c) => c,
            };
            if !control.is_live() {
                drop(control_guard);
                let next = self.next_row_offset(row_start)?;
                self.with_handle(tx_id, |f| f.seek(SeekFrom::Start(next)).map(|_| ()))?;
                continue;
            }

            if !self.where_matches(tx_id, row_start, predicate)? {
                drop(control_guard);
                let next = self.next_row_offset(row_start)?;
                self.with_handle(tx_id, |f| f.seek(SeekFrom::Start(next)).map(|_| ()))?;
                continue;
            }

            let mut guard = control_guard;
            let mut owner = control.tx_id;
            while owner != crate::row::UNLOCKED && owner != tx_id {
                {
                    let mut state = self.staging.lock().unwrap();
                    if state.to_terminate.remove(&tx_id) {
                        tracing::debug!(tx_id, "row wait aborted by forced termination");
                        return Ok(false);
                    }
                }
                guard = self.control_cv.wait(guard).unwrap();
                let mut buf = [0u8; 2];
                self.with_handle(tx_id, |f| {
                    f.seek(SeekFrom::Start(row_start + 2))?;
                    f.read_exact(&mut buf)
                })?;
                owner = i16::from_le_bytes(buf);
            }

            let stamped = Control { flag: crate::row::LIVE, tx_id };
            self.with_handle(tx_id, |f| {
                f.seek(SeekFrom::Start(row_start))?;
                f.write_all(&stamped.encode())
            })?;
            {
                let mut state = self.staging.lock().unwrap();
                let kind = if normalized.is_empty() {
                    MutationKind::Delete
                } else {
                    MutationKind::Update(normalized.clone())
                };
                state.staged.push(StagedMutation {
                    position: Some(row_start),
                    tx_id,
                    kind,
                    to_commit: false,
                    finished: false,
                });
            }
            drop(guard);
            self.control_cv.notify_all();

            let next = self.next_row_offset(row_start)?;
            self.with_handle(tx_id, |f| f.seek(SeekFrom::Start(next)).map(|_| ()))?;
        }
        Ok(true)
    }

    pub fn update(&self, tx_id: i16, values: &ColumnValues, predicate: &ColumnValues) -> Result<bool> {
        self.update_or_delete(tx_id, values, predicate)
    }

    pub fn delete(&self, tx_id: i16, predicate: &ColumnValues) -> Result<bool> {
        self.update_or_delete(tx_id, &ColumnValues::new(), predicate)
    }

    /// Walks every live row, returning those matching `predicate`.
    /// Never stamps or blocks on another transaction's locked rows —
    /// a reader may observe a row mid-transaction but unmodified on
    /// disk. This is intentional, not a bug.
    pub fn select(&self, tx_id: i16, predicate: &ColumnValues) -> Result<Vec<ColumnValues>> {
        self.seek_to_start(tx_id)?;
        let mut out = Vec::new();
        loop {
            let row_start = self.with_handle(tx_id, |f| f.stream_position())?;
            let control = {
                let _guard = self.control.lock().unwrap();
                self.read_control_or_eof(tx_id)?
            };
            let control = match control {
                None => break,
                Some(c) => c,
            };
            if control.is_live() {
                let _read = self.data.read().unwrap();
                if self.where_matches(tx_id, row_start, predicate)? {
                    let mut row = ColumnValues::with_capacity(self.descriptor.columns().len());
                    for col in self.descriptor.columns() {
                        let bytes = self.read_column(tx_id, row_start, col.offset, col.width)?;
                        row.insert(col.name.clone(), bytes);
                    }
                    out.push(row);
                }
            }
            let next = self.next_row_offset(row_start)?;
            self.with_handle(tx_id, |f| f.seek(SeekFrom::Start(next)).map(|_| ()))?;
        }
        Ok(out)
    }

    pub fn commit(&self, tx_id: i16) -> Result<()> {
        let _control = self.control.lock().unwrap();
        let mut state = self.staging.lock().unwrap();
        for m in state.staged.iter_mut().filter(|m| m.tx_id == tx_id) {
            m.to_commit = true;
        }
        let _write = self.data.write().unwrap();
        self.write_and_purge(tx_id, &mut state)?;
        drop(_write);
        drop(state);
        drop(_control);
        self.control_cv.notify_all();
        tracing::debug!(tx_id, table = %self.table_name, "commit");
        Ok(())
    }

    pub fn rollback(&self, tx_id: i16) -> Result<()> {
        let _control = self.control.lock().unwrap();
        let mut state = self.staging.lock().unwrap();
        for m in state.staged.iter_mut().filter(|m| m.tx_id == tx_id) {
            m.to_commit = false;
        }
        let _write = self.data.write().unwrap();
        self.write_and_purge(tx_id, &mut state)?;
        drop(_write);
        drop(state);
        drop(_control);
        self.control_cv.notify_all();
        tracing::debug!(tx_id, table = %self.table_name, "rollback");
        Ok(())
    }

    /// Marks `tx_id` so that any wait loop blocked on one of its rows
    /// observes termination and aborts, then rolls the transaction
    /// back. Equivalent to a rollback at the file level.
    pub fn set_to_terminate(&self, tx_id: i16) -> Result<()> {
        {
            let _control = self.control.lock().unwrap();
            let mut state = self.staging.lock().unwrap();
            state.to_terminate.insert(tx_id);
        }
        self.rollback(tx_id)
    }

    /// Invoked with `control` + `staging` + `data` (write) all held.
    /// For each staged mutation of `tx_id`: writes it to disk if
    /// `to_commit`, otherwise releases the row lock without mutating
    /// data; then purges finished mutations for this transaction.
    fn write_and_purge(&self, tx_id: i16, state: &mut FileState) -> Result<()> {
        for m in state.staged.iter_mut().filter(|m| m.tx_id == tx_id) {
            if m.to_commit {
                match &m.kind {
                    MutationKind::Insert(values) => self.write_insert(tx_id, values)?,
                    MutationKind::Update(values) => {
                        let position = m.position.expect("update mutation always has a position");
                        self.write_update(tx_id, position, values)?;
                    }
                    MutationKind::Delete => {
                        let position = m.position.expect("delete mutation always has a position");
                        self.write_control(tx_id, position, crate::row::TOMBSTONE, crate::row::UNLOCKED)?;
                    }
                }
            } else if let Some(position) = m.position {
                // Release the row lock without mutating data (rollback of
                // an update/delete). Inserts with no disk footprint need
                // no action here.
                self.write_control(tx_id, position, crate::row::LIVE, crate::row::UNLOCKED)?;
            }
            m.finished = true;
        }
        state.staged.retain(|m| !(m.finished && m.tx_id == tx_id));
        Ok(())
    }

    fn write_control(&self, tx_id: i16, position: u64, flag: u8, owner: i16) -> Result<()> {
        let control = Control { flag, tx_id: owner };
        self.with_handle(tx_id, |f| {
            f.seek(SeekFrom::Start(position))?;
            f.write_all(&control.encode())
        })
    }

    fn write_insert(&self, tx_id: i16, values: &ColumnValues) -> Result<()> {
        let row_start = self.with_handle(tx_id, |f| f.seek(SeekFrom::End(0)))?;
        let control = Control::live_unlocked();
        self.with_handle(tx_id, |f| f.write_all(&control.encode()))?;
        for col in self.descriptor.columns() {
            let bytes = values
                .get(&col.name)
                .ok_or_else(|| Error::UnknownColumn(col.name.clone()))?;
            let pos = self.row_data_offset(row_start, col.offset)?;
            self.with_handle(tx_id, |f| {
                f.seek(SeekFrom::Start(pos))?;
                f.write_all(bytes)
            })?;
        }
        Ok(())
    }

    fn write_update(&self, tx_id: i16, position: u64, values: &ColumnValues) -> Result<()> {
        for (name, bytes) in values {
            let col = self.descriptor.column(name)?;
            let pos = self.row_data_offset(position, col.offset)?;
            self.with_handle(tx_id, |f| {
                f.seek(SeekFrom::Start(pos))?;
                f.write_all(bytes)
            })?;
        }
        self.write_control(tx_id, position, crate::row::LIVE, crate::row::UNLOCKED)
    }
}
