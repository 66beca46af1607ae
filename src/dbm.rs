use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;

use crossbeam_utils::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::engines::{
    AnyEngine, EngineKind, HashEngine, Processor, RecordAction, RestoreReport, SkipEngine,
    TreeEngine,
};
use crate::file::{File, FileOpenFlags};
use crate::flat_records::{FlatRecordReader, FlatRecordWriter};
use crate::iterator::DbmIterator;
use crate::options::{OpenOptions, SyncOptions};
use crate::util::{be_bytes_to_int, int_to_be_bytes, secondary_hash, wall_time};
use crate::{Result, Status, StatusCode};

const NUM_KEY_LOCKS: usize = 4096;
const LINES_BUFFER_SIZE: usize = 64 * 1024;

/// Condition on, or replacement for, a record in the compare-and-exchange family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    /// The record does not exist. As a desired state, the record is removed.
    Absent,
    /// The record exists with any value. As a desired state, the value is kept.
    Any,
    /// The record exists with exactly this value. As a desired state, it is stored.
    Value(Vec<u8>),
}

impl RecordState {
    fn matches(&self, current: Option<&[u8]>) -> bool {
        match (self, current) {
            (RecordState::Absent, None) => true,
            (RecordState::Any, Some(_)) => true,
            (RecordState::Value(expected), Some(current)) => expected.as_slice() == current,
            _ => false,
        }
    }

    fn action(&self) -> RecordAction {
        match self {
            RecordState::Absent => RecordAction::Remove,
            RecordState::Any => RecordAction::Noop,
            RecordState::Value(value) => RecordAction::Set(value.clone()),
        }
    }
}

impl From<Vec<u8>> for RecordState {
    fn from(value: Vec<u8>) -> Self {
        RecordState::Value(value)
    }
}

impl From<&[u8]> for RecordState {
    fn from(value: &[u8]) -> Self {
        RecordState::Value(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for RecordState {
    fn from(value: &[u8; N]) -> Self {
        RecordState::Value(value.to_vec())
    }
}

impl From<&str> for RecordState {
    fn from(value: &str) -> Self {
        RecordState::Value(value.as_bytes().to_vec())
    }
}

impl From<Option<&[u8]>> for RecordState {
    fn from(value: Option<&[u8]>) -> Self {
        value.map_or(RecordState::Absent, RecordState::from)
    }
}

/// Path of shard `index` in a set of `count` shards based at `path`.
pub(crate) fn shard_path(path: &Path, index: u32, count: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("-{:05}-of-{:05}", index, count));
    PathBuf::from(name)
}

/// Number of shards of an existing set based at `path`, 0 if there is none.
fn discover_shards(path: &Path) -> Result<u32> {
    let Some(base) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(0);
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let prefix = format!("{}-00000-of-", base);
    for entry in entries {
        let name = entry?.file_name();
        let Some(count) = name.to_str().and_then(|name| name.strip_prefix(&prefix)) else {
            continue;
        };
        if let Ok(count) = count.parse::<u32>() {
            if count > 0 {
                return Ok(count);
            }
        }
    }
    Ok(0)
}

fn shard_paths(path: &Path, num_shards: Option<u32>) -> Result<Vec<PathBuf>> {
    let volatile = path.as_os_str().is_empty();
    let count = match num_shards {
        None => return Ok(vec![path.to_path_buf()]),
        Some(0) if volatile => 1,
        Some(0) => match discover_shards(path)? {
            0 => 1,
            found => {
                info!("found {} shards of {}", found, path.display());
                found
            }
        },
        Some(count) => count,
    };
    if volatile {
        return Ok(vec![PathBuf::new(); count as usize]);
    }
    Ok((0..count).map(|index| shard_path(path, index, count)).collect())
}

/// Record access while the lock stripes of a set of keys are held.
struct Locked<'a> {
    dbm: &'a Dbm,
    _gate: ShardedLockReadGuard<'a, ()>,
    _stripes: Vec<MutexGuard<'a, ()>>,
}

impl Locked<'_> {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.dbm.shard_of(key).as_engine().process(key, proc, writable)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.process(
            key,
            &mut |_, value| {
                found = value.map(<[u8]>::to_vec);
                RecordAction::Noop
            },
            false,
        )?;
        Ok(found)
    }

    fn apply(&self, key: &[u8], action: RecordAction) -> Result<()> {
        if action == RecordAction::Noop {
            return Ok(());
        }
        let mut action = Some(action);
        self.process(
            key,
            &mut |_, _| action.take().unwrap_or(RecordAction::Noop),
            true,
        )
    }
}

/// Handle to a key-value database.
///
/// A handle is created empty and bound to a storage engine by [`Dbm::open`]. The engine is
/// chosen by the `dbm` option or else by the file extension. With `num_shards` set, the
/// handle spreads keys over that many engines, each with its own file named
/// `<path>-NNNNN-of-MMMMM`.
///
/// Record operations take `&self` and can run from many threads at once. Operations that
/// touch several records lock them together, so they are atomic with respect to each other.
pub struct Dbm {
    shards: Vec<AnyEngine>,
    kind: Option<EngineKind>,
    path: PathBuf,
    sharded: bool,
    gate: ShardedLock<()>,
    key_locks: Vec<Mutex<()>>,
}

impl Default for Dbm {
    fn default() -> Self {
        Dbm::new()
    }
}

impl Dbm {
    /// Creates a handle that is not bound to any database yet.
    pub fn new() -> Dbm {
        Dbm {
            shards: Vec::new(),
            kind: None,
            path: PathBuf::new(),
            sharded: false,
            gate: ShardedLock::new(()),
            key_locks: (0..NUM_KEY_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Opens the database at `path`. An empty path opens a volatile in-memory database.
    pub fn open(
        &mut self,
        path: impl AsRef<Path>,
        writable: bool,
        options: &OpenOptions,
    ) -> Result<()> {
        if self.is_open() {
            return Err(Status::precondition("opened database"));
        }
        let path = path.as_ref();
        let kind = options.dbm.unwrap_or_else(|| EngineKind::from_path(path));
        let mut shards = Vec::new();
        for shard in shard_paths(path, options.num_shards)? {
            match AnyEngine::open(kind, &shard, writable, options) {
                Ok(engine) => shards.push(engine),
                Err(err) => {
                    for engine in &shards {
                        let _ = engine.as_engine().close();
                    }
                    return Err(err);
                }
            }
        }
        debug!(
            "opened {} at {:?} with {} shards",
            kind.class_name(),
            path,
            shards.len()
        );
        self.shards = shards;
        self.kind = Some(kind);
        self.path = path.to_path_buf();
        self.sharded = options.num_shards.is_some();
        Ok(())
    }

    /// Closes the database. Every shard is closed even if one of them fails.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(Status::precondition("not opened database"));
        }
        let mut status = Status::success();
        for engine in self.shards.drain(..) {
            status.join_result(engine.as_engine().close());
        }
        self.kind = None;
        status.into_result()
    }

    fn check_open(&self) -> Result<()> {
        if self.shards.is_empty() {
            Err(Status::precondition("not opened database"))
        } else {
            Ok(())
        }
    }

    fn shared(&self) -> Result<ShardedLockReadGuard<'_, ()>> {
        self.check_open()?;
        Ok(self.gate.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn exclusive(&self) -> Result<ShardedLockWriteGuard<'_, ()>> {
        self.check_open()?;
        Ok(self.gate.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn shard_index(&self, key: &[u8]) -> usize {
        if self.shards.len() <= 1 {
            0
        } else {
            secondary_hash(key, self.shards.len() as u64) as usize
        }
    }

    fn shard_of(&self, key: &[u8]) -> &AnyEngine {
        &self.shards[self.shard_index(key)]
    }

    /// Runs `f` over the shards while global operations are held off.
    pub(crate) fn with_shards<T>(&self, f: impl FnOnce(&[AnyEngine]) -> Result<T>) -> Result<T> {
        let _gate = self.shared()?;
        f(&self.shards)
    }

    /// Locks the stripes of `keys` in ascending stripe order.
    fn lock<'k>(&self, keys: impl IntoIterator<Item = &'k [u8]>) -> Result<Locked<'_>> {
        let gate = self.shared()?;
        let mut stripes: Vec<usize> = keys
            .into_iter()
            .map(|key| secondary_hash(key, NUM_KEY_LOCKS as u64) as usize)
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        let stripes = stripes
            .into_iter()
            .map(|stripe| self.key_locks[stripe].lock())
            .collect();
        Ok(Locked {
            dbm: self,
            _gate: gate,
            _stripes: stripes,
        })
    }

    fn for_each_shard(&self, mut f: impl FnMut(&AnyEngine) -> Result<()>) -> Result<()> {
        let mut status = Status::success();
        for engine in &self.shards {
            status.join_result(f(engine));
        }
        status.into_result()
    }

    /// Shows the record of `key` to `proc` and applies its answer.
    ///
    /// `proc` runs with the record locked and must not call back into this database.
    pub fn process<F>(&self, key: impl AsRef<[u8]>, mut proc: F, writable: bool) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> RecordAction,
    {
        let key = key.as_ref();
        self.lock([key])?.process(key, &mut proc, writable)
    }

    /// Shows the records of `keys` to `proc` in the given order, all locked together.
    pub fn process_multi<K, F>(&self, keys: &[K], mut proc: F, writable: bool) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnMut(&[u8], Option<&[u8]>) -> RecordAction,
    {
        let locked = self.lock(keys.iter().map(AsRef::as_ref))?;
        for key in keys {
            locked.process(key.as_ref(), &mut proc, writable)?;
        }
        Ok(())
    }

    /// Shows every record to `proc`. A writable pass excludes all other operations.
    pub fn process_each<F>(&self, mut proc: F, writable: bool) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> RecordAction,
    {
        if writable {
            let _gate = self.exclusive()?;
            self.for_each_shard(|engine| engine.as_engine().process_each(&mut proc, true))
        } else {
            let _gate = self.shared()?;
            self.for_each_shard(|engine| engine.as_engine().process_each(&mut proc, false))
        }
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _gate = self.shared()?;
        let mut found = None;
        self.shard_of(key).as_engine().process(
            key,
            &mut |_, value| {
                found = value.map(<[u8]>::to_vec);
                RecordAction::Noop
            },
            false,
        )?;
        Ok(found)
    }

    /// Gets the value of a record; NOT_FOUND_ERROR if it does not exist.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.read(key.as_ref())?
            .ok_or_else(|| Status::not_found("no such record"))
    }

    /// Gets the records that exist among `keys`, in the order of `keys`.
    pub fn get_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let locked = self.lock(keys.iter().map(AsRef::as_ref))?;
        let mut records = Vec::new();
        for key in keys {
            let key = key.as_ref();
            if let Some(value) = locked.get(key)? {
                records.push((key.to_vec(), value));
            }
        }
        Ok(records)
    }

    /// Stores a record. Without `overwrite`, an existing record is kept and DUPLICATION_ERROR
    /// is returned.
    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        overwrite: bool,
    ) -> Result<()> {
        self.set_and_get(key, value, overwrite).map(|_| ())
    }

    /// Like [`Dbm::set`], returning the value the record had before.
    pub fn set_and_get(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        overwrite: bool,
    ) -> Result<Option<Vec<u8>>> {
        let value = value.as_ref();
        let mut old = None;
        self.process(
            key,
            |_, current| {
                old = current.map(<[u8]>::to_vec);
                if current.is_some() && !overwrite {
                    RecordAction::Noop
                } else {
                    RecordAction::Set(value.to_vec())
                }
            },
            true,
        )?;
        if old.is_some() && !overwrite {
            return Err(Status::duplication("record exists"));
        }
        Ok(old)
    }

    /// Stores several records atomically. Without `overwrite`, existing records are kept and
    /// DUPLICATION_ERROR is returned after the others are stored.
    pub fn set_multi<K, V>(&self, records: &[(K, V)], overwrite: bool) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let locked = self.lock(records.iter().map(|(key, _)| key.as_ref()))?;
        let mut duplicated = false;
        for (key, value) in records {
            locked.process(
                key.as_ref(),
                &mut |_, current| {
                    if current.is_some() && !overwrite {
                        duplicated = true;
                        RecordAction::Noop
                    } else {
                        RecordAction::Set(value.as_ref().to_vec())
                    }
                },
                true,
            )?;
        }
        if duplicated {
            return Err(Status::duplication("record exists"));
        }
        Ok(())
    }

    /// Removes a record; NOT_FOUND_ERROR if it does not exist.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.remove_and_get(key).map(|_| ())
    }

    /// Removes a record and returns its value.
    pub fn remove_and_get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let mut old = None;
        self.process(
            key,
            |_, current| {
                old = current.map(<[u8]>::to_vec);
                RecordAction::Remove
            },
            true,
        )?;
        old.ok_or_else(|| Status::not_found("no such record"))
    }

    /// Removes the existing records among `keys`; NOT_FOUND_ERROR if any was missing.
    pub fn remove_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<()> {
        let mut missing = false;
        self.process_multi(
            keys,
            |_, current| {
                missing |= current.is_none();
                RecordAction::Remove
            },
            true,
        )?;
        if missing {
            return Err(Status::not_found("no such record"));
        }
        Ok(())
    }

    /// Appends `value` to a record, joined by `delim`. A missing record gets `value` alone.
    pub fn append(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        delim: impl AsRef<[u8]>,
    ) -> Result<()> {
        let (value, delim) = (value.as_ref(), delim.as_ref());
        self.process(key, |_, current| RecordAction::Set(joined(current, value, delim)), true)
    }

    /// Appends to several records atomically.
    pub fn append_multi<K, V>(&self, records: &[(K, V)], delim: impl AsRef<[u8]>) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let delim = delim.as_ref();
        let locked = self.lock(records.iter().map(|(key, _)| key.as_ref()))?;
        for (key, value) in records {
            locked.process(
                key.as_ref(),
                &mut |_, current| RecordAction::Set(joined(current, value.as_ref(), delim)),
                true,
            )?;
        }
        Ok(())
    }

    /// Replaces the record with `desired` if it is in the `expected` state;
    /// INFEASIBLE_ERROR otherwise.
    pub fn compare_exchange(
        &self,
        key: impl AsRef<[u8]>,
        expected: impl Into<RecordState>,
        desired: impl Into<RecordState>,
    ) -> Result<()> {
        self.compare_exchange_and_get(key, expected, desired).map(|_| ())
    }

    /// Like [`Dbm::compare_exchange`], returning the value the record had before.
    pub fn compare_exchange_and_get(
        &self,
        key: impl AsRef<[u8]>,
        expected: impl Into<RecordState>,
        desired: impl Into<RecordState>,
    ) -> Result<Option<Vec<u8>>> {
        let (expected, desired) = (expected.into(), desired.into());
        let mut matched = false;
        let mut old = None;
        self.process(
            key,
            |_, current| {
                old = current.map(<[u8]>::to_vec);
                matched = expected.matches(current);
                if matched {
                    desired.action()
                } else {
                    RecordAction::Noop
                }
            },
            true,
        )?;
        if !matched {
            return Err(Status::infeasible("record state mismatch"));
        }
        Ok(old)
    }

    /// Adds `delta` to the 8-byte big-endian integer in a record and returns the sum.
    ///
    /// A missing record counts as `initial`. A `delta` of `i64::MIN` only reads the current
    /// value and creates nothing.
    pub fn increment(&self, key: impl AsRef<[u8]>, delta: i64, initial: i64) -> Result<i64> {
        let key = key.as_ref();
        if delta == i64::MIN {
            return Ok(self.read(key)?.map_or(initial, |value| be_bytes_to_int(&value)));
        }
        let mut sum = 0;
        self.process(
            key,
            |_, current| {
                sum = current
                    .map_or(initial, be_bytes_to_int)
                    .wrapping_add(delta);
                RecordAction::Set(int_to_be_bytes(sum).to_vec())
            },
            true,
        )?;
        Ok(sum)
    }

    /// Checks every expected state, then applies every desired state, all under one lock.
    /// Nothing is written unless all checks pass.
    pub fn compare_exchange_multi<K, D>(
        &self,
        expected: &[(K, RecordState)],
        desired: &[(D, RecordState)],
    ) -> Result<()>
    where
        K: AsRef<[u8]>,
        D: AsRef<[u8]>,
    {
        let keys = expected
            .iter()
            .map(|(key, _)| key.as_ref())
            .chain(desired.iter().map(|(key, _)| key.as_ref()));
        let locked = self.lock(keys)?;
        for (key, state) in expected {
            if !state.matches(locked.get(key.as_ref())?.as_deref()) {
                return Err(Status::infeasible("record state mismatch"));
            }
        }
        for (key, state) in desired {
            locked.apply(key.as_ref(), state.action())?;
        }
        Ok(())
    }

    /// Moves the value of `old_key` to `new_key`.
    pub fn rekey(
        &self,
        old_key: impl AsRef<[u8]>,
        new_key: impl AsRef<[u8]>,
        overwrite: bool,
    ) -> Result<()> {
        let (old_key, new_key) = (old_key.as_ref(), new_key.as_ref());
        let locked = self.lock([old_key, new_key])?;
        if !overwrite && locked.get(new_key)?.is_some() {
            return Err(Status::duplication("record exists"));
        }
        let Some(value) = locked.get(old_key)? else {
            return Err(Status::not_found("no such record"));
        };
        locked.apply(new_key, RecordAction::Set(value))?;
        if old_key != new_key {
            locked.apply(old_key, RecordAction::Remove)?;
        }
        Ok(())
    }

    /// Removes the first record and returns it; NOT_FOUND_ERROR if the database is empty.
    pub fn pop_first(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        loop {
            let mut iter = self.make_iterator();
            iter.first()?;
            let key = iter.get_key()?;
            drop(iter);
            let mut taken = None;
            self.process(
                &key,
                |_, current| match current {
                    Some(value) => {
                        taken = Some(value.to_vec());
                        RecordAction::Remove
                    }
                    None => RecordAction::Noop,
                },
                true,
            )?;
            // Another thread may have taken the record since the cursor saw it.
            if let Some(value) = taken {
                return Ok((key, value));
            }
        }
    }

    /// Adds a record keyed by the 8-byte big-endian time in nanoseconds, `wtime` seconds or
    /// the current time. Colliding keys are bumped by one. Returns the key.
    pub fn push_last(&self, value: impl AsRef<[u8]>, wtime: Option<f64>) -> Result<Vec<u8>> {
        let value = value.as_ref();
        let seconds = wtime.unwrap_or_else(wall_time).max(0.0);
        let mut id = (seconds * 1e9) as i64;
        loop {
            let key = int_to_be_bytes(id);
            match self.set(key, value, false) {
                Ok(()) => return Ok(key.to_vec()),
                Err(err) if err.code() == StatusCode::DuplicationError => id = id.wrapping_add(1),
                Err(err) => return Err(err),
            }
        }
    }

    /// Number of records.
    pub fn count(&self) -> Result<u64> {
        let _gate = self.shared()?;
        self.shards
            .iter()
            .try_fold(0, |sum, engine| Ok(sum + engine.as_engine().count()?))
    }

    /// Total size of the database files in bytes.
    pub fn file_size(&self) -> Result<u64> {
        let _gate = self.shared()?;
        self.shards
            .iter()
            .try_fold(0, |sum, engine| Ok(sum + engine.as_engine().file_size()?))
    }

    /// Path given to [`Dbm::open`], `None` for a volatile database.
    pub fn file_path(&self) -> Result<Option<PathBuf>> {
        self.check_open()?;
        if self.path.as_os_str().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.path.clone()))
    }

    /// Time of the last modification in seconds since the Unix epoch.
    pub fn timestamp(&self) -> Result<f64> {
        let _gate = self.shared()?;
        Ok(self
            .shards
            .iter()
            .map(|engine| engine.as_engine().timestamp())
            .fold(0.0, f64::max))
    }

    /// Removes every record.
    pub fn clear(&self) -> Result<()> {
        let _gate = self.exclusive()?;
        self.for_each_shard(|engine| engine.as_engine().clear())
    }

    /// Rebuilds the storage, applying any tuning given in `options`.
    pub fn rebuild(&self, options: &OpenOptions) -> Result<()> {
        let _gate = self.exclusive()?;
        self.for_each_shard(|engine| engine.as_engine().rebuild(options))
    }

    /// Whether a rebuild would improve space or time efficiency.
    pub fn should_be_rebuilt(&self) -> Result<bool> {
        let _gate = self.shared()?;
        for engine in &self.shards {
            if engine.as_engine().should_be_rebuilt()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Writes pending updates to the file; `hard` also flushes the device.
    pub fn synchronize(&self, hard: bool, options: &SyncOptions) -> Result<()> {
        let _gate = self.exclusive()?;
        self.for_each_shard(|engine| engine.as_engine().synchronize(hard, options))
    }

    /// Copies the database files to `dest`, shard by shard for a shard set.
    pub fn copy_file_data(&self, dest: impl AsRef<Path>, sync_hard: bool) -> Result<()> {
        let dest = dest.as_ref();
        let _gate = self.exclusive()?;
        if !self.sharded {
            return self.shards[0].as_engine().copy_file_data(dest, sync_hard);
        }
        let count = self.shards.len() as u32;
        for (index, engine) in self.shards.iter().enumerate() {
            engine
                .as_engine()
                .copy_file_data(&shard_path(dest, index as u32, count), sync_hard)?;
        }
        Ok(())
    }

    /// Copies every record into `dest`, overwriting records it already has.
    pub fn export(&self, dest: &Dbm) -> Result<()> {
        if std::ptr::eq(self, dest) {
            return Err(Status::invalid_argument("exporting a database into itself"));
        }
        let mut status = Status::success();
        self.process_each(
            |key, value| {
                if let (Some(value), true) = (value, status.is_ok()) {
                    status.join_result(dest.set(key, value, true));
                }
                RecordAction::Noop
            },
            false,
        )?;
        status.into_result()
    }

    /// Writes every record to `file` as a flat record stream.
    pub fn export_to_flat_records(&self, file: &File) -> Result<()> {
        let mut writer = FlatRecordWriter::new(file);
        let mut status = Status::success();
        self.process_each(
            |key, value| {
                if let (Some(value), true) = (value, status.is_ok()) {
                    status.join_result(writer.write(key, value));
                }
                RecordAction::Noop
            },
            false,
        )?;
        status.into_result()?;
        writer.flush()
    }

    /// Stores every record of a flat record stream.
    ///
    /// Records already present are overwritten; importing twice into a database that was not
    /// cleared in between leaves it in an undefined state.
    pub fn import_from_flat_records(&self, file: &File) -> Result<()> {
        let _gate = self.exclusive()?;
        let mut imported = 0u64;
        for record in FlatRecordReader::new(file) {
            let (key, value) = record?;
            let mut value = Some(value);
            self.shard_of(&key).as_engine().process(
                &key,
                &mut |_, _| value.take().map_or(RecordAction::Noop, RecordAction::Set),
                true,
            )?;
            imported += 1;
        }
        debug!("imported {} records from {}", imported, file.path().display());
        Ok(())
    }

    /// Writes every key to `file`, one per line.
    pub fn export_keys_as_lines(&self, file: &File) -> Result<()> {
        let mut buffer = Vec::new();
        let mut status = Status::success();
        self.process_each(
            |key, _| {
                buffer.extend_from_slice(key);
                buffer.push(b'\n');
                if buffer.len() >= LINES_BUFFER_SIZE && status.is_ok() {
                    status.join_result(file.append(&buffer));
                    buffer.clear();
                }
                RecordAction::Noop
            },
            false,
        )?;
        status.into_result()?;
        if !buffer.is_empty() {
            file.append(&buffer)?;
        }
        Ok(())
    }

    /// Properties of the database as name/value pairs; `class` names the engine.
    pub fn inspect(&self) -> Result<Vec<(String, String)>> {
        let count = self.count()?;
        let _gate = self.shared()?;
        let mut props = self.shards[0].as_engine().inspect();
        for (name, value) in props.iter_mut() {
            if name == "num_records" {
                *value = count.to_string();
            }
        }
        if self.sharded {
            props.push(("num_shards".to_string(), self.shards.len().to_string()));
        }
        Ok(props)
    }

    /// Whether the handle is bound to a database.
    pub fn is_open(&self) -> bool {
        !self.shards.is_empty()
    }

    /// Whether the database was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.shards
            .first()
            .is_some_and(|engine| engine.as_engine().is_writable())
    }

    /// Whether every shard is free of detected corruption.
    pub fn is_healthy(&self) -> bool {
        self.is_open()
            && self
                .shards
                .iter()
                .all(|engine| engine.as_engine().is_healthy())
    }

    /// Whether records are kept in key order.
    pub fn is_ordered(&self) -> bool {
        self.shards
            .first()
            .is_some_and(|engine| engine.as_engine().is_ordered())
    }

    /// Engine the handle is bound to.
    pub fn kind(&self) -> Option<EngineKind> {
        self.kind
    }

    /// Keys matching `pattern` under a search mode, at most `capacity` of them (0 for no
    /// limit). See [`crate::search`] for the modes.
    pub fn search(&self, mode: &str, pattern: &[u8], capacity: usize) -> Result<Vec<Vec<u8>>> {
        crate::search::search_dbm(self, mode.parse()?, pattern, capacity)
    }

    /// Creates an unpositioned cursor over the records.
    pub fn make_iterator(&self) -> DbmIterator<'_> {
        DbmIterator::new(self)
    }

    /// Copies the readable records of a possibly damaged database into a new one.
    ///
    /// `kind` defaults to the engine guessed from the extension of `old_path`. A shard set
    /// is restored shard by shard. For file engines, `end_offset` bounds the scan of the old
    /// file: negative means the whole file and 0 the size recorded at the last
    /// synchronization.
    pub fn restore_database(
        old_path: impl AsRef<Path>,
        new_path: impl AsRef<Path>,
        kind: Option<EngineKind>,
        end_offset: i64,
    ) -> Result<RestoreReport> {
        let (old_path, new_path) = (old_path.as_ref(), new_path.as_ref());
        let kind = kind.unwrap_or_else(|| EngineKind::from_path(old_path));
        let count = if old_path.is_file() {
            0
        } else {
            discover_shards(old_path)?
        };
        if count == 0 {
            return restore_file(kind, old_path, new_path, end_offset);
        }
        let mut total = RestoreReport::default();
        for index in 0..count {
            let report = restore_file(
                kind,
                &shard_path(old_path, index, count),
                &shard_path(new_path, index, count),
                end_offset,
            )?;
            total.restored += report.restored;
            total.discarded += report.discarded;
        }
        Ok(total)
    }
}

fn joined(current: Option<&[u8]>, value: &[u8], delim: &[u8]) -> Vec<u8> {
    match current {
        Some(current) => [current, delim, value].concat(),
        None => value.to_vec(),
    }
}

fn restore_file(
    kind: EngineKind,
    old_path: &Path,
    new_path: &Path,
    end_offset: i64,
) -> Result<RestoreReport> {
    match kind {
        EngineKind::Hash => HashEngine::restore(old_path, new_path, end_offset),
        EngineKind::Tree => TreeEngine::restore(old_path, new_path, end_offset),
        EngineKind::Skip => SkipEngine::restore(old_path, new_path, end_offset),
        _ => restore_flat_records(old_path, new_path),
    }
}

/// Copies the readable prefix of a flat record file.
fn restore_flat_records(old_path: &Path, new_path: &Path) -> Result<RestoreReport> {
    let old = File::open(old_path, false, FileOpenFlags::default())?;
    let new = File::open(
        new_path,
        true,
        FileOpenFlags {
            truncate: true,
            no_create: false,
        },
    )?;
    let mut writer = FlatRecordWriter::new(&new);
    let mut report = RestoreReport::default();
    for record in FlatRecordReader::new(&old) {
        match record {
            Ok((key, value)) => {
                writer.write(&key, &value)?;
                report.restored += 1;
            }
            Err(err) => {
                warn!("{}: stopped at a broken record: {}", old_path.display(), err);
                report.discarded += 1;
                break;
            }
        }
    }
    writer.flush()?;
    new.synchronize(false)?;
    info!(
        "restored {} into {}: {} records, {} discarded",
        old_path.display(),
        new_path.display(),
        report.restored,
        report.discarded
    );
    Ok(report)
}

impl Drop for Dbm {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!("closing {} failed: {}", self.path.display(), err);
            }
        }
    }
}

impl fmt::Debug for Dbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dbm")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl fmt::Display for Dbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            None => write!(f, "polydbm::Dbm: closed"),
            Some(kind) => {
                write!(f, "polydbm::Dbm: class={} path={:?}", kind.class_name(), self.path)?;
                match self.count() {
                    Ok(count) => write!(f, " num_records={}", count),
                    Err(_) => Ok(()),
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a Dbm {
    type Item = Result<(Vec<u8>, Vec<u8>)>;
    type IntoIter = crate::iterator::Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        crate::iterator::Records::new(self.make_iterator())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volatile(dbm: &str) -> Dbm {
        let mut db = Dbm::new();
        let options = OpenOptions::from_params([("dbm", dbm)]).unwrap();
        db.open("", true, &options).unwrap();
        db
    }

    #[test]
    fn closed_handle_is_rejected() {
        let mut db = Dbm::new();
        assert_eq!(db.get("a").unwrap_err(), StatusCode::PreconditionError);
        assert_eq!(db.close().unwrap_err(), StatusCode::PreconditionError);
        db.open("", true, &OpenOptions::new()).unwrap();
        assert_eq!(
            db.open("", true, &OpenOptions::new()).unwrap_err(),
            StatusCode::PreconditionError
        );
        db.close().unwrap();
        assert_eq!(db.count().unwrap_err(), StatusCode::PreconditionError);
    }

    #[test]
    fn set_without_overwrite_reports_the_old_value() {
        let db = volatile("tiny");
        assert_eq!(None, db.set_and_get("k", "1", false).unwrap());
        assert_eq!(
            db.set_and_get("k", "2", false).unwrap_err(),
            StatusCode::DuplicationError
        );
        assert_eq!(Some(b"1".to_vec()), db.set_and_get("k", "3", true).unwrap());
        assert_eq!(b"3".to_vec(), db.get("k").unwrap());
    }

    #[test]
    fn remove_multi_removes_what_exists() {
        let db = volatile("baby");
        db.set_multi(&[("one", "1"), ("two", "2")], true).unwrap();
        assert_eq!(
            db.remove_multi(&["two", "three"]).unwrap_err(),
            StatusCode::NotFoundError
        );
        assert_eq!(1, db.count().unwrap());
        assert_eq!(db.remove_and_get("two").unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(b"1".to_vec(), db.remove_and_get("one").unwrap());
    }

    #[test]
    fn compare_exchange_states() {
        let db = volatile("stdhash");
        db.compare_exchange("k", RecordState::Absent, "a").unwrap();
        assert_eq!(
            db.compare_exchange("k", RecordState::Absent, "b").unwrap_err(),
            StatusCode::InfeasibleError
        );
        db.compare_exchange("k", RecordState::Any, RecordState::Any).unwrap();
        assert_eq!(
            Some(b"a".to_vec()),
            db.compare_exchange_and_get("k", "a", "b").unwrap()
        );
        db.compare_exchange("k", "b", RecordState::Absent).unwrap();
        assert_eq!(
            db.compare_exchange("k", RecordState::Any, "c").unwrap_err(),
            StatusCode::InfeasibleError
        );
        assert_eq!(0, db.count().unwrap());
    }

    #[test]
    fn increment_peeks_with_min() {
        let db = volatile("tiny");
        assert_eq!(10002, db.increment("n", 2, 10000).unwrap());
        assert_eq!(10002, db.increment("n", i64::MIN, 0).unwrap());
        assert_eq!(5, db.increment("m", i64::MIN, 5).unwrap());
        assert_eq!(db.get("m").unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(int_to_be_bytes(10002).to_vec(), db.get("n").unwrap());
    }

    #[test]
    fn compare_exchange_multi_is_all_or_nothing() {
        let db = volatile("tiny");
        db.set("a", "1", true).unwrap();
        let failed = db.compare_exchange_multi(
            &[("a", RecordState::from("1")), ("b", RecordState::Any)],
            &[("a", RecordState::from("2")), ("b", RecordState::from("2"))],
        );
        assert_eq!(failed.unwrap_err(), StatusCode::InfeasibleError);
        assert_eq!(b"1".to_vec(), db.get("a").unwrap());
        db.compare_exchange_multi(
            &[("a", RecordState::from("1")), ("b", RecordState::Absent)],
            &[("a", RecordState::Absent), ("b", RecordState::from("2"))],
        )
        .unwrap();
        assert_eq!(vec![(b"b".to_vec(), b"2".to_vec())], db.get_multi(&["a", "b"]).unwrap());
    }

    #[test]
    fn rekey_and_append() {
        let db = volatile("baby");
        db.append("zero", "a", ":").unwrap();
        db.append("zero", "b", ":").unwrap();
        db.set("one", "1", true).unwrap();
        assert_eq!(
            db.rekey("zero", "one", false).unwrap_err(),
            StatusCode::DuplicationError
        );
        db.rekey("zero", "one", true).unwrap();
        assert_eq!(b"a:b".to_vec(), db.get("one").unwrap());
        assert_eq!(db.rekey("zero", "two", true).unwrap_err(), StatusCode::NotFoundError);
    }

    #[test]
    fn push_last_then_pop_first() {
        let db = volatile("baby");
        assert_eq!(vec![0u8; 8], db.push_last("foo", Some(0.0)).unwrap());
        assert_eq!(vec![0, 0, 0, 0, 0, 0, 0, 1], db.push_last("bar", Some(0.0)).unwrap());
        assert_eq!((vec![0u8; 8], b"foo".to_vec()), db.pop_first().unwrap());
        assert_eq!(b"bar".to_vec(), db.pop_first().unwrap().1);
        assert_eq!(db.pop_first().unwrap_err(), StatusCode::NotFoundError);
    }

    #[test]
    fn process_multi_sees_keys_in_order() {
        let db = volatile("tiny");
        db.set_multi(&[("one", "hop"), ("two", "step"), ("three", "jump")], true)
            .unwrap();
        db.process_multi(
            &["one", "two", "three", "four"],
            |key, value| match (key, value) {
                (b"one" | b"two", _) => RecordAction::Remove,
                (_, Some(value)) => RecordAction::Set([value, value].concat()),
                (_, None) => RecordAction::Set(b"x".to_vec()),
            },
            true,
        )
        .unwrap();
        assert_eq!(2, db.count().unwrap());
        assert_eq!(b"jumpjump".to_vec(), db.get("three").unwrap());
        assert_eq!(b"x".to_vec(), db.get("four").unwrap());
    }

    #[test]
    fn shard_names() {
        assert_eq!(
            PathBuf::from("/tmp/casket-00002-of-00004"),
            shard_path(Path::new("/tmp/casket"), 2, 4)
        );
        assert_eq!(4, shard_paths(Path::new(""), Some(4)).unwrap().len());
        assert_eq!(1, shard_paths(Path::new(""), Some(0)).unwrap().len());
    }
}
