use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::comparator::KeyComparator;
use crate::options::{OpenOptions, SyncOptions};
use crate::{Result, Status};

/// What a record processor asks the engine to do with the record it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// Leave the record as it is.
    Noop,
    /// Remove the record if it exists.
    Remove,
    /// Store the given value.
    Set(Vec<u8>),
}

/// Callback invoked with a key and its current value (`None` when absent).
///
/// Processors run while the record is locked and must not call back into the same database.
pub type Processor<'a> = dyn FnMut(&[u8], Option<&[u8]>) -> RecordAction + 'a;

/// Target of an ordered cursor lookup.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Locate<'a> {
    First,
    Last,
    /// Smallest key not less than the given one.
    Ge(&'a [u8]),
    /// Smallest key greater than the given one.
    Gt(&'a [u8]),
    /// Largest key not greater than the given one.
    Le(&'a [u8]),
    /// Largest key less than the given one.
    Lt(&'a [u8]),
}

/// Storage engine behind a database handle.
///
/// Every method takes `&self`; engines synchronize internally so that record operations
/// from many threads proceed concurrently and global operations run exclusively.
pub(crate) trait Engine: Send + Sync {
    /// Shows the record to `proc` and applies its answer. Read-only calls ignore the answer.
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()>;

    /// Shows every record to `proc` while holding the whole database exclusively.
    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()>;

    fn count(&self) -> Result<u64>;

    fn file_size(&self) -> Result<u64>;

    fn file_path(&self) -> Option<PathBuf>;

    fn timestamp(&self) -> f64;

    fn clear(&self) -> Result<()>;

    fn rebuild(&self, options: &OpenOptions) -> Result<()>;

    fn should_be_rebuilt(&self) -> Result<bool>;

    fn synchronize(&self, hard: bool, options: &SyncOptions) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Writes a consistent copy of the database file to `dest`.
    fn copy_file_data(&self, dest: &Path, hard: bool) -> Result<()> {
        let Some(source) = self.file_path() else {
            return Err(Status::infeasible("volatile database has no file"));
        };
        if self.is_writable() {
            self.synchronize(hard, &SyncOptions::default())?;
        }
        fs::copy(&source, dest)?;
        Ok(())
    }

    fn inspect(&self) -> Vec<(String, String)>;

    fn is_writable(&self) -> bool;

    fn is_healthy(&self) -> bool;

    fn is_ordered(&self) -> bool {
        false
    }

    fn comparator(&self) -> KeyComparator {
        KeyComparator::Lexical
    }

    /// Ordered engines: the key at the given position.
    fn locate(&self, _target: Locate<'_>) -> Result<Option<Vec<u8>>> {
        Err(Status::not_implemented("unordered database"))
    }

    /// Unordered engines: the first non-empty bucket at or after `from` and its keys.
    fn bucket_keys(&self, _from: u64) -> Result<Option<(u64, Vec<Vec<u8>>)>> {
        Err(Status::not_implemented("ordered database"))
    }

    /// Unordered engines: the bucket holding `key`.
    fn bucket_index(&self, _key: &[u8]) -> u64 {
        0
    }
}

/// Storage engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum EngineKind {
    /// File hash table.
    Hash,
    /// File B+ tree.
    Tree,
    /// File skip list.
    Skip,
    /// In-memory hash table.
    Tiny,
    /// In-memory ordered map.
    Baby,
    /// In-memory LRU cache.
    Cache,
    /// `HashMap` under a lock.
    StdHash,
    /// `BTreeMap` under a lock.
    StdTree,
}

impl EngineKind {
    /// Class name reported by `inspect`.
    pub fn class_name(self) -> &'static str {
        match self {
            EngineKind::Hash => "HashDBM",
            EngineKind::Tree => "TreeDBM",
            EngineKind::Skip => "SkipDBM",
            EngineKind::Tiny => "TinyDBM",
            EngineKind::Baby => "BabyDBM",
            EngineKind::Cache => "CacheDBM",
            EngineKind::StdHash => "StdHashDBM",
            EngineKind::StdTree => "StdTreeDBM",
        }
    }

    /// Picks an engine from a file extension; unknown or missing extensions give `Tiny`.
    pub fn from_path(path: &Path) -> EngineKind {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "tkh" | "hash" => EngineKind::Hash,
            "tkt" | "tree" => EngineKind::Tree,
            "tks" | "skip" => EngineKind::Skip,
            "tkmt" | "tiny" | "flat" => EngineKind::Tiny,
            "tkmb" | "baby" => EngineKind::Baby,
            "tkmc" | "cache" => EngineKind::Cache,
            "tksh" | "stdhash" => EngineKind::StdHash,
            "tkst" | "stdtree" => EngineKind::StdTree,
            _ => EngineKind::Tiny,
        }
    }
}

impl TryFrom<String> for EngineKind {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.trim_end_matches("dbm") {
            "hash" => Ok(EngineKind::Hash),
            "tree" => Ok(EngineKind::Tree),
            "skip" => Ok(EngineKind::Skip),
            "tiny" => Ok(EngineKind::Tiny),
            "baby" => Ok(EngineKind::Baby),
            "cache" => Ok(EngineKind::Cache),
            "stdhash" | "std_hash" => Ok(EngineKind::StdHash),
            "stdtree" | "std_tree" => Ok(EngineKind::StdTree),
            _ => Err(Status::invalid_argument(format!("unknown DBM class: {}", value))),
        }
    }
}

/// Every engine the handle can dispatch to.
pub(crate) enum AnyEngine {
    Hash(HashEngine),
    Tree(TreeEngine),
    Skip(SkipEngine),
    Tiny(TinyEngine),
    Baby(BabyEngine),
    Cache(CacheEngine),
    StdHash(StdHashEngine),
    StdTree(BabyEngine),
}

impl AnyEngine {
    pub(crate) fn open(
        kind: EngineKind,
        path: &Path,
        writable: bool,
        options: &OpenOptions,
    ) -> Result<AnyEngine> {
        Ok(match kind {
            EngineKind::Hash => AnyEngine::Hash(HashEngine::open(path, writable, options)?),
            EngineKind::Tree => AnyEngine::Tree(TreeEngine::open(path, writable, options)?),
            EngineKind::Skip => AnyEngine::Skip(SkipEngine::open(path, writable, options)?),
            EngineKind::Tiny => AnyEngine::Tiny(TinyEngine::open(path, writable, options)?),
            EngineKind::Baby => AnyEngine::Baby(BabyEngine::open(path, writable, options)?),
            EngineKind::Cache => AnyEngine::Cache(CacheEngine::open(path, writable, options)?),
            EngineKind::StdHash => {
                AnyEngine::StdHash(StdHashEngine::open(path, writable, options)?)
            }
            EngineKind::StdTree => {
                AnyEngine::StdTree(BabyEngine::open_std_tree(path, writable, options)?)
            }
        })
    }

    pub(crate) fn as_engine(&self) -> &dyn Engine {
        match self {
            AnyEngine::Hash(engine) => engine,
            AnyEngine::Tree(engine) => engine,
            AnyEngine::Skip(engine) => engine,
            AnyEngine::Tiny(engine) => engine,
            AnyEngine::Baby(engine) => engine,
            AnyEngine::Cache(engine) => engine,
            AnyEngine::StdHash(engine) => engine,
            AnyEngine::StdTree(engine) => engine,
        }
    }
}

mod baby;
mod cache;
mod hash;
mod memory;
mod reducer;
mod skip;
mod std_map;
mod tiny;
mod tree;

pub use self::reducer::Reducer;
pub(crate) use self::hash::HashEngine;
pub(crate) use self::tree::TreeEngine;
pub(crate) use self::skip::SkipEngine;
pub(crate) use self::tiny::TinyEngine;
pub(crate) use self::baby::BabyEngine;
pub(crate) use self::cache::CacheEngine;
pub(crate) use self::std_map::StdHashEngine;

/// Outcome of [`crate::Dbm::restore_database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreReport {
    /// Records written to the new database.
    pub restored: u64,
    /// Unreadable regions or records that were skipped.
    pub discarded: u64,
}
