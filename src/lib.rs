#![deny(missing_docs)]
//! An embedded key-value store over interchangeable storage engines.
//!
//! A [`Dbm`] handle binds to one engine at open time: a file hash table, a file B+ tree,
//! a file skip list, or one of several in-memory maps. All of them share the same record
//! operations, cursors and atomic compare-and-exchange primitives. [`AsyncDbm`] runs those
//! operations on a thread pool and hands back [`Future`]s.
//!
//! ```no_run
//! use polydbm::{Dbm, OpenOptions};
//!
//! # fn main() -> polydbm::Result<()> {
//! let mut dbm = Dbm::new();
//! let options = OpenOptions::from_params([("truncate", "true"), ("num_buckets", "1000")])?;
//! dbm.open("casket.tkh", true, &options)?;
//! dbm.set("first", "hop", true)?;
//! assert_eq!(b"hop".to_vec(), dbm.get("first")?);
//! dbm.close()?;
//! # Ok(())
//! # }
//! ```

pub use async_dbm::AsyncDbm;
pub use comparator::{KeyComparator, decode_pair, encode_pair};
pub use dbm::{Dbm, RecordState};
pub use engines::{EngineKind, Processor, RecordAction, Reducer, RestoreReport};
pub use error::{Result, Status, StatusCode};
pub use file::{File, FileOpenFlags};
pub use flat_records::{FlatRecordReader, FlatRecordWriter};
pub use future::Future;
pub use index::{Index, IndexIterator};
pub use iterator::{DbmIterator, Records};
pub use options::{CompressionMode, CrcMode, OpenOptions, RestoreMode, SyncOptions, UpdateMode};
pub use search::SearchMode;
pub use thread_pool::{NaiveThreadPool, SharedQueueThreadPool, ThreadPool};
pub use util::{be_bytes_to_int, edit_distance, int_to_be_bytes};

mod async_dbm;
mod codec;
mod comparator;
mod dbm;
mod engines;
mod error;
mod fbp;
mod file;
mod flat_records;
mod future;
mod index;
mod iterator;
mod lru;
mod options;
pub mod search;
pub mod thread_pool;
mod util;
