use std::path::PathBuf;
use std::sync::Arc;

use crate::dbm::{Dbm, RecordState};
use crate::file::File;
use crate::future::{self, Future};
use crate::options::{OpenOptions, SyncOptions};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};
use crate::Result;

type Records = Vec<(Vec<u8>, Vec<u8>)>;

/// Runs the operations of a shared [`Dbm`] on a pool of worker threads.
///
/// Every method returns a [`Future`] at once. Tasks submitted from different threads run in
/// no particular order, and neither do tasks from one thread when the pool has several
/// workers: wait on a future before submitting work that depends on it. Dropping the adapter
/// finishes every submitted task first.
pub struct AsyncDbm<P: ThreadPool = SharedQueueThreadPool> {
    dbm: Arc<Dbm>,
    pool: P,
}

impl AsyncDbm<SharedQueueThreadPool> {
    /// Wraps `dbm` with `num_threads` workers sharing one queue.
    pub fn new(dbm: Arc<Dbm>, num_threads: u32) -> Result<Self> {
        Ok(AsyncDbm::with_pool(dbm, SharedQueueThreadPool::new(num_threads)?))
    }
}

impl<P: ThreadPool> AsyncDbm<P> {
    /// Wraps `dbm` with the given pool.
    pub fn with_pool(dbm: Arc<Dbm>, pool: P) -> Self {
        AsyncDbm { dbm, pool }
    }

    /// The wrapped database.
    pub fn dbm(&self) -> &Arc<Dbm> {
        &self.dbm
    }

    /// Waits for every submitted task and gives back the database.
    pub fn into_inner(self) -> Arc<Dbm> {
        let AsyncDbm { dbm, pool } = self;
        drop(pool);
        dbm
    }

    fn submit<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce(&Dbm) -> Result<T> + Send + 'static,
    {
        let (promise, future) = future::channel();
        let dbm = Arc::clone(&self.dbm);
        self.pool.spawn(move || promise.fulfill(task(&dbm)));
        future
    }

    /// See [`Dbm::get`].
    pub fn get(&self, key: impl Into<Vec<u8>>) -> Future<Vec<u8>> {
        let key = key.into();
        self.submit(move |dbm| dbm.get(&key))
    }

    /// See [`Dbm::get_multi`].
    pub fn get_multi(&self, keys: Vec<Vec<u8>>) -> Future<Records> {
        self.submit(move |dbm| dbm.get_multi(&keys))
    }

    /// See [`Dbm::set`].
    pub fn set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        overwrite: bool,
    ) -> Future<()> {
        let (key, value) = (key.into(), value.into());
        self.submit(move |dbm| dbm.set(&key, &value, overwrite))
    }

    /// See [`Dbm::set_multi`].
    pub fn set_multi(&self, records: Records, overwrite: bool) -> Future<()> {
        self.submit(move |dbm| dbm.set_multi(&records, overwrite))
    }

    /// See [`Dbm::append`].
    pub fn append(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        delim: impl Into<Vec<u8>>,
    ) -> Future<()> {
        let (key, value, delim) = (key.into(), value.into(), delim.into());
        self.submit(move |dbm| dbm.append(&key, &value, &delim))
    }

    /// See [`Dbm::append_multi`].
    pub fn append_multi(&self, records: Records, delim: impl Into<Vec<u8>>) -> Future<()> {
        let delim = delim.into();
        self.submit(move |dbm| dbm.append_multi(&records, &delim))
    }

    /// See [`Dbm::remove`].
    pub fn remove(&self, key: impl Into<Vec<u8>>) -> Future<()> {
        let key = key.into();
        self.submit(move |dbm| dbm.remove(&key))
    }

    /// See [`Dbm::remove_multi`].
    pub fn remove_multi(&self, keys: Vec<Vec<u8>>) -> Future<()> {
        self.submit(move |dbm| dbm.remove_multi(&keys))
    }

    /// See [`Dbm::compare_exchange`].
    pub fn compare_exchange(
        &self,
        key: impl Into<Vec<u8>>,
        expected: impl Into<RecordState>,
        desired: impl Into<RecordState>,
    ) -> Future<()> {
        let (key, expected, desired) = (key.into(), expected.into(), desired.into());
        self.submit(move |dbm| dbm.compare_exchange(&key, expected, desired))
    }

    /// See [`Dbm::increment`].
    pub fn increment(&self, key: impl Into<Vec<u8>>, delta: i64, initial: i64) -> Future<i64> {
        let key = key.into();
        self.submit(move |dbm| dbm.increment(&key, delta, initial))
    }

    /// See [`Dbm::compare_exchange_multi`].
    pub fn compare_exchange_multi(
        &self,
        expected: Vec<(Vec<u8>, RecordState)>,
        desired: Vec<(Vec<u8>, RecordState)>,
    ) -> Future<()> {
        self.submit(move |dbm| dbm.compare_exchange_multi(&expected, &desired))
    }

    /// See [`Dbm::rekey`].
    pub fn rekey(
        &self,
        old_key: impl Into<Vec<u8>>,
        new_key: impl Into<Vec<u8>>,
        overwrite: bool,
    ) -> Future<()> {
        let (old_key, new_key) = (old_key.into(), new_key.into());
        self.submit(move |dbm| dbm.rekey(&old_key, &new_key, overwrite))
    }

    /// See [`Dbm::pop_first`].
    pub fn pop_first(&self) -> Future<(Vec<u8>, Vec<u8>)> {
        self.submit(|dbm| dbm.pop_first())
    }

    /// See [`Dbm::push_last`].
    pub fn push_last(&self, value: impl Into<Vec<u8>>, wtime: Option<f64>) -> Future<Vec<u8>> {
        let value = value.into();
        self.submit(move |dbm| dbm.push_last(&value, wtime))
    }

    /// See [`Dbm::clear`].
    pub fn clear(&self) -> Future<()> {
        self.submit(|dbm| dbm.clear())
    }

    /// See [`Dbm::rebuild`].
    pub fn rebuild(&self, options: OpenOptions) -> Future<()> {
        self.submit(move |dbm| dbm.rebuild(&options))
    }

    /// See [`Dbm::synchronize`].
    pub fn synchronize(&self, hard: bool, options: SyncOptions) -> Future<()> {
        self.submit(move |dbm| dbm.synchronize(hard, &options))
    }

    /// See [`Dbm::copy_file_data`].
    pub fn copy_file_data(&self, dest: impl Into<PathBuf>, sync_hard: bool) -> Future<()> {
        let dest = dest.into();
        self.submit(move |dbm| dbm.copy_file_data(&dest, sync_hard))
    }

    /// See [`Dbm::export`].
    pub fn export(&self, dest: Arc<Dbm>) -> Future<()> {
        self.submit(move |dbm| dbm.export(&dest))
    }

    /// See [`Dbm::export_to_flat_records`].
    pub fn export_to_flat_records(&self, file: Arc<File>) -> Future<()> {
        self.submit(move |dbm| dbm.export_to_flat_records(&file))
    }

    /// See [`Dbm::import_from_flat_records`].
    pub fn import_from_flat_records(&self, file: Arc<File>) -> Future<()> {
        self.submit(move |dbm| dbm.import_from_flat_records(&file))
    }

    /// See [`Dbm::search`].
    pub fn search(
        &self,
        mode: impl Into<String>,
        pattern: impl Into<Vec<u8>>,
        capacity: usize,
    ) -> Future<Vec<Vec<u8>>> {
        let (mode, pattern) = (mode.into(), pattern.into());
        self.submit(move |dbm| dbm.search(&mode, &pattern, capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::thread_pool::NaiveThreadPool;

    fn shared_dbm() -> Arc<Dbm> {
        let mut dbm = Dbm::new();
        dbm.open("", true, &OpenOptions::new()).unwrap();
        Arc::new(dbm)
    }

    #[test]
    fn statuses_match_the_synchronous_calls() {
        let adbm = AsyncDbm::new(shared_dbm(), 4).unwrap();
        adbm.set("one", "1", true).get().unwrap();
        assert_eq!(adbm.set("one", "2", false).get().unwrap_err(), StatusCode::DuplicationError);
        assert_eq!(b"1".to_vec(), adbm.get("one").get().unwrap());
        assert_eq!(adbm.get("two").get().unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(
            adbm.compare_exchange("one", "x", "y").get().unwrap_err(),
            StatusCode::InfeasibleError
        );
        assert_eq!(3, adbm.increment("n", 3, 0).get().unwrap());
        assert_eq!(2, adbm.dbm().count().unwrap());
    }

    #[test]
    fn naive_pool_drains_on_drop() {
        let adbm = AsyncDbm::with_pool(shared_dbm(), NaiveThreadPool::new(0).unwrap());
        let futures: Vec<_> = (0..20)
            .map(|i| adbm.set(format!("{}", i), "v", true))
            .collect();
        let dbm = adbm.into_inner();
        assert_eq!(20, dbm.count().unwrap());
        assert!(futures.iter().all(Future::is_ready));
    }
}
