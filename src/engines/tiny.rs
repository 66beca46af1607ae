use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::memory::{Backing, Lifecycle};
use super::{Engine, Processor, RecordAction};
use crate::options::{OpenOptions, SyncOptions};
use crate::util::primary_hash;
use crate::{Result, Status};

const DEFAULT_NUM_BUCKETS: u64 = 131_101;

type Bucket = Vec<(Vec<u8>, Vec<u8>)>;

/// In-memory hash table with a fixed number of independently locked buckets.
pub(crate) struct TinyEngine {
    buckets: RwLock<Vec<Mutex<Bucket>>>,
    num_records: AtomicU64,
    backing: Backing,
    life: Lifecycle,
}

fn make_buckets(num_buckets: u64) -> Vec<Mutex<Bucket>> {
    (0..num_buckets).map(|_| Mutex::new(Vec::new())).collect()
}

/// Applies an action to the entry of `key` in `bucket`; returns the change in record count.
fn apply(bucket: &mut Bucket, position: Option<usize>, key: &[u8], action: RecordAction) -> i64 {
    match (action, position) {
        (RecordAction::Noop, _) => 0,
        (RecordAction::Set(value), Some(i)) => {
            bucket[i].1 = value;
            0
        }
        (RecordAction::Set(value), None) => {
            bucket.push((key.to_vec(), value));
            1
        }
        (RecordAction::Remove, Some(i)) => {
            bucket.swap_remove(i);
            -1
        }
        (RecordAction::Remove, None) => 0,
    }
}

impl TinyEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<TinyEngine> {
        let num_buckets = options.num_buckets.unwrap_or(DEFAULT_NUM_BUCKETS);
        if num_buckets == 0 {
            return Err(Status::invalid_argument("num_buckets must be positive"));
        }
        let engine = TinyEngine {
            buckets: RwLock::new(make_buckets(num_buckets)),
            num_records: AtomicU64::new(0),
            backing: Backing::open(path, writable, options)?,
            life: Lifecycle::new(writable),
        };
        {
            let buckets = engine.buckets.write();
            let mut loaded = 0;
            engine.backing.load(&mut |key, value| {
                let mut bucket = buckets[primary_hash(&key, num_buckets) as usize].lock();
                match bucket.iter().position(|(probe, _)| *probe == key) {
                    Some(i) => bucket[i].1 = value,
                    None => {
                        bucket.push((key, value));
                        loaded += 1;
                    }
                }
            })?;
            engine.num_records.store(loaded, Ordering::Release);
        }
        Ok(engine)
    }

    fn save(&self, hard: bool) -> Result<()> {
        let buckets = self.buckets.read();
        self.backing.save(hard, &mut |writer| {
            for bucket in buckets.iter() {
                for (key, value) in bucket.lock().iter() {
                    writer.write(key, value)?;
                }
            }
            Ok(())
        })
    }

    fn adjust_count(&self, delta: i64) {
        if delta > 0 {
            self.num_records.fetch_add(delta as u64, Ordering::AcqRel);
        } else if delta < 0 {
            self.num_records.fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
        }
    }
}

impl Engine for TinyEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let buckets = self.buckets.read();
        let index = primary_hash(key, buckets.len() as u64) as usize;
        let mut bucket = buckets[index].lock();
        let position = bucket.iter().position(|(probe, _)| probe == key);
        let action = proc(key, position.map(|i| bucket[i].1.as_slice()));
        if writable {
            if action != RecordAction::Noop {
                self.life.touch();
            }
            self.adjust_count(apply(&mut bucket, position, key, action));
        }
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let buckets = self.buckets.write();
        for bucket in buckets.iter() {
            let mut bucket = bucket.lock();
            let mut i = 0;
            while i < bucket.len() {
                let (key, value) = &bucket[i];
                let action = proc(key, Some(value));
                match action {
                    RecordAction::Set(value) if writable => {
                        bucket[i].1 = value;
                        i += 1;
                    }
                    RecordAction::Remove if writable => {
                        bucket.swap_remove(i);
                        self.adjust_count(-1);
                    }
                    _ => i += 1,
                }
            }
        }
        if writable {
            self.life.touch();
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.life.check(false)?;
        Ok(self.num_records.load(Ordering::Acquire))
    }

    fn file_size(&self) -> Result<u64> {
        self.life.check(false)?;
        Ok(self.backing.file_size())
    }

    fn file_path(&self) -> Option<PathBuf> {
        self.backing.path()
    }

    fn timestamp(&self) -> f64 {
        self.life.timestamp()
    }

    fn clear(&self) -> Result<()> {
        self.life.check(true)?;
        let buckets = self.buckets.write();
        for bucket in buckets.iter() {
            bucket.lock().clear();
        }
        self.num_records.store(0, Ordering::Release);
        self.life.touch();
        Ok(())
    }

    fn rebuild(&self, options: &OpenOptions) -> Result<()> {
        self.life.check(true)?;
        let mut buckets = self.buckets.write();
        let num_buckets = options.num_buckets.unwrap_or(buckets.len() as u64).max(1);
        let fresh = make_buckets(num_buckets);
        for bucket in buckets.iter() {
            for (key, value) in bucket.lock().drain(..) {
                fresh[primary_hash(&key, num_buckets) as usize]
                    .lock()
                    .push((key, value));
            }
        }
        *buckets = fresh;
        Ok(())
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.life.check(false)?;
        Ok(self.num_records.load(Ordering::Acquire) > self.buckets.read().len() as u64 * 2)
    }

    fn synchronize(&self, hard: bool, _options: &SyncOptions) -> Result<()> {
        self.life.check(false)?;
        self.save(hard)
    }

    fn close(&self) -> Result<()> {
        if !self.life.close() {
            return Ok(());
        }
        self.save(false)
    }

    fn inspect(&self) -> Vec<(String, String)> {
        vec![
            ("class".to_string(), "TinyDBM".to_string()),
            (
                "num_records".to_string(),
                self.num_records.load(Ordering::Acquire).to_string(),
            ),
            ("num_buckets".to_string(), self.buckets.read().len().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        self.life.is_writable()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn bucket_keys(&self, from: u64) -> Result<Option<(u64, Vec<Vec<u8>>)>> {
        self.life.check(false)?;
        let buckets = self.buckets.read();
        for (index, bucket) in buckets.iter().enumerate().skip(from as usize) {
            let bucket = bucket.lock();
            if !bucket.is_empty() {
                let keys = bucket.iter().map(|(key, _)| key.clone()).collect();
                return Ok(Some((index as u64, keys)));
            }
        }
        Ok(None)
    }

    fn bucket_index(&self, key: &[u8]) -> u64 {
        primary_hash(key, self.buckets.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn persists_as_flat_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkmt");
        let options = OpenOptions::from_params([("num_buckets", "5")]).unwrap();
        let engine = TinyEngine::open(&path, true, &options).unwrap();
        for i in 0..20 {
            let value = i.to_string().into_bytes();
            engine
                .process(i.to_string().as_bytes(), &mut |_, _| RecordAction::Set(value.clone()), true)
                .unwrap();
        }
        engine
            .process(b"3", &mut |_, _| RecordAction::Remove, true)
            .unwrap();
        assert_eq!(19, engine.count().unwrap());
        engine.close().unwrap();

        let engine = TinyEngine::open(&path, false, &OpenOptions::new()).unwrap();
        assert_eq!(19, engine.count().unwrap());
        let mut seen = 0;
        engine
            .process_each(
                &mut |key, value| {
                    assert_eq!(Some(key), value);
                    seen += 1;
                    RecordAction::Noop
                },
                false,
            )
            .unwrap();
        assert_eq!(19, seen);
        let err = engine
            .process(b"x", &mut |_, _| RecordAction::Remove, true)
            .unwrap_err();
        assert_eq!(crate::StatusCode::PreconditionError, err.code());
    }

    #[test]
    fn rebuild_rehashes() {
        let engine = TinyEngine::open(Path::new(""), true, &OpenOptions::new()).unwrap();
        for i in 0..10u8 {
            engine
                .process(&[i], &mut |_, _| RecordAction::Set(vec![i]), true)
                .unwrap();
        }
        engine
            .rebuild(&OpenOptions::from_params([("num_buckets", "2")]).unwrap())
            .unwrap();
        assert_eq!(10, engine.count().unwrap());
        let (_, keys) = engine.bucket_keys(0).unwrap().unwrap();
        assert!(!keys.is_empty());
        assert!(engine.should_be_rebuilt().unwrap());
    }
}
