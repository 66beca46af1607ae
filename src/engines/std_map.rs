use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::memory::{Backing, Lifecycle};
use super::{Engine, Processor, RecordAction};
use crate::options::{OpenOptions, SyncOptions};
use crate::Result;

/// `std::collections::HashMap` under a read-write lock.
///
/// The whole map counts as a single bucket for cursors.
pub(crate) struct StdHashEngine {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    backing: Backing,
    life: Lifecycle,
}

impl StdHashEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<StdHashEngine> {
        let backing = Backing::open(path, writable, options)?;
        let mut map = HashMap::new();
        backing.load(&mut |key, value| {
            map.insert(key, value);
        })?;
        Ok(StdHashEngine {
            map: RwLock::new(map),
            backing,
            life: Lifecycle::new(writable),
        })
    }

    fn save(&self, hard: bool) -> Result<()> {
        let map = self.map.read();
        self.backing.save(hard, &mut |writer| {
            for (key, value) in map.iter() {
                writer.write(key, value)?;
            }
            Ok(())
        })
    }
}

impl Engine for StdHashEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        if !writable {
            let map = self.map.read();
            proc(key, map.get(key).map(Vec::as_slice));
            return Ok(());
        }
        let mut map = self.map.write();
        match proc(key, map.get(key).map(Vec::as_slice)) {
            RecordAction::Noop => return Ok(()),
            RecordAction::Set(value) => {
                map.insert(key.to_vec(), value);
            }
            RecordAction::Remove => {
                map.remove(key);
            }
        }
        self.life.touch();
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let mut map = self.map.write();
        map.retain(|key, value| match proc(key, Some(value)) {
            RecordAction::Set(new_value) if writable => {
                *value = new_value;
                true
            }
            RecordAction::Remove if writable => false,
            _ => true,
        });
        if writable {
            self.life.touch();
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.life.check(false)?;
        Ok(self.map.read().len() as u64)
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
        self.map.write().clear();
        self.life.touch();
        Ok(())
    }

    fn rebuild(&self, _options: &OpenOptions) -> Result<()> {
        self.life.check(true)?;
        self.map.write().shrink_to_fit();
        Ok(())
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.life.check(false)?;
        Ok(false)
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
            ("class".to_string(), "StdHashDBM".to_string()),
            ("num_records".to_string(), self.map.read().len().to_string()),
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
        let map = self.map.read();
        if from > 0 || map.is_empty() {
            return Ok(None);
        }
        Ok(Some((0, map.keys().cloned().collect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn single_bucket_cursor_and_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tksh");
        let engine = StdHashEngine::open(&path, true, &OpenOptions::new()).unwrap();
        assert_eq!(None, engine.bucket_keys(0).unwrap());
        for key in ["x", "y", "z"] {
            engine
                .process(key.as_bytes(), &mut |_, _| RecordAction::Set(b"1".to_vec()), true)
                .unwrap();
        }
        let (bucket, keys) = engine.bucket_keys(0).unwrap().unwrap();
        assert_eq!((0, 3), (bucket, keys.len()));
        assert_eq!(None, engine.bucket_keys(1).unwrap());
        engine.close().unwrap();

        let engine = StdHashEngine::open(&path, true, &OpenOptions::new()).unwrap();
        assert_eq!(3, engine.count().unwrap());
    }
}
