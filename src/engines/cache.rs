use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;

use super::memory::{Backing, Lifecycle};
use super::{Engine, Processor, RecordAction};
use crate::lru::LruMap;
use crate::options::{OpenOptions, SyncOptions};
use crate::Result;

struct CacheState {
    records: LruMap<Vec<u8>, Vec<u8>>,
    mem_size: u64,
}

impl CacheState {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let added = (key.len() + value.len()) as u64;
        let key_len = key.len() as u64;
        match self.records.insert(key, value) {
            Some(old) => self.mem_size = self.mem_size + added - key_len - old.len() as u64,
            None => self.mem_size += added,
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(old) = self.records.remove(key) {
            self.mem_size -= (key.len() + old.len()) as u64;
        }
    }
}

/// In-memory LRU cache bounded by record count and by memory usage.
pub(crate) struct CacheEngine {
    state: Mutex<CacheState>,
    cap_rec_num: u64,
    cap_mem_size: u64,
    backing: Backing,
    life: Lifecycle,
}

impl CacheEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<CacheEngine> {
        let engine = CacheEngine {
            state: Mutex::new(CacheState {
                records: LruMap::new(),
                mem_size: 0,
            }),
            cap_rec_num: options.cap_rec_num.filter(|cap| *cap > 0).unwrap_or(u64::MAX),
            cap_mem_size: options.cap_mem_size.filter(|cap| *cap > 0).unwrap_or(u64::MAX),
            backing: Backing::open(path, writable, options)?,
            life: Lifecycle::new(writable),
        };
        {
            let mut state = engine.state.lock();
            engine.backing.load(&mut |key, value| state.insert(key, value))?;
            engine.evict(&mut state);
        }
        Ok(engine)
    }

    /// Drops least recently used records until both caps hold.
    fn evict(&self, state: &mut CacheState) {
        let mut evicted = 0;
        while state.records.len() as u64 > self.cap_rec_num
            || (state.mem_size > self.cap_mem_size && state.records.len() > 1)
        {
            let Some((key, value)) = state.records.pop_lru() else {
                break;
            };
            state.mem_size -= (key.len() + value.len()) as u64;
            evicted += 1;
        }
        if evicted > 0 {
            debug!("evicted {} cached records", evicted);
        }
    }

    fn save(&self, hard: bool) -> Result<()> {
        let state = self.state.lock();
        self.backing.save(hard, &mut |writer| {
            for key in state.records.keys_lru() {
                if let Some(value) = state.records.peek(key) {
                    writer.write(key, value)?;
                }
            }
            Ok(())
        })
    }
}

impl Engine for CacheEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let mut state = self.state.lock();
        let action = proc(key, state.records.get(key).map(Vec::as_slice));
        if !writable {
            return Ok(());
        }
        match action {
            RecordAction::Noop => return Ok(()),
            RecordAction::Set(value) => {
                state.insert(key.to_vec(), value);
                self.evict(&mut state);
            }
            RecordAction::Remove => state.remove(key),
        }
        self.life.touch();
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let mut state = self.state.lock();
        let keys: Vec<Vec<u8>> = state.records.keys_lru().cloned().collect();
        for key in keys {
            let Some(value) = state.records.peek(&key) else {
                continue;
            };
            match proc(&key, Some(value)) {
                RecordAction::Set(value) if writable => state.insert(key, value),
                RecordAction::Remove if writable => state.remove(&key),
                _ => {}
            }
        }
        if writable {
            self.evict(&mut state);
            self.life.touch();
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.life.check(false)?;
        Ok(self.state.lock().records.len() as u64)
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
        let mut state = self.state.lock();
        state.records.clear();
        state.mem_size = 0;
        self.life.touch();
        Ok(())
    }

    fn rebuild(&self, _options: &OpenOptions) -> Result<()> {
        self.life.check(true)
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
        let state = self.state.lock();
        let cap = |value: u64| {
            if value == u64::MAX {
                "unlimited".to_string()
            } else {
                value.to_string()
            }
        };
        vec![
            ("class".to_string(), "CacheDBM".to_string()),
            ("num_records".to_string(), state.records.len().to_string()),
            ("mem_size".to_string(), state.mem_size.to_string()),
            ("cap_rec_num".to_string(), cap(self.cap_rec_num)),
            ("cap_mem_size".to_string(), cap(self.cap_mem_size)),
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
        let state = self.state.lock();
        if from > 0 || state.records.is_empty() {
            return Ok(None);
        }
        Ok(Some((0, state.records.keys_lru().cloned().collect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(engine: &CacheEngine, key: &str, value: &str) {
        let value = value.as_bytes().to_vec();
        engine
            .process(key.as_bytes(), &mut |_, _| RecordAction::Set(value.clone()), true)
            .unwrap();
    }

    fn has(engine: &CacheEngine, key: &str) -> bool {
        let mut found = false;
        engine
            .process(
                key.as_bytes(),
                &mut |_, value| {
                    found = value.is_some();
                    RecordAction::Noop
                },
                false,
            )
            .unwrap();
        found
    }

    #[test]
    fn reads_refresh_recency() {
        let options = OpenOptions::from_params([("cap_rec_num", "2")]).unwrap();
        let engine = CacheEngine::open(Path::new(""), true, &options).unwrap();
        set(&engine, "a", "1");
        set(&engine, "b", "2");
        assert!(has(&engine, "a"));
        set(&engine, "c", "3");
        assert!(has(&engine, "a"));
        assert!(!has(&engine, "b"));
        assert_eq!(2, engine.count().unwrap());
    }

    #[test]
    fn memory_cap() {
        let options = OpenOptions::from_params([("cap_mem_size", "10")]).unwrap();
        let engine = CacheEngine::open(Path::new(""), true, &options).unwrap();
        set(&engine, "k1", "1234");
        set(&engine, "k2", "1234");
        assert_eq!(1, engine.count().unwrap());
        assert!(has(&engine, "k2"));
        set(&engine, "k2", "x");
        set(&engine, "k3", "y");
        assert_eq!(2, engine.count().unwrap());
    }
}
