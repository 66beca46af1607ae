use std::cmp::Ordering as KeyOrdering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::memory::{Backing, Lifecycle};
use super::{Engine, Locate, Processor, RecordAction};
use crate::comparator::KeyComparator;
use crate::options::{OpenOptions, SyncOptions};
use crate::Result;

/// A key ordered by the comparator it carries.
#[derive(Debug, Clone)]
struct OrderedKey {
    key: Vec<u8>,
    comparator: KeyComparator,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == KeyOrdering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<KeyOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> KeyOrdering {
        self.comparator.compare(&self.key, &other.key)
    }
}

/// In-memory ordered map.
///
/// Also serves as the `std::collections::BTreeMap` engine, which is fixed to byte order.
pub(crate) struct BabyEngine {
    map: RwLock<BTreeMap<OrderedKey, Vec<u8>>>,
    comparator: KeyComparator,
    class: &'static str,
    backing: Backing,
    life: Lifecycle,
}

impl BabyEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<BabyEngine> {
        BabyEngine::open_with(
            path,
            writable,
            options,
            options.key_comparator.unwrap_or_default(),
            "BabyDBM",
        )
    }

    pub(crate) fn open_std_tree(
        path: &Path,
        writable: bool,
        options: &OpenOptions,
    ) -> Result<BabyEngine> {
        BabyEngine::open_with(path, writable, options, KeyComparator::Lexical, "StdTreeDBM")
    }

    fn open_with(
        path: &Path,
        writable: bool,
        options: &OpenOptions,
        comparator: KeyComparator,
        class: &'static str,
    ) -> Result<BabyEngine> {
        let backing = Backing::open(path, writable, options)?;
        let mut map = BTreeMap::new();
        backing.load(&mut |key, value| {
            map.insert(OrderedKey { key, comparator }, value);
        })?;
        Ok(BabyEngine {
            map: RwLock::new(map),
            comparator,
            class,
            backing,
            life: Lifecycle::new(writable),
        })
    }

    fn ordered(&self, key: &[u8]) -> OrderedKey {
        OrderedKey {
            key: key.to_vec(),
            comparator: self.comparator,
        }
    }

    fn save(&self, hard: bool) -> Result<()> {
        let map = self.map.read();
        self.backing.save(hard, &mut |writer| {
            for (key, value) in map.iter() {
                writer.write(&key.key, value)?;
            }
            Ok(())
        })
    }
}

impl Engine for BabyEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let ordered = self.ordered(key);
        if !writable {
            let map = self.map.read();
            proc(key, map.get(&ordered).map(Vec::as_slice));
            return Ok(());
        }
        let mut map = self.map.write();
        match proc(key, map.get(&ordered).map(Vec::as_slice)) {
            RecordAction::Noop => return Ok(()),
            RecordAction::Set(value) => {
                map.insert(ordered, value);
            }
            RecordAction::Remove => {
                map.remove(&ordered);
            }
        }
        self.life.touch();
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.life.check(writable)?;
        let mut map = self.map.write();
        let mut removed = Vec::new();
        for (key, value) in map.iter_mut() {
            match proc(&key.key, Some(value)) {
                RecordAction::Set(new_value) if writable => *value = new_value,
                RecordAction::Remove if writable => removed.push(key.clone()),
                _ => {}
            }
        }
        for key in &removed {
            map.remove(key);
        }
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
        vec![
            ("class".to_string(), self.class.to_string()),
            ("num_records".to_string(), self.map.read().len().to_string()),
            ("key_comparator".to_string(), self.comparator.name().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        self.life.is_writable()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn comparator(&self) -> KeyComparator {
        self.comparator
    }

    fn locate(&self, target: Locate<'_>) -> Result<Option<Vec<u8>>> {
        self.life.check(false)?;
        let map = self.map.read();
        let found = match target {
            Locate::First => map.keys().next(),
            Locate::Last => map.keys().next_back(),
            Locate::Ge(key) => map
                .range((Bound::Included(self.ordered(key)), Bound::Unbounded))
                .map(|(key, _)| key)
                .next(),
            Locate::Gt(key) => map
                .range((Bound::Excluded(self.ordered(key)), Bound::Unbounded))
                .map(|(key, _)| key)
                .next(),
            Locate::Le(key) => map
                .range((Bound::Unbounded, Bound::Included(self.ordered(key))))
                .map(|(key, _)| key)
                .next_back(),
            Locate::Lt(key) => map
                .range((Bound::Unbounded, Bound::Excluded(self.ordered(key))))
                .map(|(key, _)| key)
                .next_back(),
        };
        Ok(found.map(|key| key.key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(comparator: &str, keys: &[&str]) -> BabyEngine {
        let options = OpenOptions::from_params([("key_comparator", comparator)]).unwrap();
        let engine = BabyEngine::open(Path::new(""), true, &options).unwrap();
        for key in keys {
            engine
                .process(key.as_bytes(), &mut |_, _| RecordAction::Set(b"v".to_vec()), true)
                .unwrap();
        }
        engine
    }

    #[test]
    fn comparator_orders_keys() {
        let engine = engine_with("decimal", &["10", "9", "100", "-3"]);
        assert_eq!(Some(b"-3".to_vec()), engine.locate(Locate::First).unwrap());
        assert_eq!(Some(b"100".to_vec()), engine.locate(Locate::Last).unwrap());
        assert_eq!(Some(b"10".to_vec()), engine.locate(Locate::Gt(b"9")).unwrap());
        assert_eq!(Some(b"9".to_vec()), engine.locate(Locate::Lt(b"10")).unwrap());
        assert_eq!(Some(b"10".to_vec()), engine.locate(Locate::Ge(b"10")).unwrap());
        assert_eq!(None, engine.locate(Locate::Gt(b"100")).unwrap());
    }

    #[test]
    fn process_each_removes() {
        let engine = engine_with("lexical", &["a", "b", "c", "d"]);
        engine
            .process_each(
                &mut |key, _| {
                    if key == b"b" || key == b"d" {
                        RecordAction::Remove
                    } else {
                        RecordAction::Set(key.to_vec())
                    }
                },
                true,
            )
            .unwrap();
        assert_eq!(2, engine.count().unwrap());
        let mut value = None;
        engine
            .process(
                b"c",
                &mut |_, current| {
                    value = current.map(<[u8]>::to_vec);
                    RecordAction::Noop
                },
                false,
            )
            .unwrap();
        assert_eq!(Some(b"c".to_vec()), value);
    }
}
