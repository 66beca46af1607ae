use std::path::Path;

use crate::comparator::{KeyComparator, decode_pair, encode_pair};
use crate::dbm::Dbm;
use crate::engines::EngineKind;
use crate::iterator::DbmIterator;
use crate::options::{OpenOptions, SyncOptions};
use crate::{Result, Status, StatusCode};

/// Secondary index mapping each key to any number of values.
///
/// Every (key, value) pair is one record of an ordered database whose keys are built by
/// [`encode_pair`], so the values of a key sit next to each other in value order. The
/// database is a tree file, or an in-memory ordered map for an empty path.
#[derive(Debug, Default)]
pub struct Index {
    dbm: Dbm,
}

fn decode(record_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    decode_pair(record_key)
        .map(|(key, value)| (key.to_vec(), value.to_vec()))
        .ok_or_else(|| Status::broken_data("malformed index record"))
}

impl Index {
    /// Creates an index that is not open yet.
    pub fn new() -> Index {
        Index::default()
    }

    /// Opens the index at `path`. The `dbm` option may pick `tree` or `baby`; other engines
    /// give INVALID_ARGUMENT_ERROR.
    pub fn open(
        &mut self,
        path: impl AsRef<Path>,
        writable: bool,
        options: &OpenOptions,
    ) -> Result<()> {
        let path = path.as_ref();
        let kind = options.dbm.unwrap_or(if path.as_os_str().is_empty() {
            EngineKind::Baby
        } else {
            EngineKind::Tree
        });
        if !matches!(kind, EngineKind::Tree | EngineKind::Baby) {
            return Err(Status::invalid_argument(format!(
                "{} cannot hold an index",
                kind.class_name()
            )));
        }
        let mut options = options.clone();
        options.dbm = Some(kind);
        options.key_comparator = Some(KeyComparator::PairLexical);
        self.dbm.open(path, writable, &options)
    }

    /// Closes the index.
    pub fn close(&mut self) -> Result<()> {
        self.dbm.close()
    }

    /// Whether the index is open.
    pub fn is_open(&self) -> bool {
        self.dbm.is_open()
    }

    /// Whether the index was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.dbm.is_writable()
    }

    /// Whether the pair is present.
    pub fn contains(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<bool> {
        match self.dbm.get(encode_pair(key.as_ref(), value.as_ref())) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == StatusCode::NotFoundError => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Values of `key` in value order, at most `max` of them (0 for no limit).
    pub fn get_values(&self, key: impl AsRef<[u8]>, max: usize) -> Result<Vec<Vec<u8>>> {
        let key = key.as_ref();
        let mut iter = self.dbm.make_iterator();
        iter.jump(encode_pair(key, b""))?;
        let mut values = Vec::new();
        while iter.is_positioned() && (max == 0 || values.len() < max) {
            let (found, value) = decode(&iter.get_key()?)?;
            if found != key {
                break;
            }
            values.push(value);
            iter.next()?;
        }
        Ok(values)
    }

    /// Adds a pair. Adding a pair that is already present does nothing.
    pub fn add(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.dbm
            .set(encode_pair(key.as_ref(), value.as_ref()), b"", true)
    }

    /// Removes a pair; NOT_FOUND_ERROR if it is not present.
    pub fn remove(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.dbm.remove(encode_pair(key.as_ref(), value.as_ref()))
    }

    /// Number of pairs.
    pub fn count(&self) -> Result<u64> {
        self.dbm.count()
    }

    /// Removes every pair.
    pub fn clear(&self) -> Result<()> {
        self.dbm.clear()
    }

    /// Rebuilds the underlying database.
    pub fn rebuild(&self) -> Result<()> {
        self.dbm.rebuild(&OpenOptions::new())
    }

    /// Writes pending updates to the file.
    pub fn synchronize(&self, hard: bool) -> Result<()> {
        self.dbm.synchronize(hard, &SyncOptions::default())
    }

    /// Creates an unpositioned cursor over the pairs.
    pub fn make_iterator(&self) -> IndexIterator<'_> {
        IndexIterator {
            inner: self.dbm.make_iterator(),
        }
    }
}

/// Cursor over the pairs of an [`Index`] in (key, value) order.
///
/// States and errors are those of [`DbmIterator`].
pub struct IndexIterator<'a> {
    inner: DbmIterator<'a>,
}

impl IndexIterator<'_> {
    /// Positions at the first pair.
    pub fn first(&mut self) -> Result<()> {
        self.inner.first()
    }

    /// Positions at the last pair.
    pub fn last(&mut self) -> Result<()> {
        self.inner.last()
    }

    /// Positions at the first pair not before (`key`, `value`).
    pub fn jump(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.inner.jump(encode_pair(key.as_ref(), value.as_ref()))
    }

    /// Moves to the following pair.
    pub fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    /// Moves to the preceding pair.
    pub fn previous(&mut self) -> Result<()> {
        self.inner.previous()
    }

    /// Whether the cursor points at a pair.
    pub fn is_positioned(&self) -> bool {
        self.inner.is_positioned()
    }

    /// Gets the current pair.
    pub fn get(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        decode(&self.inner.get_key()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_engines_are_refused() {
        let mut index = Index::new();
        let options = OpenOptions::from_params([("dbm", "hash")]).unwrap();
        assert_eq!(
            index.open("/nonexistent/index.tkh", true, &options).unwrap_err(),
            StatusCode::InvalidArgumentError
        );
        assert!(!index.is_open());
    }

    #[test]
    fn values_group_by_key() {
        let mut index = Index::new();
        index.open("", true, &OpenOptions::new()).unwrap();
        index.add("fruit", "orange").unwrap();
        index.add("fruit", "apple").unwrap();
        index.add("fruit", "apple").unwrap();
        index.add("fruits", "none").unwrap();
        index.add("fru", "it").unwrap();
        assert_eq!(4, index.count().unwrap());
        assert_eq!(
            vec![b"apple".to_vec(), b"orange".to_vec()],
            index.get_values("fruit", 0).unwrap()
        );
        assert_eq!(1, index.get_values("fruit", 1).unwrap().len());
        assert!(index.get_values("veg", 0).unwrap().is_empty());
        assert!(index.contains("fru", "it").unwrap());
        index.remove("fru", "it").unwrap();
        assert_eq!(
            index.remove("fru", "it").unwrap_err(),
            StatusCode::NotFoundError
        );

        let mut iter = index.make_iterator();
        iter.last().unwrap();
        assert_eq!((b"fruits".to_vec(), b"none".to_vec()), iter.get().unwrap());
        iter.jump("fruit", "b").unwrap();
        assert_eq!((b"fruit".to_vec(), b"orange".to_vec()), iter.get().unwrap());
    }
}
