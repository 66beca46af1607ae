//! Cursors over the records of a [`Dbm`].
//!
//! Ordered engines walk keys in comparator order, merging shards as they go. Unordered
//! engines walk bucket by bucket, so the order is arbitrary but every record present for
//! the whole walk is visited once. Records added or removed by other threads during a walk
//! may be missed or seen, never torn.

use std::cmp::Ordering;
use std::mem;

use crate::dbm::Dbm;
use crate::engines::{AnyEngine, Locate, RecordAction};
use crate::{Result, Status, StatusCode};

enum Cursor {
    Unpositioned,
    Exhausted,
    Ordered(Vec<u8>),
    Bucket {
        shard: usize,
        bucket: u64,
        keys: Vec<Vec<u8>>,
        index: usize,
    },
}

/// Stateful cursor created by [`Dbm::make_iterator`].
///
/// A new cursor is unpositioned: getters fail with NOT_FOUND_ERROR and moves with
/// PRECONDITION_ERROR until [`first`](DbmIterator::first), [`last`](DbmIterator::last) or a
/// jump positions it. Moving past either end leaves it exhausted, which behaves the same.
pub struct DbmIterator<'a> {
    dbm: &'a Dbm,
    cursor: Cursor,
}

fn exists(engine: &AnyEngine, key: &[u8]) -> Result<bool> {
    let mut found = false;
    engine.as_engine().process(
        key,
        &mut |_, value| {
            found = value.is_some();
            RecordAction::Noop
        },
        false,
    )?;
    Ok(found)
}

/// First non-empty bucket at or after `bucket` of `shard`, moving on to later shards.
fn seek_bucket(shards: &[AnyEngine], mut shard: usize, mut bucket: u64) -> Result<Cursor> {
    while shard < shards.len() {
        if let Some((found, keys)) = shards[shard].as_engine().bucket_keys(bucket)? {
            return Ok(Cursor::Bucket {
                shard,
                bucket: found,
                keys,
                index: 0,
            });
        }
        shard += 1;
        bucket = 0;
    }
    Ok(Cursor::Exhausted)
}

/// The first key from `index` on that still exists, else the next bucket.
fn settle_bucket(
    shards: &[AnyEngine],
    shard: usize,
    bucket: u64,
    keys: Vec<Vec<u8>>,
    mut index: usize,
) -> Result<Cursor> {
    while index < keys.len() {
        if exists(&shards[shard], &keys[index])? {
            return Ok(Cursor::Bucket {
                shard,
                bucket,
                keys,
                index,
            });
        }
        index += 1;
    }
    seek_bucket(shards, shard, bucket + 1)
}

impl<'a> DbmIterator<'a> {
    pub(crate) fn new(dbm: &'a Dbm) -> DbmIterator<'a> {
        DbmIterator {
            dbm,
            cursor: Cursor::Unpositioned,
        }
    }

    fn require_ordered(&self) -> Result<()> {
        if self.dbm.is_ordered() {
            Ok(())
        } else {
            Err(Status::not_implemented("unordered database"))
        }
    }

    /// Asks every shard and keeps the smallest answer, or the largest when `!forward`.
    fn locate(&self, target: Locate<'_>, forward: bool) -> Result<Cursor> {
        let best = self.dbm.with_shards(|shards| {
            let mut best: Option<Vec<u8>> = None;
            for engine in shards {
                let engine = engine.as_engine();
                let Some(key) = engine.locate(target)? else {
                    continue;
                };
                let wanted = if forward {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                if best
                    .as_ref()
                    .is_none_or(|best| engine.comparator().compare(&key, best) == wanted)
                {
                    best = Some(key);
                }
            }
            Ok(best)
        })?;
        Ok(best.map_or(Cursor::Exhausted, Cursor::Ordered))
    }

    /// Whether the cursor points at a record.
    pub fn is_positioned(&self) -> bool {
        matches!(self.cursor, Cursor::Ordered(_) | Cursor::Bucket { .. })
    }

    fn key(&self) -> Result<&[u8]> {
        match &self.cursor {
            Cursor::Ordered(key) => Ok(key),
            Cursor::Bucket { keys, index, .. } => Ok(&keys[*index]),
            _ => Err(Status::not_found("cursor is not positioned")),
        }
    }

    /// Positions at the first record. An empty database leaves the cursor exhausted.
    pub fn first(&mut self) -> Result<()> {
        self.cursor = if self.dbm.is_ordered() {
            self.locate(Locate::First, true)?
        } else {
            self.dbm.with_shards(|shards| seek_bucket(shards, 0, 0))?
        };
        Ok(())
    }

    /// Positions at the last record. Ordered engines only.
    pub fn last(&mut self) -> Result<()> {
        self.require_ordered()?;
        self.cursor = self.locate(Locate::Last, false)?;
        Ok(())
    }

    /// Positions at `key`, or on ordered engines at the first key after it.
    ///
    /// Unordered engines fail with NOT_FOUND_ERROR unless the key exists, leaving the cursor
    /// where it was.
    pub fn jump(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        if self.dbm.is_ordered() {
            self.cursor = self.locate(Locate::Ge(key), true)?;
            return Ok(());
        }
        let shard = self.dbm.shard_index(key);
        self.cursor = self.dbm.with_shards(|shards| {
            let engine = &shards[shard];
            if !exists(engine, key)? {
                return Err(Status::not_found("no such record"));
            }
            let bucket = engine.as_engine().bucket_index(key);
            if let Some((found, keys)) = engine.as_engine().bucket_keys(bucket)? {
                if let Some(index) = keys.iter().position(|candidate| candidate == key) {
                    return Ok(Cursor::Bucket {
                        shard,
                        bucket: found,
                        keys,
                        index,
                    });
                }
            }
            Ok(Cursor::Bucket {
                shard,
                bucket,
                keys: vec![key.to_vec()],
                index: 0,
            })
        })?;
        Ok(())
    }

    /// Positions at the last key before `key`, or at `key` itself if `inclusive`.
    /// Ordered engines only.
    pub fn jump_lower(&mut self, key: impl AsRef<[u8]>, inclusive: bool) -> Result<()> {
        self.require_ordered()?;
        let key = key.as_ref();
        let target = if inclusive {
            Locate::Le(key)
        } else {
            Locate::Lt(key)
        };
        self.cursor = self.locate(target, false)?;
        Ok(())
    }

    /// Positions at the first key after `key`, or at `key` itself if `inclusive`.
    /// Ordered engines only.
    pub fn jump_upper(&mut self, key: impl AsRef<[u8]>, inclusive: bool) -> Result<()> {
        self.require_ordered()?;
        let key = key.as_ref();
        let target = if inclusive {
            Locate::Ge(key)
        } else {
            Locate::Gt(key)
        };
        self.cursor = self.locate(target, true)?;
        Ok(())
    }

    /// Moves to the following record.
    pub fn next(&mut self) -> Result<()> {
        match mem::replace(&mut self.cursor, Cursor::Unpositioned) {
            Cursor::Ordered(key) => {
                self.cursor = self.locate(Locate::Gt(&key), true)?;
            }
            Cursor::Bucket {
                shard,
                bucket,
                keys,
                index,
            } => {
                self.cursor = self
                    .dbm
                    .with_shards(|shards| settle_bucket(shards, shard, bucket, keys, index + 1))?;
            }
            other => {
                self.cursor = other;
                return Err(Status::precondition("cursor is not positioned"));
            }
        }
        Ok(())
    }

    /// Moves to the preceding record. Ordered engines only.
    pub fn previous(&mut self) -> Result<()> {
        self.require_ordered()?;
        let Cursor::Ordered(key) = &self.cursor else {
            return Err(Status::precondition("cursor is not positioned"));
        };
        self.cursor = self.locate(Locate::Lt(key), false)?;
        Ok(())
    }

    /// Gets the key and value of the current record.
    pub fn get(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key()?;
        let value = self.dbm.get(key)?;
        Ok((key.to_vec(), value))
    }

    /// Gets the key of the current record.
    pub fn get_key(&self) -> Result<Vec<u8>> {
        self.key().map(<[u8]>::to_vec)
    }

    /// Gets the value of the current record.
    pub fn get_value(&self) -> Result<Vec<u8>> {
        self.dbm.get(self.key()?)
    }

    /// Replaces the value of the current record. The cursor stays where it is.
    pub fn set(&mut self, value: impl AsRef<[u8]>) -> Result<()> {
        let value = value.as_ref();
        let mut found = false;
        self.dbm.process(
            self.key()?,
            |_, current| {
                found = current.is_some();
                if found {
                    RecordAction::Set(value.to_vec())
                } else {
                    RecordAction::Noop
                }
            },
            true,
        )?;
        if !found {
            return Err(Status::not_found("no such record"));
        }
        Ok(())
    }

    /// Removes the current record and moves to the following one.
    pub fn remove(&mut self) -> Result<()> {
        let mut found = false;
        self.dbm.process(
            self.key()?,
            |_, current| {
                found = current.is_some();
                RecordAction::Remove
            },
            true,
        )?;
        match mem::replace(&mut self.cursor, Cursor::Unpositioned) {
            Cursor::Ordered(key) => {
                self.cursor = self.locate(Locate::Gt(&key), true)?;
            }
            Cursor::Bucket {
                shard,
                bucket,
                mut keys,
                index,
            } => {
                keys.remove(index);
                self.cursor = self
                    .dbm
                    .with_shards(|shards| settle_bucket(shards, shard, bucket, keys, index))?;
            }
            other => self.cursor = other,
        }
        if !found {
            return Err(Status::not_found("no such record"));
        }
        Ok(())
    }

    /// Gets the current record, then moves to the following one.
    pub fn step(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let record = self.get()?;
        self.next()?;
        Ok(record)
    }
}

/// Forward walk over all records, returned by iterating over `&Dbm`.
///
/// Records that vanish while the walk passes them are skipped.
pub struct Records<'a> {
    iter: DbmIterator<'a>,
    started: bool,
    done: bool,
}

impl<'a> Records<'a> {
    pub(crate) fn new(iter: DbmIterator<'a>) -> Records<'a> {
        Records {
            iter,
            started: false,
            done: false,
        }
    }

    fn fail(&mut self, err: Status) -> Option<Result<(Vec<u8>, Vec<u8>)>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for Records<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(err) = self.iter.first() {
                return self.fail(err);
            }
        }
        while self.iter.is_positioned() {
            match self.iter.get() {
                Ok(record) => {
                    if let Err(err) = self.iter.next() {
                        return self.fail(err);
                    }
                    return Some(Ok(record));
                }
                Err(err) if err.code() == StatusCode::NotFoundError => {
                    if let Err(err) = self.iter.next() {
                        return self.fail(err);
                    }
                }
                Err(err) => return self.fail(err),
            }
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpenOptions;

    fn filled(params: &[(&str, &str)], count: usize) -> Dbm {
        let mut dbm = Dbm::new();
        let options = OpenOptions::from_params(params.iter().copied()).unwrap();
        dbm.open("", true, &options).unwrap();
        for i in 0..count {
            dbm.set(format!("{:08}", i), format!("{}", i), true).unwrap();
        }
        dbm
    }

    #[test]
    fn unpositioned_is_not_exhausted() {
        let dbm = filled(&[("dbm", "tiny")], 3);
        let mut iter = dbm.make_iterator();
        assert_eq!(iter.get().unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(iter.next().unwrap_err(), StatusCode::PreconditionError);
        assert_eq!(iter.last().unwrap_err(), StatusCode::NotImplementedError);
        iter.first().unwrap();
        assert!(iter.is_positioned());
        for _ in 0..3 {
            iter.step().unwrap();
        }
        assert!(!iter.is_positioned());
        assert_eq!(iter.get_key().unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(iter.next().unwrap_err(), StatusCode::PreconditionError);
    }

    #[test]
    fn unordered_jump_needs_an_exact_key() {
        let dbm = filled(&[("dbm", "tiny"), ("num_buckets", "7")], 20);
        let mut iter = dbm.make_iterator();
        iter.jump("00000011").unwrap();
        assert_eq!(b"11".to_vec(), iter.get_value().unwrap());
        assert_eq!(iter.jump("nope").unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(b"00000011".to_vec(), iter.get_key().unwrap());
    }

    #[test]
    fn sharded_ordered_walk_merges_shards() {
        let dbm = filled(&[("dbm", "baby"), ("num_shards", "3")], 30);
        let mut iter = dbm.make_iterator();
        iter.last().unwrap();
        let mut keys = Vec::new();
        while iter.is_positioned() {
            keys.push(iter.get_key().unwrap());
            iter.previous().unwrap();
        }
        let expected: Vec<Vec<u8>> = (0..30).rev().map(|i| format!("{:08}", i).into_bytes()).collect();
        assert_eq!(expected, keys);

        iter.jump_lower("00000015", false).unwrap();
        assert_eq!(b"00000014".to_vec(), iter.get_key().unwrap());
        iter.jump_upper("00000015", false).unwrap();
        assert_eq!(b"00000016".to_vec(), iter.get_key().unwrap());
        iter.jump_upper("00000099", true).unwrap();
        assert!(!iter.is_positioned());
    }

    #[test]
    fn remove_moves_to_the_following_record() {
        for dbm_name in ["tiny", "baby"] {
            let dbm = filled(&[("dbm", dbm_name)], 10);
            let mut iter = dbm.make_iterator();
            iter.first().unwrap();
            let mut removed = 0;
            while iter.is_positioned() {
                iter.remove().unwrap();
                removed += 1;
            }
            assert_eq!(10, removed);
            assert_eq!(0, dbm.count().unwrap());
        }
    }

    #[test]
    fn records_visit_everything_once() {
        let dbm = filled(&[("dbm", "tiny"), ("num_shards", "4")], 50);
        let mut keys: Vec<Vec<u8>> = (&dbm).into_iter().map(|r| r.unwrap().0).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(50, keys.len());
    }
}
