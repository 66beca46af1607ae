//! File skip list.
//!
//! ```text
//! [metadata: 256 bytes] [records in ascending key order]
//! record: [level: u8] [pointers: level x offset_width] [key len varint] [value len varint]
//!         [key] [value]
//! ```
//!
//! Record `i` carries `k` pointers, `k` being the largest value not above `max_level` such
//! that `step_unit^k` divides `i`. Pointer `l` addresses record `i + step_unit^(l+1)`, or is
//! zero past the end. The file is only written whole: updates collect in a sort area that
//! reads see on top of the file, and a merge writes a fresh file from both.

use std::cmp::Ordering as KeyOrdering;
use std::fs;
use std::iter::Peekable;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use skiplist::SkipMap;

use super::{Engine, Locate, Processor, RecordAction, Reducer, RestoreReport};
use crate::file::{File, FileOpenFlags};
use crate::lru::LruMap;
use crate::options::{OpenOptions, SyncOptions};
use crate::util::{decode_varint, encode_varint, read_fixed, sibling_path, wall_time, write_fixed};
use crate::{Result, Status};

const META_SIZE: u64 = 256;
const SKIP_MAGIC: [u8; 8] = *b"PDBMSKIP";
const FORMAT_VERSION: u32 = 1;
const WRITE_BUFFER_SIZE: usize = 1 << 16;
const DEFAULT_SORT_MEM_SIZE: u64 = 256 << 20;
const DEFAULT_MAX_CACHED_RECORDS: u32 = 65_536;
/// Bookkeeping charged per pending update on top of its key and value.
const PENDING_OVERHEAD: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SkipParams {
    offset_width: u32,
    step_unit: u32,
    max_level: u32,
}

const SKIP_DEFAULTS: SkipParams = SkipParams {
    offset_width: 4,
    step_unit: 4,
    max_level: 14,
};

impl SkipParams {
    fn overlay(&self, options: &OpenOptions) -> Result<SkipParams> {
        let params = SkipParams {
            offset_width: options.offset_width.unwrap_or(self.offset_width),
            step_unit: options.step_unit.unwrap_or(self.step_unit),
            max_level: options.max_level.unwrap_or(self.max_level),
        };
        params.validate()
    }

    fn validate(self) -> Result<SkipParams> {
        if !(3..=8).contains(&self.offset_width) {
            return Err(Status::invalid_argument("offset_width must be within 3..=8"));
        }
        if self.step_unit < 2 {
            return Err(Status::invalid_argument("step_unit must be at least 2"));
        }
        if !(1..=64).contains(&self.max_level) {
            return Err(Status::invalid_argument("max_level must be within 1..=64"));
        }
        Ok(self)
    }

    fn level_of(&self, index: u64) -> u32 {
        let step = self.step_unit as u64;
        let mut level = 0;
        let mut unit = step;
        while level < self.max_level && index % unit == 0 {
            level += 1;
            unit = unit.saturating_mul(step);
        }
        level
    }

    fn max_offset(&self) -> u64 {
        match self.offset_width {
            8 => u64::MAX,
            width => (1u64 << (8 * width)) - 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkipMeta {
    magic: [u8; 8],
    version: u32,
    offset_width: u32,
    step_unit: u32,
    max_level: u32,
    num_records: u64,
    end_offset: u64,
    timestamp: f64,
}

impl SkipMeta {
    fn params(&self) -> Result<SkipParams> {
        let params = SkipParams {
            offset_width: self.offset_width,
            step_unit: self.step_unit,
            max_level: self.max_level,
        };
        params
            .validate()
            .map_err(|err| Status::broken_data(format!("invalid skip metadata: {}", err)))
    }
}

fn read_meta(file: &File) -> Result<SkipMeta> {
    if file.size() < META_SIZE {
        return Err(Status::broken_data(format!(
            "{}: too short for a skip database",
            file.path().display()
        )));
    }
    let head = file.read(0, META_SIZE as usize)?;
    let len = read_fixed(&head[..4]) as usize;
    let body = head
        .get(4..4 + len)
        .ok_or_else(|| Status::broken_data("invalid metadata length"))?;
    let meta: SkipMeta = bincode::deserialize(body)?;
    if meta.magic != SKIP_MAGIC {
        return Err(Status::broken_data(format!(
            "{}: not a skip database",
            file.path().display()
        )));
    }
    if meta.version > FORMAT_VERSION {
        return Err(Status::broken_data(format!("unsupported version {}", meta.version)));
    }
    Ok(meta)
}

fn write_meta(file: &File, meta: &SkipMeta) -> Result<()> {
    let body = bincode::serialize(meta)?;
    let mut block = Vec::with_capacity(META_SIZE as usize);
    write_fixed(&mut block, body.len() as u64, 4);
    block.extend_from_slice(&body);
    block.resize(META_SIZE as usize, 0);
    file.write_at(0, &block)
}

#[derive(Debug)]
struct SkipRecord {
    offset: u64,
    size: u64,
    pointers: Vec<u64>,
    key: Vec<u8>,
    value: Vec<u8>,
}

fn read_record_at(file: &File, params: &SkipParams, offset: u64, end: u64) -> Result<SkipRecord> {
    let width = params.offset_width as usize;
    let head = file.read_some(offset, 1 + params.max_level as usize * width + 64)?;
    let level = *head
        .first()
        .ok_or_else(|| Status::broken_data("truncated skip record"))? as usize;
    if level > params.max_level as usize {
        return Err(Status::broken_data(format!("invalid record level at {}", offset)));
    }
    let mut pos = 1 + level * width;
    let pointers = head
        .get(1..pos)
        .ok_or_else(|| Status::broken_data("truncated skip record"))?
        .chunks(width)
        .map(read_fixed)
        .collect();
    let (key_len, used) = decode_varint(head.get(pos..).unwrap_or_default())?;
    pos += used;
    let (value_len, used) = decode_varint(head.get(pos..).unwrap_or_default())?;
    pos += used;
    let size = (pos as u64)
        .checked_add(key_len)
        .and_then(|size| size.checked_add(value_len))
        .filter(|size| offset.checked_add(*size).is_some_and(|stop| stop <= end))
        .ok_or_else(|| Status::broken_data(format!("record at {} exceeds the file", offset)))?;
    let body = if size as usize <= head.len() {
        head
    } else {
        file.read(offset, size as usize)?
    };
    let key_end = pos + key_len as usize;
    Ok(SkipRecord {
        offset,
        size,
        pointers,
        key: body[pos..key_end].to_vec(),
        value: body[key_end..size as usize].to_vec(),
    })
}

/// A complete skip list file.
struct SkipFile {
    file: File,
    params: SkipParams,
    num_records: u64,
    end_offset: u64,
    cache: Mutex<LruMap<u64, Arc<SkipRecord>>>,
    cache_capacity: usize,
}

impl SkipFile {
    fn load(file: File, cache_capacity: usize) -> Result<SkipFile> {
        let meta = read_meta(&file)?;
        if meta.end_offset > file.size() || meta.end_offset < META_SIZE {
            return Err(Status::broken_data(format!(
                "{}: record section is truncated",
                file.path().display()
            )));
        }
        Ok(SkipFile {
            params: meta.params()?,
            num_records: meta.num_records,
            end_offset: meta.end_offset,
            file,
            cache: Mutex::new(LruMap::new()),
            cache_capacity,
        })
    }

    fn read(&self, offset: u64) -> Result<Arc<SkipRecord>> {
        if let Some(record) = self.cache.lock().get(&offset) {
            return Ok(Arc::clone(record));
        }
        let record = Arc::new(read_record_at(&self.file, &self.params, offset, self.end_offset)?);
        if self.cache_capacity > 0 {
            let mut cache = self.cache.lock();
            cache.insert(offset, Arc::clone(&record));
            while cache.len() > self.cache_capacity {
                cache.pop_lru();
            }
        }
        Ok(record)
    }

    fn first(&self) -> Result<Option<Arc<SkipRecord>>> {
        if self.num_records == 0 {
            return Ok(None);
        }
        self.read(META_SIZE).map(Some)
    }

    fn next(&self, record: &SkipRecord) -> Result<Option<Arc<SkipRecord>>> {
        let offset = record.offset + record.size;
        if offset >= self.end_offset {
            return Ok(None);
        }
        self.read(offset).map(Some)
    }

    /// The last record whose key satisfies `pred`, which must hold for a prefix of the keys.
    fn last_where(&self, pred: &dyn Fn(&[u8]) -> bool) -> Result<Option<Arc<SkipRecord>>> {
        let Some(mut current) = self.first()? else {
            return Ok(None);
        };
        if !pred(&current.key) {
            return Ok(None);
        }
        for level in (0..current.pointers.len()).rev() {
            while let Some(&target) = current.pointers.get(level) {
                if target == 0 {
                    break;
                }
                let candidate = self.read(target)?;
                if !pred(&candidate.key) {
                    break;
                }
                current = candidate;
            }
        }
        while let Some(next) = self.next(&current)? {
            if !pred(&next.key) {
                break;
            }
            current = next;
        }
        Ok(Some(current))
    }

    fn after(&self, found: Option<Arc<SkipRecord>>) -> Result<Option<Arc<SkipRecord>>> {
        match found {
            Some(record) => self.next(&record),
            None => self.first(),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Arc<SkipRecord>>> {
        Ok(self
            .last_where(&|probe| probe <= key)?
            .filter(|record| record.key == key))
    }

    fn locate(&self, target: Locate<'_>) -> Result<Option<Arc<SkipRecord>>> {
        match target {
            Locate::First => self.first(),
            Locate::Last => self.last_where(&|_| true),
            Locate::Ge(key) => self.after(self.last_where(&|probe| probe < key)?),
            Locate::Gt(key) => self.after(self.last_where(&|probe| probe <= key)?),
            Locate::Le(key) => self.last_where(&|probe| probe <= key),
            Locate::Lt(key) => self.last_where(&|probe| probe < key),
        }
    }

    fn scan(&self) -> Scan<'_> {
        Scan {
            source: self,
            offset: META_SIZE,
            failed: false,
        }
    }
}

type RecordStream<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Sequential read of a skip file, bypassing the record cache.
struct Scan<'a> {
    source: &'a SkipFile,
    offset: u64,
    failed: bool,
}

impl Iterator for Scan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.source.end_offset {
            return None;
        }
        let source = self.source;
        match read_record_at(&source.file, &source.params, self.offset, source.end_offset) {
            Ok(record) => {
                self.offset += record.size;
                Some(Ok((record.key, record.value)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

type PendingEntry = (Vec<u8>, Option<Vec<u8>>);

/// File records with pending updates applied.
struct Overlay<'a> {
    file: Peekable<Scan<'a>>,
    pending: Peekable<std::vec::IntoIter<PendingEntry>>,
}

impl<'a> Overlay<'a> {
    fn new(file: Scan<'a>, pending: Vec<PendingEntry>) -> Overlay<'a> {
        Overlay {
            file: file.peekable(),
            pending: pending.into_iter().peekable(),
        }
    }
}

impl Iterator for Overlay<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let order = match (self.file.peek(), self.pending.peek()) {
                (None, None) => return None,
                (Some(Ok((file_key, _))), Some((pending_key, _))) => file_key.cmp(pending_key),
                (Some(_), _) => KeyOrdering::Less,
                (None, Some(_)) => KeyOrdering::Greater,
            };
            if order == KeyOrdering::Less {
                return self.file.next();
            }
            if order == KeyOrdering::Equal {
                self.file.next();
            }
            if let Some((key, Some(value))) = self.pending.next() {
                return Some(Ok((key, value)));
            }
        }
    }
}

enum SortArea {
    Sorted(SkipMap<Vec<u8>, Option<Vec<u8>>>),
    /// Filled in ascending key order only.
    InOrder(Vec<PendingEntry>),
}

/// Updates not yet merged into the file; `None` marks a removal.
struct PendingUpdates {
    area: SortArea,
    mem_size: u64,
}

fn entry_cost(key: &[u8], value: &Option<Vec<u8>>) -> u64 {
    (key.len() + value.as_ref().map_or(0, Vec::len)) as u64 + PENDING_OVERHEAD
}

impl PendingUpdates {
    fn new(in_order: bool) -> PendingUpdates {
        let area = if in_order {
            SortArea::InOrder(Vec::new())
        } else {
            SortArea::Sorted(SkipMap::new())
        };
        PendingUpdates { area, mem_size: 0 }
    }

    fn len(&self) -> usize {
        match &self.area {
            SortArea::Sorted(map) => map.len(),
            SortArea::InOrder(entries) => entries.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Some(None)` when the key is pending removal, `None` when it has no pending update.
    fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        match &self.area {
            SortArea::Sorted(map) => map.get(key).map(|value| value.as_deref()),
            SortArea::InOrder(entries) => entries
                .binary_search_by(|(probe, _)| probe.as_slice().cmp(key))
                .ok()
                .map(|i| entries[i].1.as_deref()),
        }
    }

    fn put(&mut self, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        let added = entry_cost(key, &value);
        let released = match &mut self.area {
            SortArea::Sorted(map) => map
                .insert(key.to_vec(), value)
                .map(|old| entry_cost(key, &old)),
            SortArea::InOrder(entries) => {
                let last_order = entries.last().map(|(last, _)| last.as_slice().cmp(key));
                match last_order {
                    Some(KeyOrdering::Greater) => {
                        return Err(Status::invalid_argument(
                            "keys must be inserted in ascending order",
                        ));
                    }
                    Some(KeyOrdering::Equal) => entries
                        .last_mut()
                        .map(|(_, slot)| entry_cost(key, &std::mem::replace(slot, value))),
                    _ => {
                        entries.push((key.to_vec(), value));
                        None
                    }
                }
            }
        };
        self.mem_size = self.mem_size + added - released.unwrap_or(0);
        Ok(())
    }

    /// The nearest key with a pending value in the direction of `target`.
    fn locate(&self, target: Locate<'_>) -> Option<Vec<u8>> {
        let (lower, upper, forward) = match target {
            Locate::First => (Bound::Unbounded, Bound::Unbounded, true),
            Locate::Last => (Bound::Unbounded, Bound::Unbounded, false),
            Locate::Ge(key) => (Bound::Included(key), Bound::Unbounded, true),
            Locate::Gt(key) => (Bound::Excluded(key), Bound::Unbounded, true),
            Locate::Le(key) => (Bound::Unbounded, Bound::Included(key), false),
            Locate::Lt(key) => (Bound::Unbounded, Bound::Excluded(key), false),
        };
        match &self.area {
            SortArea::Sorted(map) => {
                let to_owned = |bound: Bound<&[u8]>| match bound {
                    Bound::Included(key) => Bound::Included(key.to_vec()),
                    Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
                    Bound::Unbounded => Bound::Unbounded,
                };
                let (lower, upper) = (to_owned(lower), to_owned(upper));
                let mut range = map.range(lower.as_ref(), upper.as_ref());
                let found = if forward {
                    range.find(|(_, value)| value.is_some())
                } else {
                    range.rev().find(|(_, value)| value.is_some())
                };
                found.map(|(key, _)| key.clone())
            }
            SortArea::InOrder(entries) => {
                let start = match lower {
                    Bound::Unbounded => 0,
                    Bound::Included(key) => entries.partition_point(|(probe, _)| probe.as_slice() < key),
                    Bound::Excluded(key) => entries.partition_point(|(probe, _)| probe.as_slice() <= key),
                };
                let end = match upper {
                    Bound::Unbounded => entries.len(),
                    Bound::Included(key) => entries.partition_point(|(probe, _)| probe.as_slice() <= key),
                    Bound::Excluded(key) => entries.partition_point(|(probe, _)| probe.as_slice() < key),
                };
                let window = entries.get(start..end.max(start)).unwrap_or_default();
                let found = if forward {
                    window.iter().find(|(_, value)| value.is_some())
                } else {
                    window.iter().rev().find(|(_, value)| value.is_some())
                };
                found.map(|(key, _)| key.clone())
            }
        }
    }

    fn snapshot(&self) -> Vec<PendingEntry> {
        match &self.area {
            SortArea::Sorted(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            SortArea::InOrder(entries) => entries.clone(),
        }
    }

    fn clear(&mut self) {
        match &mut self.area {
            SortArea::Sorted(map) => map.clear(),
            SortArea::InOrder(entries) => entries.clear(),
        }
        self.mem_size = 0;
    }
}

/// Writes records in ascending order and links their pointers as it goes.
struct SkipWriter {
    file: File,
    params: SkipParams,
    /// Position of the pointer still waiting for its target, per level.
    pending_links: Vec<Option<u64>>,
    buffer: Vec<u8>,
    buffer_base: u64,
    num_records: u64,
    last_key: Option<Vec<u8>>,
}

impl SkipWriter {
    fn create(path: &Path, params: SkipParams) -> Result<SkipWriter> {
        let flags = FileOpenFlags {
            truncate: true,
            no_create: false,
        };
        let file = File::open(path, true, flags)?;
        file.truncate(META_SIZE)?;
        Ok(SkipWriter {
            file,
            params,
            pending_links: vec![None; params.max_level as usize],
            buffer: Vec::with_capacity(WRITE_BUFFER_SIZE),
            buffer_base: META_SIZE,
            num_records: 0,
            last_key: None,
        })
    }

    fn accepts(&self, key: &[u8]) -> bool {
        self.last_key.as_deref().is_none_or(|last| last < key)
    }

    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.accepts(key) {
            return Err(Status::invalid_argument("skip records must be added in ascending order"));
        }
        let offset = self.buffer_base + self.buffer.len() as u64;
        if offset > self.params.max_offset() {
            return Err(Status::infeasible("file size exceeds the offset width"));
        }
        let width = self.params.offset_width as usize;
        let level = self.params.level_of(self.num_records) as usize;
        for l in 0..level {
            if let Some(position) = self.pending_links[l] {
                self.link(position, offset)?;
            }
            self.pending_links[l] = Some(offset + 1 + (l * width) as u64);
        }
        self.buffer.push(level as u8);
        self.buffer.resize(self.buffer.len() + level * width, 0);
        encode_varint(key.len() as u64, &mut self.buffer)?;
        encode_varint(value.len() as u64, &mut self.buffer)?;
        self.buffer.extend_from_slice(key);
        self.buffer.extend_from_slice(value);
        self.num_records += 1;
        self.last_key = Some(key.to_vec());
        if self.buffer.len() >= WRITE_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn link(&mut self, position: u64, target: u64) -> Result<()> {
        let width = self.params.offset_width as usize;
        let mut encoded = Vec::with_capacity(width);
        write_fixed(&mut encoded, target, width);
        if position >= self.buffer_base {
            let start = (position - self.buffer_base) as usize;
            self.buffer[start..start + width].copy_from_slice(&encoded);
            Ok(())
        } else {
            self.file.write_at(position, &encoded)
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_at(self.buffer_base, &self.buffer)?;
            self.buffer_base += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Writes the metadata and returns the number of records.
    fn finish(mut self, hard: bool) -> Result<u64> {
        self.flush()?;
        let meta = SkipMeta {
            magic: SKIP_MAGIC,
            version: FORMAT_VERSION,
            offset_width: self.params.offset_width,
            step_unit: self.params.step_unit,
            max_level: self.params.max_level,
            num_records: self.num_records,
            end_offset: self.buffer_base,
            timestamp: wall_time(),
        };
        write_meta(&self.file, &meta)?;
        self.file.synchronize(hard)?;
        Ok(self.num_records)
    }
}

/// Writes the union of sorted `sources`, reducing values of keys found in several of them.
fn merge_sources(
    writer: &mut SkipWriter,
    mut sources: Vec<Peekable<RecordStream<'_>>>,
    reducer: Reducer,
) -> Result<()> {
    loop {
        let mut smallest: Option<Vec<u8>> = None;
        for source in sources.iter_mut() {
            if let Some(Err(_)) = source.peek() {
                if let Some(Err(err)) = source.next() {
                    return Err(err);
                }
            }
            if let Some(Ok((key, _))) = source.peek() {
                if smallest.as_ref().is_none_or(|current| key < current) {
                    smallest = Some(key.clone());
                }
            }
        }
        let Some(key) = smallest else {
            return Ok(());
        };
        let mut values = Vec::new();
        for source in sources.iter_mut() {
            if let Some(Ok((probe, _))) = source.peek() {
                if *probe == key {
                    if let Some(Ok((_, value))) = source.next() {
                        values.push(value);
                    }
                }
            }
        }
        let value = if values.len() == 1 {
            values.swap_remove(0)
        } else {
            reducer.reduce(values)
        };
        writer.add(&key, &value)?;
    }
}

/// File skip list engine.
pub(crate) struct SkipEngine {
    path: PathBuf,
    state: RwLock<SkipFile>,
    pending: Mutex<PendingUpdates>,
    num_records: AtomicU64,
    sort_mem_size: u64,
    cache_capacity: usize,
    writable: bool,
    closed: AtomicBool,
    sync_hard: bool,
    timestamp: AtomicU64,
}

impl SkipEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<SkipEngine> {
        if path.as_os_str().is_empty() {
            return Err(Status::invalid_argument("a skip database needs a file path"));
        }
        let flags = FileOpenFlags {
            truncate: options.truncate,
            no_create: options.no_create,
        };
        let mut file = File::open(path, writable, flags)?;
        if file.size() == 0 {
            if !writable {
                return Err(Status::broken_data(format!("{}: empty file", path.display())));
            }
            drop(file);
            SkipWriter::create(path, SKIP_DEFAULTS.overlay(options)?)?.finish(false)?;
            file = File::open(path, true, FileOpenFlags::default())?;
        }
        let cache_capacity = options
            .max_cached_records
            .unwrap_or(DEFAULT_MAX_CACHED_RECORDS) as usize;
        let state = SkipFile::load(file, cache_capacity)?;
        info!(
            "opened skip database {} ({} records)",
            path.display(),
            state.num_records
        );
        Ok(SkipEngine {
            path: path.to_path_buf(),
            num_records: AtomicU64::new(state.num_records),
            state: RwLock::new(state),
            pending: Mutex::new(PendingUpdates::new(options.insert_in_order.unwrap_or(false))),
            sort_mem_size: options.sort_mem_size.unwrap_or(DEFAULT_SORT_MEM_SIZE),
            cache_capacity,
            writable,
            closed: AtomicBool::new(false),
            sync_hard: options.sync_hard,
            timestamp: AtomicU64::new(wall_time().to_bits()),
        })
    }

    /// Copies the readable prefix of `old_path` into a new skip file at `new_path`.
    ///
    /// Records out of key order are discarded; the scan stops at the first unreadable record.
    pub(crate) fn restore(old_path: &Path, new_path: &Path, end_offset: i64) -> Result<RestoreReport> {
        let old = File::open(old_path, false, FileOpenFlags::default())?;
        let meta = read_meta(&old)?;
        let params = meta.params()?;
        let end = match end_offset {
            offset if offset < 0 => old.size(),
            0 => meta.end_offset.min(old.size()),
            offset => (offset as u64).min(old.size()),
        };
        let mut writer = SkipWriter::create(new_path, params)?;
        let mut report = RestoreReport::default();
        let mut offset = META_SIZE;
        while offset < end {
            match read_record_at(&old, &params, offset, end) {
                Ok(record) => {
                    offset += record.size;
                    if writer.accepts(&record.key) {
                        writer.add(&record.key, &record.value)?;
                        report.restored += 1;
                    } else {
                        report.discarded += 1;
                    }
                }
                Err(err) => {
                    warn!("stopped restoring {} at {}: {}", old_path.display(), offset, err);
                    report.discarded += 1;
                    break;
                }
            }
        }
        writer.finish(true)?;
        info!(
            "restored {} records from {} ({} discarded)",
            report.restored,
            old_path.display(),
            report.discarded
        );
        Ok(report)
    }

    fn check(&self, writable: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::precondition("closed database"));
        }
        if writable && !self.writable {
            return Err(Status::precondition("not writable database"));
        }
        Ok(())
    }

    fn touch(&self) {
        self.timestamp.store(wall_time().to_bits(), Ordering::Relaxed);
    }

    /// Writes `fill` into a temporary file, moves it over the database and loads it.
    fn rewrite(
        &self,
        params: SkipParams,
        hard: bool,
        fill: impl FnOnce(&mut SkipWriter) -> Result<()>,
    ) -> Result<(SkipFile, u64)> {
        let tmp = sibling_path(&self.path, ".tmp.merge");
        let written = (|| -> Result<u64> {
            let mut writer = SkipWriter::create(&tmp, params)?;
            fill(&mut writer)?;
            writer.finish(hard)
        })();
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        fs::rename(&tmp, &self.path)?;
        let file = File::open(&self.path, self.writable, FileOpenFlags::default())?;
        Ok((SkipFile::load(file, self.cache_capacity)?, written))
    }

    /// Merges pending updates and the files at `others` into a fresh file.
    fn merge_locked(
        &self,
        state: &mut SkipFile,
        pending: &mut PendingUpdates,
        params: SkipParams,
        others: &[PathBuf],
        reducer: Reducer,
        hard: bool,
    ) -> Result<()> {
        let others = others
            .iter()
            .map(|path| SkipFile::load(File::open(path, false, FileOpenFlags::default())?, 0))
            .collect::<Result<Vec<_>>>()?;
        let snapshot = pending.snapshot();
        let num_pending = snapshot.len();
        let (fresh, written) = self.rewrite(params, hard, |writer| {
            let own: RecordStream<'_> = Box::new(Overlay::new(state.scan(), snapshot));
            let mut sources = vec![own.peekable()];
            for other in &others {
                let stream: RecordStream<'_> = Box::new(other.scan());
                sources.push(stream.peekable());
            }
            merge_sources(writer, sources, reducer)
        })?;
        *state = fresh;
        pending.clear();
        self.num_records.store(written, Ordering::Release);
        debug!(
            "merged {} pending updates and {} files into {} ({} records)",
            num_pending,
            others.len(),
            self.path.display(),
            written
        );
        Ok(())
    }

    fn flush_pending(&self, hard: bool) -> Result<()> {
        let mut state = self.state.write();
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        let params = state.params;
        self.merge_locked(&mut state, &mut pending, params, &[], Reducer::Last, hard)
    }
}

impl Engine for SkipEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check(writable)?;
        let overflow = {
            let state = self.state.read();
            let mut pending = self.pending.lock();
            let stored;
            let current = match pending.get(key) {
                Some(value) => value,
                None => {
                    stored = state.get(key)?;
                    stored.as_ref().map(|record| record.value.as_slice())
                }
            };
            let existed = current.is_some();
            let action = proc(key, current);
            if !writable {
                return Ok(());
            }
            match action {
                RecordAction::Noop => return Ok(()),
                RecordAction::Set(value) => {
                    pending.put(key, Some(value))?;
                    if !existed {
                        self.num_records.fetch_add(1, Ordering::AcqRel);
                    }
                }
                RecordAction::Remove => {
                    if !existed {
                        return Ok(());
                    }
                    pending.put(key, None)?;
                    self.num_records.fetch_sub(1, Ordering::AcqRel);
                }
            }
            self.touch();
            pending.mem_size > self.sort_mem_size
        };
        if overflow {
            self.flush_pending(false)?;
        }
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check(writable)?;
        let mut state = self.state.write();
        let mut pending = self.pending.lock();
        let params = state.params;
        if writable && !pending.is_empty() {
            self.merge_locked(&mut state, &mut pending, params, &[], Reducer::Last, false)?;
        }
        let mut updates = Vec::new();
        for record in Overlay::new(state.scan(), pending.snapshot()) {
            let (key, value) = record?;
            match proc(&key, Some(value.as_slice())) {
                RecordAction::Set(new_value) if writable => updates.push((key, Some(new_value))),
                RecordAction::Remove if writable => updates.push((key, None)),
                _ => {}
            }
        }
        if updates.is_empty() {
            return Ok(());
        }
        for (key, value) in updates {
            if value.is_none() {
                self.num_records.fetch_sub(1, Ordering::AcqRel);
            }
            pending.put(&key, value)?;
        }
        self.touch();
        self.merge_locked(&mut state, &mut pending, params, &[], Reducer::Last, false)
    }

    fn count(&self) -> Result<u64> {
        self.check(false)?;
        Ok(self.num_records.load(Ordering::Acquire))
    }

    fn file_size(&self) -> Result<u64> {
        self.check(false)?;
        Ok(self.state.read().file.size())
    }

    fn file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn timestamp(&self) -> f64 {
        f64::from_bits(self.timestamp.load(Ordering::Relaxed))
    }

    fn clear(&self) -> Result<()> {
        self.check(true)?;
        let mut state = self.state.write();
        let mut pending = self.pending.lock();
        let (fresh, _) = self.rewrite(state.params, false, |_| Ok(()))?;
        *state = fresh;
        pending.clear();
        self.num_records.store(0, Ordering::Release);
        self.touch();
        Ok(())
    }

    fn rebuild(&self, options: &OpenOptions) -> Result<()> {
        self.check(true)?;
        let mut state = self.state.write();
        let mut pending = self.pending.lock();
        let params = state.params.overlay(options)?;
        self.merge_locked(&mut state, &mut pending, params, &[], Reducer::Last, false)?;
        info!(
            "rebuilt skip database {} with step {} and {} levels",
            self.path.display(),
            params.step_unit,
            params.max_level
        );
        Ok(())
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.check(false)?;
        Ok(!self.pending.lock().is_empty())
    }

    fn synchronize(&self, hard: bool, options: &SyncOptions) -> Result<()> {
        self.check(false)?;
        if !self.writable {
            if options.merge.is_empty() {
                return Ok(());
            }
            return Err(Status::precondition("not writable database"));
        }
        let hard = hard || self.sync_hard;
        let mut state = self.state.write();
        let mut pending = self.pending.lock();
        if pending.is_empty() && options.merge.is_empty() {
            return state.file.synchronize(hard);
        }
        let params = state.params;
        let reducer = options.reducer.unwrap_or_default();
        self.merge_locked(&mut state, &mut pending, params, &options.merge, reducer, hard)
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = if self.writable {
            self.flush_pending(self.sync_hard)
        } else {
            Ok(())
        };
        self.closed.store(true, Ordering::Release);
        info!("closed skip database {}", self.path.display());
        result
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let state = self.state.read();
        let pending = self.pending.lock();
        vec![
            ("class".to_string(), "SkipDBM".to_string()),
            (
                "num_records".to_string(),
                self.num_records.load(Ordering::Acquire).to_string(),
            ),
            ("num_file_records".to_string(), state.num_records.to_string()),
            ("num_pending_updates".to_string(), pending.len().to_string()),
            ("offset_width".to_string(), state.params.offset_width.to_string()),
            ("step_unit".to_string(), state.params.step_unit.to_string()),
            ("max_level".to_string(), state.params.max_level.to_string()),
            (
                "insert_in_order".to_string(),
                matches!(pending.area, SortArea::InOrder(_)).to_string(),
            ),
        ]
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    // Files are only ever replaced whole by rename, so an open file is never half-written.
    fn is_healthy(&self) -> bool {
        true
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn locate(&self, target: Locate<'_>) -> Result<Option<Vec<u8>>> {
        self.check(false)?;
        let state = self.state.read();
        let pending = self.pending.lock();
        let forward = matches!(target, Locate::First | Locate::Ge(_) | Locate::Gt(_));
        let mut removed: Option<Vec<u8>> = None;
        let from_file = loop {
            let probe = match &removed {
                None => target,
                Some(key) if forward => Locate::Gt(key),
                Some(key) => Locate::Lt(key),
            };
            match state.locate(probe)? {
                Some(record) if pending.get(&record.key) == Some(None) => {
                    removed = Some(record.key.clone());
                }
                found => break found.map(|record| record.key.clone()),
            }
        };
        let from_pending = pending.locate(target);
        Ok(match (from_file, from_pending) {
            (Some(a), Some(b)) if forward => Some(a.min(b)),
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(engine: &SkipEngine, key: &str, value: &str) {
        let value = value.as_bytes().to_vec();
        engine
            .process(key.as_bytes(), &mut |_, _| RecordAction::Set(value.clone()), true)
            .unwrap();
    }

    fn get(engine: &SkipEngine, key: &str) -> Option<String> {
        let mut found = None;
        engine
            .process(
                key.as_bytes(),
                &mut |_, value| {
                    found = value.map(|value| String::from_utf8_lossy(value).into_owned());
                    RecordAction::Noop
                },
                false,
            )
            .unwrap();
        found
    }

    fn keys_forward(engine: &SkipEngine) -> Vec<String> {
        let mut keys = Vec::new();
        let mut next = engine.locate(Locate::First).unwrap();
        while let Some(key) = next {
            next = engine.locate(Locate::Gt(&key)).unwrap();
            keys.push(String::from_utf8(key).unwrap());
        }
        keys
    }

    #[test]
    fn pending_updates_overlay_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tks");
        let engine = SkipEngine::open(&path, true, &OpenOptions::new()).unwrap();
        for key in ["c", "a", "d", "b"] {
            set(&engine, key, key);
        }
        assert_eq!(Some("a".to_string()), get(&engine, "a"));
        assert_eq!(4, engine.count().unwrap());
        engine.synchronize(false, &SyncOptions::default()).unwrap();

        engine
            .process(b"b", &mut |_, _| RecordAction::Remove, true)
            .unwrap();
        set(&engine, "bb", "x");
        assert_eq!(vec!["a", "bb", "c", "d"], keys_forward(&engine));
        assert_eq!(Some(b"c".to_vec()), engine.locate(Locate::Lt(b"ca")).unwrap());
        assert_eq!(Some(b"a".to_vec()), engine.locate(Locate::Lt(b"bb")).unwrap());
        assert_eq!(4, engine.count().unwrap());
        engine.close().unwrap();

        let engine = SkipEngine::open(&path, false, &OpenOptions::new()).unwrap();
        assert_eq!(vec!["a", "bb", "c", "d"], keys_forward(&engine));
        assert_eq!(None, get(&engine, "b"));
    }

    #[test]
    fn pointers_reach_every_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tks");
        let options =
            OpenOptions::from_params([("step_unit", "2"), ("max_level", "5")]).unwrap();
        let engine = SkipEngine::open(&path, true, &options).unwrap();
        for i in (0..300).rev() {
            set(&engine, &format!("{:05}", i * 2), &i.to_string());
        }
        engine.synchronize(false, &SyncOptions::default()).unwrap();
        for i in 0..300 {
            let key = format!("{:05}", i * 2);
            assert_eq!(Some(i.to_string()), get(&engine, &key));
            let odd = format!("{:05}", i * 2 + 1);
            let expected_ge = (i < 299).then(|| format!("{:05}", i * 2 + 2).into_bytes());
            assert_eq!(expected_ge, engine.locate(Locate::Ge(odd.as_bytes())).unwrap());
            assert_eq!(
                Some(key.clone().into_bytes()),
                engine.locate(Locate::Le(odd.as_bytes())).unwrap()
            );
        }
        assert_eq!(Some(b"00598".to_vec()), engine.locate(Locate::Last).unwrap());
    }

    #[test]
    fn merge_reduces_duplicates() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.tks");
        let second = dir.path().join("second.tks");
        let other = SkipEngine::open(&second, true, &OpenOptions::new()).unwrap();
        set(&other, "k", "later");
        set(&other, "only-second", "2");
        other.close().unwrap();

        let engine = SkipEngine::open(&first, true, &OpenOptions::new()).unwrap();
        set(&engine, "k", "earlier");
        set(&engine, "only-first", "1");
        engine.synchronize(false, &SyncOptions::default()).unwrap();
        let options = SyncOptions {
            merge: vec![second.clone()],
            reducer: Some(Reducer::Concat),
        };
        engine.synchronize(false, &options).unwrap();
        assert_eq!(Some("earlierlater".to_string()), get(&engine, "k"));
        assert_eq!(3, engine.count().unwrap());

        let options = SyncOptions {
            merge: vec![second],
            reducer: Some(Reducer::First),
        };
        engine.synchronize(false, &options).unwrap();
        assert_eq!(Some("earlierlater".to_string()), get(&engine, "k"));
        assert_eq!(Some("2".to_string()), get(&engine, "only-second"));
    }

    #[test]
    fn in_order_insertion_rejects_descending_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tks");
        let options = OpenOptions::from_params([("insert_in_order", "true")]).unwrap();
        let engine = SkipEngine::open(&path, true, &options).unwrap();
        set(&engine, "a", "1");
        set(&engine, "b", "2");
        set(&engine, "b", "3");
        let err = engine
            .process(b"a", &mut |_, _| RecordAction::Set(b"x".to_vec()), true)
            .unwrap_err();
        assert_eq!(crate::StatusCode::InvalidArgumentError, err.code());
        assert_eq!(Some("3".to_string()), get(&engine, "b"));
        assert_eq!(Some(b"a".to_vec()), engine.locate(Locate::Lt(b"b")).unwrap());
    }

    #[test]
    fn restore_keeps_readable_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tks");
        let engine = SkipEngine::open(&path, true, &OpenOptions::new()).unwrap();
        for i in 0..10 {
            set(&engine, &format!("key{}", i), "value");
        }
        engine.close().unwrap();

        let size = fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(size - 3).unwrap();
        drop(file);

        let restored = dir.path().join("restored.tks");
        let report = SkipEngine::restore(&path, &restored, -1).unwrap();
        assert_eq!(RestoreReport { restored: 9, discarded: 1 }, report);
        let engine = SkipEngine::open(&restored, false, &OpenOptions::new()).unwrap();
        assert_eq!(9, engine.count().unwrap());
        assert_eq!(Some("value".to_string()), get(&engine, "key8"));
    }
}
