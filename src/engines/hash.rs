//! File hash table.
//!
//! File layout:
//!
//! ```text
//! [metadata: 512 bytes] [bucket table: num_buckets x offset_width] [free block section]
//! [records, each aligned to 2^align_pow]
//! ```
//!
//! Each bucket holds the offset of the newest record of its chain; each record holds the
//! offset of the next one. In-place mode rewrites records where they are and recycles freed
//! slots through the free block pool. Appending mode only ever writes at the tail, so the first
//! record of a chain carrying a key is the current state of that key, and a tombstone means it
//! was removed. Superseded records stay in the file until the next rebuild.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{Engine, Processor, RecordAction, RestoreReport};
use crate::codec::{Record, RecordCodec, RecordHeader, RecordKind};
use crate::fbp::FreeBlockPool;
use crate::file::{File, FileOpenFlags};
use crate::options::{
    CompressionMode, CrcMode, OpenOptions, RestoreMode, SyncOptions, UpdateMode,
};
use crate::util::{align_up, primary_hash, read_fixed, sibling_path, wall_time, write_fixed};
use crate::{Result, Status};

const META_SIZE: u64 = 512;
const HASH_MAGIC: [u8; 8] = *b"PDBMHASH";
const FORMAT_VERSION: u32 = 1;
const NUM_BUCKET_LOCKS: u64 = 1024;
const BUCKET_BATCH: u64 = 1024;
const MIN_REBUILD_BUCKETS: u64 = 1024;

/// Tuning parameters fixed when a hash file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashParams {
    pub num_buckets: u64,
    pub offset_width: u32,
    pub align_pow: u32,
    pub fbp_capacity: u32,
    pub update_mode: UpdateMode,
    pub crc_mode: CrcMode,
    pub comp_mode: CompressionMode,
}

pub(crate) const HASH_DEFAULTS: HashParams = HashParams {
    num_buckets: 1_048_583,
    offset_width: 4,
    align_pow: 3,
    fbp_capacity: 1024,
    update_mode: UpdateMode::InPlace,
    crc_mode: CrcMode::None,
    comp_mode: CompressionMode::None,
};

impl HashParams {
    /// Takes every parameter the options name and keeps the rest from `self`.
    pub(crate) fn overlay(&self, options: &OpenOptions) -> Result<HashParams> {
        let params = HashParams {
            num_buckets: options.num_buckets.unwrap_or(self.num_buckets),
            offset_width: options.offset_width.unwrap_or(self.offset_width),
            align_pow: options.align_pow.unwrap_or(self.align_pow),
            fbp_capacity: options.fbp_capacity.unwrap_or(self.fbp_capacity),
            update_mode: options.update_mode.unwrap_or(self.update_mode),
            crc_mode: options.record_crc_mode.unwrap_or(self.crc_mode),
            comp_mode: options.record_comp_mode.unwrap_or(self.comp_mode),
        };
        if params.num_buckets == 0 {
            return Err(Status::invalid_argument("num_buckets must be positive"));
        }
        if !(3..=8).contains(&params.offset_width) {
            return Err(Status::invalid_argument("offset_width must be within 3..=8"));
        }
        if params.align_pow > 16 {
            return Err(Status::invalid_argument("align_pow must be at most 16"));
        }
        Ok(params)
    }

    fn codec(&self) -> RecordCodec {
        RecordCodec::new(self.offset_width, self.align_pow, self.crc_mode, self.comp_mode)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HashMeta {
    magic: [u8; 8],
    version: u32,
    num_buckets: u64,
    offset_width: u32,
    align_pow: u32,
    fbp_capacity: u32,
    update_mode: u8,
    crc_mode: u8,
    comp_mode: u8,
    num_records: u64,
    eff_data_size: u64,
    closed_cleanly: bool,
    sync_file_size: u64,
    timestamp: f64,
    opaque: Vec<u8>,
}

impl HashMeta {
    fn params(&self) -> Result<HashParams> {
        Ok(HashParams {
            num_buckets: self.num_buckets,
            offset_width: self.offset_width,
            align_pow: self.align_pow,
            fbp_capacity: self.fbp_capacity,
            update_mode: UpdateMode::from_byte(self.update_mode)?,
            crc_mode: CrcMode::from_byte(self.crc_mode)?,
            comp_mode: CompressionMode::from_byte(self.comp_mode)?,
        })
    }
}

fn read_meta(file: &File) -> Result<HashMeta> {
    if file.size() < META_SIZE {
        return Err(Status::broken_data(format!(
            "{}: too short for a hash database",
            file.path().display()
        )));
    }
    let head = file.read(0, META_SIZE as usize)?;
    let len = read_fixed(&head[..4]) as usize;
    let body = head
        .get(4..4 + len)
        .ok_or_else(|| Status::broken_data("invalid metadata length"))?;
    let meta: HashMeta = bincode::deserialize(body)?;
    if meta.magic != HASH_MAGIC {
        return Err(Status::broken_data(format!(
            "{}: not a hash database",
            file.path().display()
        )));
    }
    if meta.version > FORMAT_VERSION {
        return Err(Status::broken_data(format!("unsupported version {}", meta.version)));
    }
    Ok(meta)
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    bucket_base: u64,
    fbp_base: u64,
    record_base: u64,
}

impl Layout {
    fn of(params: &HashParams) -> Layout {
        let bucket_base = META_SIZE;
        let fbp_base = bucket_base + params.num_buckets * params.offset_width as u64;
        let fbp_end = fbp_base + FreeBlockPool::section_size(params.fbp_capacity as usize);
        Layout {
            bucket_base,
            fbp_base,
            record_base: align_up(fbp_end, 1 << params.align_pow),
        }
    }
}

struct ChainHit {
    prev: Option<u64>,
    record: Option<Record>,
}

/// An open hash file. Callers serialize access per bucket.
struct HashFile {
    file: File,
    params: HashParams,
    codec: RecordCodec,
    layout: Layout,
    fbp: Mutex<FreeBlockPool>,
    num_records: AtomicU64,
    eff_data_size: AtomicU64,
    sync_file_size: AtomicU64,
    timestamp: AtomicU64,
    opaque: Mutex<Vec<u8>>,
}

impl HashFile {
    fn create(file: File, params: HashParams) -> Result<HashFile> {
        let layout = Layout::of(&params);
        file.truncate(0)?;
        file.truncate(layout.record_base)?;
        let hash_file = HashFile::assemble(file, params, 0, 0, 0, Vec::new());
        hash_file.write_meta(false)?;
        Ok(hash_file)
    }

    fn load(file: File) -> Result<(HashFile, bool)> {
        let meta = read_meta(&file)?;
        let params = meta.params()?;
        let layout = Layout::of(&params);
        if file.size() < layout.record_base {
            return Err(Status::broken_data("file is shorter than its bucket table"));
        }
        let hash_file = HashFile::assemble(
            file,
            params,
            meta.num_records,
            meta.eff_data_size,
            meta.sync_file_size,
            meta.opaque,
        );
        hash_file.timestamp.store(meta.timestamp.to_bits(), Ordering::Relaxed);
        let section = hash_file.file.read(
            layout.fbp_base,
            FreeBlockPool::section_size(params.fbp_capacity as usize) as usize,
        )?;
        hash_file.fbp.lock().deserialize(&section);
        Ok((hash_file, meta.closed_cleanly))
    }

    fn assemble(
        file: File,
        params: HashParams,
        num_records: u64,
        eff_data_size: u64,
        sync_file_size: u64,
        opaque: Vec<u8>,
    ) -> HashFile {
        HashFile {
            file,
            params,
            codec: params.codec(),
            layout: Layout::of(&params),
            fbp: Mutex::new(FreeBlockPool::new(params.fbp_capacity as usize)),
            num_records: AtomicU64::new(num_records),
            eff_data_size: AtomicU64::new(eff_data_size),
            sync_file_size: AtomicU64::new(sync_file_size),
            timestamp: AtomicU64::new(wall_time().to_bits()),
            opaque: Mutex::new(opaque),
        }
    }

    fn write_meta(&self, closed_cleanly: bool) -> Result<()> {
        let meta = HashMeta {
            magic: HASH_MAGIC,
            version: FORMAT_VERSION,
            num_buckets: self.params.num_buckets,
            offset_width: self.params.offset_width,
            align_pow: self.params.align_pow,
            fbp_capacity: self.params.fbp_capacity,
            update_mode: self.params.update_mode.to_byte(),
            crc_mode: self.params.crc_mode.to_byte(),
            comp_mode: self.params.comp_mode.to_byte(),
            num_records: self.num_records.load(Ordering::Acquire),
            eff_data_size: self.eff_data_size.load(Ordering::Acquire),
            closed_cleanly,
            sync_file_size: self.sync_file_size.load(Ordering::Acquire),
            timestamp: self.timestamp(),
            opaque: self.opaque.lock().clone(),
        };
        let body = bincode::serialize(&meta)?;
        if body.len() + 4 > META_SIZE as usize {
            return Err(Status::infeasible("metadata exceeds its block"));
        }
        let mut block = Vec::with_capacity(META_SIZE as usize);
        write_fixed(&mut block, body.len() as u64, 4);
        block.extend_from_slice(&body);
        block.resize(META_SIZE as usize, 0);
        self.file.write_at(0, &block)
    }

    fn write_free_blocks(&self) -> Result<()> {
        let data = self.fbp.lock().serialize();
        self.file.write_at(self.layout.fbp_base, &data)
    }

    /// Writes the free block section and a clean metadata block, then flushes.
    fn commit(&self, hard: bool) -> Result<()> {
        self.write_free_blocks()?;
        self.sync_file_size.store(self.file.size(), Ordering::Release);
        self.write_meta(true)?;
        self.file.synchronize(hard)
    }

    fn timestamp(&self) -> f64 {
        f64::from_bits(self.timestamp.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.timestamp.store(wall_time().to_bits(), Ordering::Relaxed);
    }

    fn bucket_index(&self, key: &[u8]) -> u64 {
        primary_hash(key, self.params.num_buckets)
    }

    fn read_buckets(&self, start: u64, count: u64) -> Result<Vec<u64>> {
        let width = self.codec.offset_width();
        let data = self.file.read(
            self.layout.bucket_base + start * width as u64,
            count as usize * width,
        )?;
        Ok(data
            .chunks_exact(width)
            .map(|field| self.codec.decode_offset(field))
            .collect())
    }

    fn read_bucket(&self, index: u64) -> Result<u64> {
        Ok(self.read_buckets(index, 1)?.first().copied().unwrap_or(0))
    }

    fn write_bucket(&self, index: u64, offset: u64) -> Result<()> {
        let width = self.codec.offset_width() as u64;
        self.file
            .write_at(self.layout.bucket_base + index * width, &self.codec.encode_offset(offset))
    }

    fn read_head(&self, offset: u64) -> Result<(RecordHeader, Vec<u8>)> {
        let chunk = self
            .file
            .read_some(offset, self.codec.max_header_size() + 64)?;
        let header = self.codec.parse_header(&chunk)?;
        Ok((header, chunk))
    }

    fn read_key(&self, offset: u64) -> Result<(RecordHeader, Vec<u8>)> {
        let (header, chunk) = self.read_head(offset)?;
        let key_end = header.header_size + header.key_size;
        let key = match chunk.get(header.header_size..key_end) {
            Some(key) => key.to_vec(),
            None => self
                .file
                .read(offset + header.header_size as u64, header.key_size)?,
        };
        Ok((header, key))
    }

    fn read_record(&self, offset: u64) -> Result<Record> {
        let (header, mut bytes) = self.read_head(offset)?;
        if header.body_size() > bytes.len() {
            bytes = self.file.read(offset, header.body_size())?;
        }
        self.codec.decode(offset, &header, &bytes)
    }

    fn chain_limit(&self) -> u64 {
        self.file.size() / self.codec.alignment() + 1
    }

    fn find(&self, key: &[u8], head: u64) -> Result<ChainHit> {
        let mut prev = None;
        let mut current = head;
        let mut steps = 0;
        while current != 0 {
            let (header, record_key) = self.read_key(current)?;
            if record_key == key {
                let record = self.read_record(current)?;
                return Ok(ChainHit {
                    prev,
                    record: Some(record),
                });
            }
            prev = Some(current);
            current = header.child;
            steps += 1;
            if steps > self.chain_limit() {
                return Err(Status::broken_data("cyclic record chain"));
            }
        }
        Ok(ChainHit { prev, record: None })
    }

    /// Keys of the live records of a chain, newest state first.
    fn live_keys(&self, head: u64) -> Result<Vec<Vec<u8>>> {
        let mut seen: Vec<Vec<u8>> = Vec::new();
        let mut live = Vec::new();
        let mut current = head;
        let mut steps = 0;
        while current != 0 {
            let (header, key) = self.read_key(current)?;
            if !seen.contains(&key) {
                if header.kind == RecordKind::Set {
                    live.push(key.clone());
                }
                if self.params.update_mode == UpdateMode::Appending {
                    seen.push(key);
                }
            }
            current = header.child;
            steps += 1;
            if steps > self.chain_limit() {
                return Err(Status::broken_data("cyclic record chain"));
            }
        }
        Ok(live)
    }

    fn allocate(&self, size: u64) -> Result<(u64, u64)> {
        if self.params.update_mode == UpdateMode::InPlace {
            if let Some(block) = self.fbp.lock().fetch(size) {
                return Ok((block.offset, block.size));
            }
        }
        let offset = self.file.reserve(size)?;
        if offset + size > self.codec.max_offset() {
            return Err(Status::infeasible("file size exceeds the offset width"));
        }
        Ok((offset, size))
    }

    fn write_new_record(&self, kind: RecordKind, child: u64, key: &[u8], stored: &[u8]) -> Result<u64> {
        let (offset, slot) = self.allocate(self.codec.required_size(key, stored))?;
        let bytes = self
            .codec
            .encode(kind, child, key, stored, slot)
            .ok_or_else(|| Status::infeasible("record does not fit its slot"))?;
        self.file.write_at(offset, &bytes)?;
        Ok(offset)
    }

    fn free(&self, offset: u64, slot_size: u64) -> Result<()> {
        self.file.write_at(offset, &[RecordKind::Void as u8])?;
        self.fbp.lock().insert(offset, slot_size);
        Ok(())
    }

    fn link(&self, prev: Option<u64>, bucket: u64, target: u64) -> Result<()> {
        match prev {
            Some(prev) => self.file.write_at(prev + 1, &self.codec.encode_offset(target)),
            None => self.write_bucket(bucket, target),
        }
    }

    /// Runs a processor on one record. The caller holds the bucket of `key` exclusively.
    fn process_record(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        let bucket = self.bucket_index(key);
        let head = self.read_bucket(bucket)?;
        let hit = self.find(key, head)?;
        let current = hit
            .record
            .as_ref()
            .filter(|record| record.kind == RecordKind::Set);
        let action = proc(key, current.map(|record| record.value.as_slice()));
        if !writable {
            return Ok(());
        }
        match action {
            RecordAction::Noop => return Ok(()),
            RecordAction::Set(value) => {
                let stored = self.codec.store_value(&value)?;
                match current {
                    Some(old) if self.params.update_mode == UpdateMode::InPlace => {
                        match self
                            .codec
                            .encode(RecordKind::Set, old.child, key, &stored, old.slot_size)
                        {
                            Some(bytes) => self.file.write_at(old.offset, &bytes)?,
                            None => {
                                let offset =
                                    self.write_new_record(RecordKind::Set, old.child, key, &stored)?;
                                self.link(hit.prev, bucket, offset)?;
                                self.free(old.offset, old.slot_size)?;
                            }
                        }
                    }
                    _ => {
                        let offset = self.write_new_record(RecordKind::Set, head, key, &stored)?;
                        self.write_bucket(bucket, offset)?;
                    }
                }
                match current {
                    Some(old) => {
                        self.eff_data_size
                            .fetch_sub(old.value.len() as u64, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add(value.len() as u64, Ordering::AcqRel);
                    }
                    None => {
                        self.num_records.fetch_add(1, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add((key.len() + value.len()) as u64, Ordering::AcqRel);
                    }
                }
            }
            RecordAction::Remove => {
                let Some(old) = current else {
                    return Ok(());
                };
                match self.params.update_mode {
                    UpdateMode::InPlace => {
                        self.link(hit.prev, bucket, old.child)?;
                        self.free(old.offset, old.slot_size)?;
                    }
                    UpdateMode::Appending => {
                        let offset = self.write_new_record(RecordKind::Remove, head, key, &[])?;
                        self.write_bucket(bucket, offset)?;
                    }
                }
                self.num_records.fetch_sub(1, Ordering::AcqRel);
                self.eff_data_size
                    .fetch_sub((key.len() + old.value.len()) as u64, Ordering::AcqRel);
            }
        }
        self.touch();
        Ok(())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.process_record(key, &mut |_, _| RecordAction::Set(value.to_vec()), true)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.process_record(key, &mut |_, _| RecordAction::Remove, true)
    }

    /// Visits every live record of the file; unreadable chains fail unless `skip_broken`.
    fn for_each_live(
        &self,
        skip_broken: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<u64> {
        let mut skipped = 0;
        let mut start = 0;
        while start < self.params.num_buckets {
            let count = BUCKET_BATCH.min(self.params.num_buckets - start);
            for head in self.read_buckets(start, count)? {
                if head == 0 {
                    continue;
                }
                match self.collect_chain(head) {
                    Ok(records) => {
                        for (key, value) in records {
                            visit(&key, &value)?;
                        }
                    }
                    Err(err) if skip_broken => {
                        warn!("skipping a broken record chain: {}", err);
                        skipped += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            start += count;
        }
        Ok(skipped)
    }

    fn collect_chain(&self, head: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut records = Vec::new();
        for key in self.live_keys(head)? {
            if let Some(record) = self.find(&key, head)?.record {
                records.push((record.key, record.value));
            }
        }
        Ok(records)
    }
}

/// File hash engine.
pub(crate) struct HashEngine {
    path: PathBuf,
    state: RwLock<HashFile>,
    bucket_locks: Vec<Mutex<()>>,
    writable: bool,
    healthy: AtomicBool,
    closed: AtomicBool,
    sync_hard: bool,
}

impl HashEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<HashEngine> {
        HashEngine::open_with_defaults(path, writable, options, HASH_DEFAULTS)
    }

    /// Opens a hash file; new files take parameters from `options` over `defaults`.
    pub(crate) fn open_with_defaults(
        path: &Path,
        writable: bool,
        options: &OpenOptions,
        defaults: HashParams,
    ) -> Result<HashEngine> {
        if path.as_os_str().is_empty() {
            return Err(Status::invalid_argument("a hash database needs a file path"));
        }
        let flags = FileOpenFlags {
            truncate: options.truncate,
            no_create: options.no_create,
        };
        let file = File::open(path, writable, flags)?;
        let mut writable = writable;
        let mut healthy = true;
        let state = if file.size() == 0 {
            if !writable {
                return Err(Status::broken_data(format!("{}: empty file", path.display())));
            }
            HashFile::create(file, defaults.overlay(options)?)?
        } else {
            let (state, closed_cleanly) = HashFile::load(file)?;
            if closed_cleanly {
                state
            } else if !writable {
                warn!("{} was not closed cleanly", path.display());
                healthy = false;
                state
            } else {
                match options.restore_mode.unwrap_or_default() {
                    RestoreMode::Default | RestoreMode::Sync => {
                        let bound = if options.restore_mode == Some(RestoreMode::Sync) {
                            0
                        } else {
                            -1
                        };
                        drop(state);
                        let tmp = sibling_path(path, ".tmp.restore");
                        let report = HashEngine::restore(path, &tmp, bound)?;
                        fs::rename(&tmp, path)?;
                        warn!(
                            "{} was not closed cleanly; restored {} records, discarded {}",
                            path.display(),
                            report.restored,
                            report.discarded
                        );
                        HashFile::load(File::open(path, true, FileOpenFlags::default())?)?.0
                    }
                    RestoreMode::ReadOnly => {
                        warn!("{} was not closed cleanly; opening read-only", path.display());
                        drop(state);
                        writable = false;
                        healthy = false;
                        HashFile::load(File::open(path, false, FileOpenFlags::default())?)?.0
                    }
                    RestoreMode::Noop => {
                        warn!("{} was not closed cleanly; opening as-is", path.display());
                        healthy = false;
                        state
                    }
                }
            }
        };
        if writable {
            state.write_meta(false)?;
        }
        info!(
            "opened hash database {} ({} records, {} buckets)",
            path.display(),
            state.num_records.load(Ordering::Acquire),
            state.params.num_buckets
        );
        Ok(HashEngine {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            bucket_locks: (0..NUM_BUCKET_LOCKS).map(|_| Mutex::new(())).collect(),
            writable,
            healthy: AtomicBool::new(healthy),
            closed: AtomicBool::new(false),
            sync_hard: options.sync_hard,
        })
    }

    /// Whether the file at `path` records a clean shutdown; `None` if it is missing or empty.
    pub(crate) fn peek_closed_cleanly(path: &Path) -> Result<Option<bool>> {
        if fs::metadata(path).map(|meta| meta.len() == 0).unwrap_or(true) {
            return Ok(None);
        }
        let file = File::open(path, false, FileOpenFlags::default())?;
        Ok(Some(read_meta(&file)?.closed_cleanly))
    }

    /// Copies the recoverable records of `old_path` into a new database at `new_path`.
    ///
    /// `end_offset` bounds the scan: negative means the whole file, 0 the size recorded at the
    /// last synchronization.
    pub(crate) fn restore(old_path: &Path, new_path: &Path, end_offset: i64) -> Result<RestoreReport> {
        let old = File::open(old_path, false, FileOpenFlags::default())?;
        let meta = read_meta(&old)?;
        let params = meta.params()?;
        let layout = Layout::of(&params);
        let codec = params.codec();
        let end = match end_offset {
            offset if offset < 0 => old.size(),
            0 if meta.sync_file_size > 0 => meta.sync_file_size.min(old.size()),
            0 => old.size(),
            offset => (offset as u64).min(old.size()),
        };
        let new_file = File::open(
            new_path,
            true,
            FileOpenFlags {
                truncate: true,
                no_create: false,
            },
        )?;
        let new = HashFile::create(new_file, params)?;
        *new.opaque.lock() = meta.opaque.clone();

        let mut discarded = 0;
        let mut in_gap = false;
        let mut offset = layout.record_base;
        while offset < end {
            match read_restorable(&old, &codec, offset, end) {
                Ok(record) => {
                    in_gap = false;
                    match record.kind {
                        RecordKind::Set => new.put(&record.key, &record.value)?,
                        RecordKind::Remove => new.delete(&record.key)?,
                        RecordKind::Void => {}
                    }
                    offset += record.slot_size;
                }
                Err(err) => {
                    if !in_gap {
                        debug!("unreadable region at {}: {}", offset, err);
                        discarded += 1;
                        in_gap = true;
                    }
                    offset += codec.alignment();
                }
            }
        }
        new.commit(false)?;
        let restored = new.num_records.load(Ordering::Acquire);
        info!(
            "restored {} into {}: {} records, {} discarded",
            old_path.display(),
            new_path.display(),
            restored,
            discarded
        );
        Ok(RestoreReport {
            restored,
            discarded,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Status::precondition("closed database"))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Status::precondition("not writable database"))
        }
    }

    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.healthy.store(false, Ordering::Release);
        }
        result
    }

    pub(crate) fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.process(
            key,
            &mut |_, value| {
                found = value.map(<[u8]>::to_vec);
                RecordAction::Noop
            },
            false,
        )?;
        Ok(found)
    }

    pub(crate) fn set_raw(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut value = Some(value);
        self.process(
            key,
            &mut |_, _| RecordAction::Set(value.take().unwrap_or_default()),
            true,
        )
    }

    pub(crate) fn remove_raw(&self, key: &[u8]) -> Result<()> {
        self.process(key, &mut |_, _| RecordAction::Remove, true)
    }

    pub(crate) fn opaque(&self) -> Vec<u8> {
        self.state.read().opaque.lock().clone()
    }

    /// Replaces the opaque metadata; it reaches the file with the next synchronization.
    pub(crate) fn set_opaque(&self, data: Vec<u8>) {
        *self.state.read().opaque.lock() = data;
    }

    pub(crate) fn params(&self) -> HashParams {
        self.state.read().params
    }
}

fn read_restorable(file: &File, codec: &RecordCodec, offset: u64, end: u64) -> Result<Record> {
    let chunk = file.read_some(offset, codec.max_header_size() + 64)?;
    let header = codec.parse_header(&chunk)?;
    let slot = header.slot_size();
    if slot == 0 || slot % codec.alignment() != 0 || offset + slot > end {
        return Err(Status::broken_data("implausible record size"));
    }
    let bytes = if header.body_size() > chunk.len() {
        file.read(offset, header.body_size())?
    } else {
        chunk
    };
    codec.decode(offset, &header, &bytes)
}

impl Engine for HashEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check_open()?;
        if writable {
            self.check_writable()?;
        }
        let state = self.state.read();
        let bucket = state.bucket_index(key);
        let _lock = self.bucket_locks[(bucket % NUM_BUCKET_LOCKS) as usize].lock();
        self.guard(state.process_record(key, proc, writable))
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check_open()?;
        if writable {
            self.check_writable()?;
        }
        let state = self.state.write();
        let mut start = 0;
        while start < state.params.num_buckets {
            let count = BUCKET_BATCH.min(state.params.num_buckets - start);
            for head in state.read_buckets(start, count)? {
                if head == 0 {
                    continue;
                }
                for key in state.live_keys(head)? {
                    let mut forward = |key: &[u8], value: Option<&[u8]>| match value {
                        Some(value) => proc(key, Some(value)),
                        None => RecordAction::Noop,
                    };
                    self.guard(state.process_record(&key, &mut forward, writable))?;
                }
            }
            start += count;
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.state.read().num_records.load(Ordering::Acquire))
    }

    fn file_size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.state.read().file.size())
    }

    fn file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn timestamp(&self) -> f64 {
        self.state.read().timestamp()
    }

    fn clear(&self) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let state = self.state.write();
        state.file.truncate(state.layout.bucket_base)?;
        state.file.truncate(state.layout.record_base)?;
        state.fbp.lock().clear();
        state.num_records.store(0, Ordering::Release);
        state.eff_data_size.store(0, Ordering::Release);
        state.touch();
        state.write_meta(false)
    }

    fn rebuild(&self, options: &OpenOptions) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let mut state = self.state.write();
        let count = state.num_records.load(Ordering::Acquire);
        let mut current = state.params;
        current.num_buckets = (count * 2).max(MIN_REBUILD_BUCKETS);
        let params = current.overlay(options)?;
        let tmp = sibling_path(&self.path, ".tmp.rebuild");
        let built = (|| -> Result<u64> {
            let file = File::open(
                &tmp,
                true,
                FileOpenFlags {
                    truncate: true,
                    no_create: false,
                },
            )?;
            let fresh = HashFile::create(file, params)?;
            *fresh.opaque.lock() = state.opaque.lock().clone();
            let skipped = state.for_each_live(options.skip_broken_records, &mut |key, value| {
                fresh.put(key, value)
            })?;
            fresh.commit(false)?;
            Ok(skipped)
        })();
        let skipped = match built {
            Ok(skipped) => skipped,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        fs::rename(&tmp, &self.path)?;
        let (fresh, _) = HashFile::load(File::open(&self.path, true, FileOpenFlags::default())?)?;
        fresh.write_meta(false)?;
        info!(
            "rebuilt {}: {} records, {} buckets, {} broken chains skipped",
            self.path.display(),
            fresh.num_records.load(Ordering::Acquire),
            params.num_buckets,
            skipped
        );
        *state = fresh;
        self.healthy.store(true, Ordering::Release);
        Ok(())
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.check_open()?;
        let state = self.state.read();
        let num_records = state.num_records.load(Ordering::Acquire);
        let live = state.eff_data_size.load(Ordering::Acquire) + num_records * 16;
        let used = state.file.size() - state.layout.record_base;
        Ok(num_records > state.params.num_buckets || used > live * 2 + (1 << 20))
    }

    fn synchronize(&self, hard: bool, _options: &SyncOptions) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Ok(());
        }
        let state = self.state.write();
        state.commit(hard)?;
        debug!("synchronized {}", self.path.display());
        state.write_meta(false)
    }

    fn copy_file_data(&self, dest: &Path, hard: bool) -> Result<()> {
        self.check_open()?;
        let state = self.state.write();
        if !self.writable {
            fs::copy(&self.path, dest)?;
            return Ok(());
        }
        state.commit(hard)?;
        let copied = fs::copy(&self.path, dest);
        state.write_meta(false)?;
        copied?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state.write();
        if self.writable {
            // An unhealthy file keeps its unclean mark so that the next open restores it.
            if self.healthy.load(Ordering::Acquire) {
                state.commit(self.sync_hard)?;
            } else {
                state.file.synchronize(self.sync_hard)?;
            }
        }
        info!("closed hash database {}", self.path.display());
        Ok(())
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let state = self.state.read();
        let params = state.params;
        vec![
            ("class".to_string(), "HashDBM".to_string()),
            ("path".to_string(), self.path.display().to_string()),
            (
                "num_records".to_string(),
                state.num_records.load(Ordering::Acquire).to_string(),
            ),
            ("file_size".to_string(), state.file.size().to_string()),
            ("num_buckets".to_string(), params.num_buckets.to_string()),
            ("offset_width".to_string(), params.offset_width.to_string()),
            ("align_pow".to_string(), params.align_pow.to_string()),
            ("fbp_size".to_string(), state.fbp.lock().len().to_string()),
            ("update_mode".to_string(), format!("{:?}", params.update_mode)),
            ("record_crc_mode".to_string(), format!("{:?}", params.crc_mode)),
            ("record_comp_mode".to_string(), format!("{:?}", params.comp_mode)),
            ("healthy".to_string(), self.is_healthy().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn bucket_keys(&self, from: u64) -> Result<Option<(u64, Vec<Vec<u8>>)>> {
        self.check_open()?;
        let state = self.state.read();
        let num_buckets = state.params.num_buckets;
        let mut start = from;
        while start < num_buckets {
            let count = BUCKET_BATCH.min(num_buckets - start);
            for (i, head) in state.read_buckets(start, count)?.into_iter().enumerate() {
                if head == 0 {
                    continue;
                }
                let bucket = start + i as u64;
                let _lock = self.bucket_locks[(bucket % NUM_BUCKET_LOCKS) as usize].lock();
                let head = state.read_bucket(bucket)?;
                let keys = state.live_keys(head)?;
                if !keys.is_empty() {
                    return Ok(Some((bucket, keys)));
                }
            }
            start += count;
        }
        Ok(None)
    }

    fn bucket_index(&self, key: &[u8]) -> u64 {
        self.state.read().bucket_index(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(engine: &HashEngine, key: &str, value: &str) {
        engine.set_raw(key.as_bytes(), value.as_bytes().to_vec()).unwrap();
    }

    fn get(engine: &HashEngine, key: &str) -> Option<String> {
        engine
            .get_raw(key.as_bytes())
            .unwrap()
            .map(|value| String::from_utf8(value).unwrap())
    }

    fn small(mode: &str) -> OpenOptions {
        OpenOptions::from_params([("num_buckets", "7"), ("update_mode", mode)]).unwrap()
    }

    #[test]
    fn chains_in_both_modes() {
        for mode in ["in_place", "appending"] {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("db.tkh");
            let engine = HashEngine::open(&path, true, &small(mode)).unwrap();
            for i in 0..50 {
                put(&engine, &format!("k{}", i), &format!("v{}", i));
            }
            for i in (0..50).step_by(3) {
                engine.remove_raw(format!("k{}", i).as_bytes()).unwrap();
            }
            put(&engine, "k1", &"long".repeat(40));
            assert_eq!(33, engine.count().unwrap());
            assert_eq!(None, get(&engine, "k0"));
            assert_eq!(Some("long".repeat(40)), get(&engine, "k1"));
            assert_eq!(Some("v2".to_string()), get(&engine, "k2"));

            let mut keys = Vec::new();
            let mut bucket = 0;
            while let Some((found, bucket_keys)) = engine.bucket_keys(bucket).unwrap() {
                keys.extend(bucket_keys);
                bucket = found + 1;
            }
            assert_eq!(33, keys.len());
            engine.close().unwrap();

            let engine = HashEngine::open(&path, false, &OpenOptions::new()).unwrap();
            assert!(engine.is_healthy());
            assert_eq!(33, engine.count().unwrap());
            assert_eq!(Some("v49".to_string()), get(&engine, "k49"));
        }
    }

    #[test]
    fn in_place_reuses_freed_slots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkh");
        let engine = HashEngine::open(&path, true, &small("in_place")).unwrap();
        put(&engine, "a", &"x".repeat(100));
        put(&engine, "b", "y");
        let size = engine.file_size().unwrap();
        engine.remove_raw(b"a").unwrap();
        put(&engine, "c", &"z".repeat(90));
        assert_eq!(size, engine.file_size().unwrap());
        put(&engine, "b", "w");
        assert_eq!(size, engine.file_size().unwrap());
    }

    #[test]
    fn rebuild_reclaims_appended_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkh");
        let engine = HashEngine::open(&path, true, &small("appending")).unwrap();
        for round in 0..20 {
            put(&engine, "key", &format!("value{}", round));
        }
        let before = engine.file_size().unwrap();
        engine
            .rebuild(&OpenOptions::from_params([("num_buckets", "3")]).unwrap())
            .unwrap();
        assert!(engine.file_size().unwrap() < before);
        assert_eq!(Some("value19".to_string()), get(&engine, "key"));
        assert_eq!(3, engine.params().num_buckets);
        assert_eq!(UpdateMode::Appending, engine.params().update_mode);
    }

    #[test]
    fn unclean_file_is_restored_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkh");
        let options = OpenOptions::from_params([("num_buckets", "10"), ("record_crc_mode", "crc32")])
            .unwrap();
        let engine = HashEngine::open(&path, true, &options).unwrap();
        for i in 0..10 {
            put(&engine, &i.to_string(), "value");
        }
        drop(engine);
        assert_eq!(Some(false), HashEngine::peek_closed_cleanly(&path).unwrap());

        let reader = HashEngine::open(&path, false, &OpenOptions::new()).unwrap();
        assert!(!reader.is_healthy());
        drop(reader);

        let engine = HashEngine::open(&path, true, &OpenOptions::new()).unwrap();
        assert!(engine.is_healthy());
        assert_eq!(10, engine.count().unwrap());
        assert_eq!(Some("value".to_string()), get(&engine, "7"));
        engine.close().unwrap();
        assert_eq!(Some(true), HashEngine::peek_closed_cleanly(&path).unwrap());
    }

    #[test]
    fn restore_skips_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkh");
        let options =
            OpenOptions::from_params([("num_buckets", "10"), ("record_crc_mode", "crc16")]).unwrap();
        let engine = HashEngine::open(&path, true, &options).unwrap();
        for i in 0..10 {
            put(&engine, &format!("key{}", i), &format!("value{}", i));
        }
        engine.close().unwrap();

        // The last record is "key9": 10 header bytes, the key, the value, 4 bytes of padding.
        let file = File::open(&path, true, FileOpenFlags::default()).unwrap();
        let size = file.size();
        file.write_at(size - 24 + 10, b"!!!").unwrap();
        drop(file);

        let restored = dir.path().join("restored.tkh");
        let report = HashEngine::restore(&path, &restored, -1).unwrap();
        assert_eq!(9, report.restored);
        assert_eq!(1, report.discarded);
        let engine = HashEngine::open(&restored, false, &OpenOptions::new()).unwrap();
        assert_eq!(9, engine.count().unwrap());
        assert!(engine.is_healthy());
    }
}
