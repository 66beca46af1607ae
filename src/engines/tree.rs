//! File B+ tree.
//!
//! Pages are records of an embedded [`HashEngine`] living in the same file, keyed by a 6-byte
//! page id. The tree metadata is kept in the opaque area of the hash metadata. Leaves are
//! doubly linked so that cursors walk them in both directions.

use std::cmp::Ordering as KeyOrdering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::hash::{HASH_DEFAULTS, HashEngine, HashParams};
use super::{Engine, Locate, Processor, RecordAction, RestoreReport};
use crate::comparator::KeyComparator;
use crate::lru::LruMap;
use crate::options::{OpenOptions, RestoreMode, SyncOptions};
use crate::util::{sibling_path, varint_len, wall_time};
use crate::{Result, Status};

pub(crate) const TREE_HASH_DEFAULTS: HashParams = HashParams {
    num_buckets: 131_101,
    align_pow: 10,
    ..HASH_DEFAULTS
};

const DEFAULT_MAX_PAGE_SIZE: u32 = 8130;
const DEFAULT_MAX_BRANCHES: u32 = 256;
const DEFAULT_MAX_CACHED_PAGES: u32 = 10_000;
const PAGE_ID_WIDTH: usize = 6;
const MIN_REBUILD_BUCKETS: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Page {
    Leaf {
        prev: u64,
        next: u64,
        records: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Inner {
        children: Vec<u64>,
        keys: Vec<Vec<u8>>,
    },
}

struct CachedPage {
    page: Page,
    dirty: bool,
}

type PageRef = Arc<Mutex<CachedPage>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeMeta {
    root: u64,
    first: u64,
    last: u64,
    next_id: u64,
    num_records: u64,
    eff_data_size: u64,
    max_page_size: u32,
    max_branches: u32,
    comparator: String,
}

#[derive(Debug, Clone, Copy)]
struct TreeParams {
    max_page_size: usize,
    max_branches: usize,
    max_cached_pages: usize,
    comparator: KeyComparator,
}

enum InsertResult {
    Done,
    Split { separator: Vec<u8>, right: u64 },
}

fn page_key(id: u64) -> Vec<u8> {
    id.to_be_bytes()[8 - PAGE_ID_WIDTH..].to_vec()
}

fn record_size(key: &[u8], value: &[u8]) -> usize {
    varint_len(key.len() as u64) + varint_len(value.len() as u64) + key.len() + value.len()
}

fn leaf_size(records: &[(Vec<u8>, Vec<u8>)]) -> usize {
    records.iter().map(|(key, value)| record_size(key, value)).sum()
}

/// Index splitting a leaf into two halves of similar packed size, neither empty.
fn split_point(records: &[(Vec<u8>, Vec<u8>)]) -> usize {
    let total = leaf_size(records);
    let mut acc = 0;
    let mut at = records.len() / 2;
    for (i, (key, value)) in records.iter().enumerate() {
        acc += record_size(key, value);
        if acc * 2 >= total {
            at = i + 1;
            break;
        }
    }
    at.clamp(1, records.len().saturating_sub(1).max(1))
}

fn broken_page(id: u64) -> Status {
    Status::broken_data(format!("unexpected page type at page {}", id))
}

/// State of an open tree. Structural changes need `&mut self`.
struct TreeCore {
    hash: HashEngine,
    params: TreeParams,
    writable: bool,
    root: u64,
    first: u64,
    last: u64,
    next_id: u64,
    num_records: AtomicU64,
    eff_data_size: AtomicU64,
    cache: Mutex<LruMap<u64, PageRef>>,
}

impl TreeCore {
    fn open(
        path: &Path,
        writable: bool,
        options: &OpenOptions,
        hash_defaults: HashParams,
    ) -> Result<TreeCore> {
        let hash = HashEngine::open_with_defaults(path, writable, options, hash_defaults)?;
        let opaque = hash.opaque();
        let max_cached_pages = options
            .max_cached_pages
            .unwrap_or(DEFAULT_MAX_CACHED_PAGES)
            .max(1) as usize;
        if opaque.is_empty() {
            if !writable {
                return Err(Status::broken_data(format!(
                    "{}: no tree metadata",
                    path.display()
                )));
            }
            let params = TreeParams {
                max_page_size: options.max_page_size.unwrap_or(DEFAULT_MAX_PAGE_SIZE).max(1)
                    as usize,
                max_branches: options.max_branches.unwrap_or(DEFAULT_MAX_BRANCHES) as usize,
                max_cached_pages,
                comparator: options.key_comparator.unwrap_or_default(),
            };
            if params.max_branches < 3 {
                return Err(Status::invalid_argument("max_branches must be at least 3"));
            }
            let core = TreeCore::assemble(hash, params, writable, 1, 2, 0, 0);
            core.store(
                1,
                Page::Leaf {
                    prev: 0,
                    next: 0,
                    records: Vec::new(),
                },
            );
            core.flush_all()?;
            core.write_meta()?;
            return Ok(core);
        }
        let meta: TreeMeta = bincode::deserialize(&opaque)?;
        let comparator = KeyComparator::try_from(meta.comparator.clone())?;
        if let Some(requested) = options.key_comparator {
            if requested != comparator {
                warn!(
                    "{} is ordered by {}; ignoring {}",
                    path.display(),
                    comparator.name(),
                    requested.name()
                );
            }
        }
        let params = TreeParams {
            max_page_size: meta.max_page_size.max(1) as usize,
            max_branches: (meta.max_branches as usize).max(3),
            max_cached_pages,
            comparator,
        };
        let mut core = TreeCore::assemble(
            hash,
            params,
            writable,
            meta.root,
            meta.next_id,
            meta.num_records,
            meta.eff_data_size,
        );
        core.first = meta.first;
        core.last = meta.last;
        Ok(core)
    }

    fn assemble(
        hash: HashEngine,
        params: TreeParams,
        writable: bool,
        root: u64,
        next_id: u64,
        num_records: u64,
        eff_data_size: u64,
    ) -> TreeCore {
        TreeCore {
            hash,
            params,
            writable,
            root,
            first: root,
            last: root,
            next_id,
            num_records: AtomicU64::new(num_records),
            eff_data_size: AtomicU64::new(eff_data_size),
            cache: Mutex::new(LruMap::new()),
        }
    }

    fn write_meta(&self) -> Result<()> {
        let meta = TreeMeta {
            root: self.root,
            first: self.first,
            last: self.last,
            next_id: self.next_id,
            num_records: self.num_records.load(Ordering::Acquire),
            eff_data_size: self.eff_data_size.load(Ordering::Acquire),
            max_page_size: self.params.max_page_size as u32,
            max_branches: self.params.max_branches as u32,
            comparator: self.params.comparator.name().to_string(),
        };
        self.hash.set_opaque(bincode::serialize(&meta)?);
        Ok(())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> KeyOrdering {
        self.params.comparator.compare(a, b)
    }

    fn route(&self, keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|separator| self.compare(separator, key) != KeyOrdering::Greater)
    }

    fn search(&self, records: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> std::result::Result<usize, usize> {
        records.binary_search_by(|(probe, _)| self.compare(probe, key))
    }

    /// The cached page, loaded from the file on a miss.
    fn page(&self, id: u64) -> Result<PageRef> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&id) {
            return Ok(Arc::clone(entry));
        }
        let data = self
            .hash
            .get_raw(&page_key(id))?
            .ok_or_else(|| Status::broken_data(format!("missing page {}", id)))?;
        let page: Page = bincode::deserialize(&data)?;
        let entry = Arc::new(Mutex::new(CachedPage { page, dirty: false }));
        cache.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    fn load(&self, id: u64) -> Result<Page> {
        Ok(self.page(id)?.lock().page.clone())
    }

    fn store(&self, id: u64, page: Page) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&id).cloned() {
            let mut cached = entry.lock();
            cached.page = page;
            cached.dirty = true;
        } else {
            cache.insert(id, Arc::new(Mutex::new(CachedPage { page, dirty: true })));
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn discard_page(&self, id: u64) -> Result<()> {
        self.cache.lock().remove(&id);
        self.hash.remove_raw(&page_key(id))
    }

    fn flush_page(&self, id: u64, cached: &mut CachedPage) -> Result<()> {
        if cached.dirty {
            self.hash.set_raw(&page_key(id), bincode::serialize(&cached.page)?)?;
            cached.dirty = false;
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let cache = self.cache.lock();
        let mut flushed = 0;
        for (id, entry) in cache.iter() {
            let mut cached = entry.lock();
            if cached.dirty {
                self.flush_page(*id, &mut cached)?;
                flushed += 1;
            }
        }
        debug!("flushed {} tree pages", flushed);
        Ok(())
    }

    /// Evicts least recently used pages nobody holds until the cache fits its bound.
    fn trim_cache(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        if cache.len() <= self.params.max_cached_pages {
            return Ok(());
        }
        let excess = cache.len() - self.params.max_cached_pages;
        let victims: Vec<u64> = cache
            .keys_lru()
            .filter(|id| {
                cache
                    .peek(*id)
                    .is_some_and(|entry| Arc::strong_count(entry) == 1)
            })
            .take(excess)
            .copied()
            .collect();
        for id in victims {
            if let Some(entry) = cache.remove(&id) {
                let mut cached = entry.lock();
                self.flush_page(id, &mut cached)?;
            }
        }
        Ok(())
    }

    fn find_leaf(&self, key: &[u8]) -> Result<u64> {
        let mut id = self.root;
        loop {
            let entry = self.page(id)?;
            let cached = entry.lock();
            match &cached.page {
                Page::Leaf { .. } => return Ok(id),
                Page::Inner { children, keys } => id = children[self.route(keys, key)],
            }
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = self.page(self.find_leaf(key)?)?;
        let cached = entry.lock();
        match &cached.page {
            Page::Leaf { records, .. } => {
                Ok(self.search(records, key).ok().map(|i| records[i].1.clone()))
            }
            Page::Inner { .. } => Err(Status::broken_data("leaf expected")),
        }
    }

    /// Runs the processor on the leaf holding `key` and applies its answer when the leaf
    /// stays within bounds. Otherwise returns the answer for [`TreeCore::apply`].
    fn process_in_leaf(
        &self,
        key: &[u8],
        proc: &mut Processor<'_>,
        writable: bool,
    ) -> Result<Option<RecordAction>> {
        let leaf_id = self.find_leaf(key)?;
        let entry = self.page(leaf_id)?;
        let mut cached = entry.lock();
        let Page::Leaf { records, .. } = &mut cached.page else {
            return Err(broken_page(leaf_id));
        };
        let position = self.search(records, key);
        let action = proc(key, position.ok().map(|i| records[i].1.as_slice()));
        if !writable {
            return Ok(None);
        }
        match action {
            RecordAction::Noop => Ok(None),
            RecordAction::Set(value) => {
                let size = leaf_size(records);
                let grown = match position {
                    Ok(i) => size - record_size(key, &records[i].1) + record_size(key, &value),
                    Err(_) => size + record_size(key, &value),
                };
                let count = records.len() + usize::from(position.is_err());
                if grown > self.params.max_page_size && count >= 2 {
                    return Ok(Some(RecordAction::Set(value)));
                }
                match position {
                    Ok(i) => {
                        self.eff_data_size
                            .fetch_sub(records[i].1.len() as u64, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add(value.len() as u64, Ordering::AcqRel);
                        records[i].1 = value;
                    }
                    Err(i) => {
                        self.num_records.fetch_add(1, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add((key.len() + value.len()) as u64, Ordering::AcqRel);
                        records.insert(i, (key.to_vec(), value));
                    }
                }
                cached.dirty = true;
                Ok(None)
            }
            RecordAction::Remove => {
                let Ok(i) = position else {
                    return Ok(None);
                };
                let shrunk = leaf_size(records) - record_size(key, &records[i].1);
                if leaf_id != self.root && shrunk < self.params.max_page_size / 4 {
                    return Ok(Some(RecordAction::Remove));
                }
                let (old_key, old_value) = records.remove(i);
                self.num_records.fetch_sub(1, Ordering::AcqRel);
                self.eff_data_size
                    .fetch_sub((old_key.len() + old_value.len()) as u64, Ordering::AcqRel);
                cached.dirty = true;
                Ok(None)
            }
        }
    }

    /// Applies an action, splitting and merging pages as needed.
    fn apply(&mut self, key: &[u8], action: RecordAction) -> Result<()> {
        match action {
            RecordAction::Noop => Ok(()),
            RecordAction::Set(value) => {
                if let InsertResult::Split { separator, right } =
                    self.insert_into(self.root, key, value)?
                {
                    let new_root = self.allocate_id();
                    self.store(
                        new_root,
                        Page::Inner {
                            children: vec![self.root, right],
                            keys: vec![separator],
                        },
                    );
                    self.root = new_root;
                }
                Ok(())
            }
            RecordAction::Remove => {
                self.remove_from(self.root, key)?;
                self.compact_root()
            }
        }
    }

    fn insert_into(&mut self, id: u64, key: &[u8], value: Vec<u8>) -> Result<InsertResult> {
        match self.load(id)? {
            Page::Leaf {
                prev,
                next,
                mut records,
            } => {
                match self.search(&records, key) {
                    Ok(i) => {
                        self.eff_data_size
                            .fetch_sub(records[i].1.len() as u64, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add(value.len() as u64, Ordering::AcqRel);
                        records[i].1 = value;
                    }
                    Err(i) => {
                        self.num_records.fetch_add(1, Ordering::AcqRel);
                        self.eff_data_size
                            .fetch_add((key.len() + value.len()) as u64, Ordering::AcqRel);
                        records.insert(i, (key.to_vec(), value));
                    }
                }
                if leaf_size(&records) <= self.params.max_page_size || records.len() < 2 {
                    self.store(id, Page::Leaf { prev, next, records });
                    return Ok(InsertResult::Done);
                }
                let right_records = records.split_off(split_point(&records));
                let separator = right_records[0].0.clone();
                let right = self.allocate_id();
                self.relink_next_leaf(next, right)?;
                self.store(
                    right,
                    Page::Leaf {
                        prev: id,
                        next,
                        records: right_records,
                    },
                );
                self.store(
                    id,
                    Page::Leaf {
                        prev,
                        next: right,
                        records,
                    },
                );
                Ok(InsertResult::Split { separator, right })
            }
            Page::Inner {
                mut children,
                mut keys,
            } => {
                let index = self.route(&keys, key);
                let InsertResult::Split { separator, right } =
                    self.insert_into(children[index], key, value)?
                else {
                    return Ok(InsertResult::Done);
                };
                keys.insert(index, separator);
                children.insert(index + 1, right);
                if children.len() <= self.params.max_branches {
                    self.store(id, Page::Inner { children, keys });
                    return Ok(InsertResult::Done);
                }
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.pop().ok_or_else(|| broken_page(id))?;
                let right_children = children.split_off(mid + 1);
                let right = self.allocate_id();
                self.store(
                    right,
                    Page::Inner {
                        children: right_children,
                        keys: right_keys,
                    },
                );
                self.store(id, Page::Inner { children, keys });
                Ok(InsertResult::Split { separator, right })
            }
        }
    }

    /// Points the `prev` link of leaf `next` at `prev`, or moves the last leaf.
    fn relink_next_leaf(&mut self, next: u64, prev: u64) -> Result<()> {
        if next == 0 {
            self.last = prev;
            return Ok(());
        }
        match self.load(next)? {
            Page::Leaf {
                next: after,
                records,
                ..
            } => {
                self.store(
                    next,
                    Page::Leaf {
                        prev,
                        next: after,
                        records,
                    },
                );
                Ok(())
            }
            Page::Inner { .. } => Err(broken_page(next)),
        }
    }

    /// Removes `key` below page `id`; returns whether the page underflowed.
    fn remove_from(&mut self, id: u64, key: &[u8]) -> Result<bool> {
        match self.load(id)? {
            Page::Leaf {
                prev,
                next,
                mut records,
            } => {
                let Ok(i) = self.search(&records, key) else {
                    return Ok(false);
                };
                let (old_key, old_value) = records.remove(i);
                self.num_records.fetch_sub(1, Ordering::AcqRel);
                self.eff_data_size
                    .fetch_sub((old_key.len() + old_value.len()) as u64, Ordering::AcqRel);
                let underflow = leaf_size(&records) < self.params.max_page_size / 4;
                self.store(id, Page::Leaf { prev, next, records });
                Ok(underflow)
            }
            Page::Inner {
                mut children,
                mut keys,
            } => {
                let index = self.route(&keys, key);
                if !self.remove_from(children[index], key)? {
                    return Ok(false);
                }
                if children.len() >= 2 {
                    self.rebalance(&mut children, &mut keys, index)?;
                }
                let underflow = children.len() < (self.params.max_branches / 4).max(2);
                self.store(id, Page::Inner { children, keys });
                Ok(underflow)
            }
        }
    }

    /// Merges the underflowing child at `index` with a sibling, or evens them out when the
    /// merged page would be too large.
    fn rebalance(
        &mut self,
        children: &mut Vec<u64>,
        keys: &mut Vec<Vec<u8>>,
        index: usize,
    ) -> Result<()> {
        let left_index = if index + 1 < children.len() {
            index
        } else {
            index - 1
        };
        let (left, right) = (children[left_index], children[left_index + 1]);
        match (self.load(left)?, self.load(right)?) {
            (
                Page::Leaf {
                    prev,
                    records: mut merged,
                    ..
                },
                Page::Leaf {
                    next,
                    records: right_records,
                    ..
                },
            ) => {
                let fits = leaf_size(&merged) + leaf_size(&right_records)
                    <= self.params.max_page_size;
                merged.extend(right_records);
                if fits || merged.len() < 2 {
                    self.relink_next_leaf(next, left)?;
                    self.store(
                        left,
                        Page::Leaf {
                            prev,
                            next,
                            records: merged,
                        },
                    );
                    self.discard_page(right)?;
                    keys.remove(left_index);
                    children.remove(left_index + 1);
                } else {
                    let right_records = merged.split_off(split_point(&merged));
                    keys[left_index] = right_records[0].0.clone();
                    self.store(
                        left,
                        Page::Leaf {
                            prev,
                            next: right,
                            records: merged,
                        },
                    );
                    self.store(
                        right,
                        Page::Leaf {
                            prev: left,
                            next,
                            records: right_records,
                        },
                    );
                }
                Ok(())
            }
            (
                Page::Inner {
                    children: mut merged_children,
                    keys: mut merged_keys,
                },
                Page::Inner {
                    children: right_children,
                    keys: right_keys,
                },
            ) => {
                merged_keys.push(keys[left_index].clone());
                merged_keys.extend(right_keys);
                merged_children.extend(right_children);
                if merged_children.len() <= self.params.max_branches {
                    self.store(
                        left,
                        Page::Inner {
                            children: merged_children,
                            keys: merged_keys,
                        },
                    );
                    self.discard_page(right)?;
                    keys.remove(left_index);
                    children.remove(left_index + 1);
                } else {
                    let at = merged_children.len() / 2;
                    let right_children = merged_children.split_off(at);
                    let right_keys = merged_keys.split_off(at);
                    keys[left_index] = merged_keys.pop().ok_or_else(|| broken_page(left))?;
                    self.store(
                        left,
                        Page::Inner {
                            children: merged_children,
                            keys: merged_keys,
                        },
                    );
                    self.store(
                        right,
                        Page::Inner {
                            children: right_children,
                            keys: right_keys,
                        },
                    );
                }
                Ok(())
            }
            _ => Err(broken_page(left)),
        }
    }

    /// Replaces an inner root having a single child by that child.
    fn compact_root(&mut self) -> Result<()> {
        loop {
            match self.load(self.root)? {
                Page::Inner { children, .. } if children.len() == 1 => {
                    let old = self.root;
                    self.root = children[0];
                    self.discard_page(old)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn depth(&self) -> Result<u32> {
        let mut depth = 1;
        let mut id = self.root;
        while let Page::Inner { children, .. } = self.load(id)? {
            id = children[0];
            depth += 1;
        }
        Ok(depth)
    }

    fn locate(&self, target: Locate<'_>) -> Result<Option<Vec<u8>>> {
        match target {
            Locate::First => self.scan_forward(self.first, |_| true),
            Locate::Last => self.scan_backward(self.last, |_| true),
            Locate::Ge(key) => self.scan_forward(self.find_leaf(key)?, |probe| {
                self.compare(probe, key) != KeyOrdering::Less
            }),
            Locate::Gt(key) => self.scan_forward(self.find_leaf(key)?, |probe| {
                self.compare(probe, key) == KeyOrdering::Greater
            }),
            Locate::Le(key) => self.scan_backward(self.find_leaf(key)?, |probe| {
                self.compare(probe, key) != KeyOrdering::Greater
            }),
            Locate::Lt(key) => self.scan_backward(self.find_leaf(key)?, |probe| {
                self.compare(probe, key) == KeyOrdering::Less
            }),
        }
    }

    /// First key accepted by `accept`, which must hold for a suffix of the key order.
    fn scan_forward(&self, mut id: u64, accept: impl Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>> {
        while id != 0 {
            let entry = self.page(id)?;
            let cached = entry.lock();
            let Page::Leaf { next, records, .. } = &cached.page else {
                return Err(broken_page(id));
            };
            let i = records.partition_point(|(key, _)| !accept(key));
            if let Some((key, _)) = records.get(i) {
                return Ok(Some(key.clone()));
            }
            id = *next;
        }
        Ok(None)
    }

    /// Last key accepted by `accept`, which must hold for a prefix of the key order.
    fn scan_backward(&self, mut id: u64, accept: impl Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>> {
        while id != 0 {
            let entry = self.page(id)?;
            let cached = entry.lock();
            let Page::Leaf { prev, records, .. } = &cached.page else {
                return Err(broken_page(id));
            };
            let i = records.partition_point(|(key, _)| accept(key));
            if i > 0 {
                return Ok(Some(records[i - 1].0.clone()));
            }
            id = *prev;
        }
        Ok(None)
    }

    /// Calls `visit` on every record in key order.
    fn for_each(&self, visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut id = self.first;
        while id != 0 {
            let Page::Leaf { next, records, .. } = self.load(id)? else {
                return Err(broken_page(id));
            };
            for (key, value) in &records {
                visit(key, value)?;
            }
            id = next;
        }
        Ok(())
    }

    fn count(&self) -> u64 {
        self.num_records.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if self.writable {
            self.flush_all()?;
            self.write_meta()?;
        }
        self.hash.close()
    }
}

/// File B+ tree engine.
pub(crate) struct TreeEngine {
    path: PathBuf,
    core: RwLock<TreeCore>,
    writable: bool,
    closed: AtomicBool,
    timestamp: AtomicU64,
}

impl TreeEngine {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<TreeEngine> {
        if writable && !options.truncate && HashEngine::peek_closed_cleanly(path)? == Some(false) {
            match options.restore_mode.unwrap_or_default() {
                RestoreMode::Default | RestoreMode::Sync => {
                    let bound = if options.restore_mode == Some(RestoreMode::Sync) {
                        0
                    } else {
                        -1
                    };
                    let tmp = sibling_path(path, ".tmp.restore");
                    let report = TreeEngine::restore(path, &tmp, bound)?;
                    fs::rename(&tmp, path)?;
                    warn!(
                        "{} was not closed cleanly; restored {} records, discarded {}",
                        path.display(),
                        report.restored,
                        report.discarded
                    );
                }
                RestoreMode::ReadOnly | RestoreMode::Noop => {}
            }
        }
        let core = TreeCore::open(path, writable, options, TREE_HASH_DEFAULTS)?;
        info!(
            "opened tree database {} ({} records, {})",
            path.display(),
            core.count(),
            core.params.comparator.name()
        );
        Ok(TreeEngine {
            path: path.to_path_buf(),
            writable: writable && core.hash.is_writable(),
            core: RwLock::new(core),
            closed: AtomicBool::new(false),
            timestamp: AtomicU64::new(wall_time().to_bits()),
        })
    }

    /// Rebuilds a tree from the leaf pages recoverable from `old_path`.
    pub(crate) fn restore(old_path: &Path, new_path: &Path, end_offset: i64) -> Result<RestoreReport> {
        let pages_path = sibling_path(new_path, ".tmp.pages");
        let result = TreeEngine::restore_via(old_path, new_path, &pages_path, end_offset);
        let _ = fs::remove_file(&pages_path);
        result
    }

    fn restore_via(
        old_path: &Path,
        new_path: &Path,
        pages_path: &Path,
        end_offset: i64,
    ) -> Result<RestoreReport> {
        let pages_report = HashEngine::restore(old_path, pages_path, end_offset)?;
        let pages = HashEngine::open(pages_path, false, &OpenOptions::new())?;
        let mut options = OpenOptions::new();
        options.truncate = true;
        if let Ok(meta) = bincode::deserialize::<TreeMeta>(&pages.opaque()) {
            options.key_comparator = KeyComparator::try_from(meta.comparator).ok();
            options.max_page_size = Some(meta.max_page_size);
            options.max_branches = Some(meta.max_branches);
        }
        let mut defaults = pages.params();
        defaults.num_buckets = TREE_HASH_DEFAULTS.num_buckets;
        let mut tree = TreeCore::open(new_path, true, &options, defaults)?;

        let mut leaves = Vec::new();
        let mut discarded = pages_report.discarded;
        pages.process_each(
            &mut |_, data| {
                match data.map(bincode::deserialize::<Page>) {
                    Some(Ok(Page::Leaf { records, .. })) => leaves.push(records),
                    Some(Ok(Page::Inner { .. })) => {}
                    Some(Err(_)) | None => discarded += 1,
                }
                RecordAction::Noop
            },
            false,
        )?;
        pages.close()?;
        for records in leaves {
            for (key, value) in records {
                tree.apply(&key, RecordAction::Set(value))?;
                tree.trim_cache()?;
            }
        }
        let restored = tree.count();
        tree.close()?;
        info!(
            "restored tree {} into {}: {} records, {} discarded",
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

    fn touch(&self) {
        self.timestamp.store(wall_time().to_bits(), Ordering::Relaxed);
    }
}

impl Engine for TreeEngine {
    fn process(&self, key: &[u8], proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check_open()?;
        if writable {
            self.check_writable()?;
        }
        let pending = {
            let core = self.core.read();
            let pending = core.process_in_leaf(key, proc, writable)?;
            core.trim_cache()?;
            pending
        };
        if let Some(action) = pending {
            let mut core = self.core.write();
            core.apply(key, action)?;
            core.trim_cache()?;
        }
        if writable {
            self.touch();
        }
        Ok(())
    }

    fn process_each(&self, proc: &mut Processor<'_>, writable: bool) -> Result<()> {
        self.check_open()?;
        if writable {
            self.check_writable()?;
        }
        let mut core = self.core.write();
        let mut cursor = core.locate(Locate::First)?;
        while let Some(key) = cursor {
            if let Some(value) = core.get(&key)? {
                let action = proc(&key, Some(&value));
                if writable {
                    core.apply(&key, action)?;
                }
            }
            core.trim_cache()?;
            cursor = core.locate(Locate::Gt(&key))?;
        }
        if writable {
            self.touch();
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.core.read().count())
    }

    fn file_size(&self) -> Result<u64> {
        self.check_open()?;
        self.core.read().hash.file_size()
    }

    fn file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn timestamp(&self) -> f64 {
        f64::from_bits(self.timestamp.load(Ordering::Relaxed))
    }

    fn clear(&self) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let mut core = self.core.write();
        core.hash.clear()?;
        core.cache.lock().clear();
        core.root = 1;
        core.first = 1;
        core.last = 1;
        core.next_id = 2;
        core.num_records.store(0, Ordering::Release);
        core.eff_data_size.store(0, Ordering::Release);
        core.store(
            1,
            Page::Leaf {
                prev: 0,
                next: 0,
                records: Vec::new(),
            },
        );
        core.flush_all()?;
        core.write_meta()?;
        self.touch();
        Ok(())
    }

    fn rebuild(&self, options: &OpenOptions) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let mut core = self.core.write();
        core.flush_all()?;

        let mut fresh_options = options.clone();
        fresh_options.truncate = true;
        fresh_options.no_create = false;
        fresh_options.key_comparator = Some(options.key_comparator.unwrap_or(core.params.comparator));
        fresh_options.max_page_size = Some(
            options
                .max_page_size
                .unwrap_or(core.params.max_page_size as u32),
        );
        fresh_options.max_branches = Some(
            options
                .max_branches
                .unwrap_or(core.params.max_branches as u32),
        );
        let mut defaults = core.hash.params();
        defaults.num_buckets = (core.next_id * 2).max(MIN_REBUILD_BUCKETS);

        let tmp = sibling_path(&self.path, ".tmp.rebuild");
        let built = (|| -> Result<()> {
            let mut fresh = TreeCore::open(&tmp, true, &fresh_options, defaults)?;
            core.for_each(&mut |key, value| {
                fresh.apply(key, RecordAction::Set(value.to_vec()))?;
                fresh.trim_cache()
            })?;
            fresh.close()
        })();
        if let Err(err) = built {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &self.path)?;
        let mut reopen = OpenOptions::new();
        reopen.max_cached_pages = Some(core.params.max_cached_pages as u32);
        *core = TreeCore::open(&self.path, true, &reopen, TREE_HASH_DEFAULTS)?;
        info!(
            "rebuilt tree {}: {} records",
            self.path.display(),
            core.count()
        );
        self.touch();
        Ok(())
    }

    fn should_be_rebuilt(&self) -> Result<bool> {
        self.check_open()?;
        let core = self.core.read();
        let pages = core.next_id;
        Ok(pages > core.hash.params().num_buckets || core.hash.should_be_rebuilt()?)
    }

    fn synchronize(&self, hard: bool, options: &SyncOptions) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Ok(());
        }
        let core = self.core.write();
        core.flush_all()?;
        core.write_meta()?;
        core.hash.synchronize(hard, options)
    }

    fn copy_file_data(&self, dest: &Path, hard: bool) -> Result<()> {
        self.check_open()?;
        let core = self.core.write();
        if self.writable {
            core.flush_all()?;
            core.write_meta()?;
        }
        core.hash.copy_file_data(dest, hard)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = self.core.write();
        core.close()?;
        info!("closed tree database {}", self.path.display());
        Ok(())
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let core = self.core.read();
        let depth = core.depth().map(|d| d.to_string()).unwrap_or_default();
        let mut props = vec![
            ("class".to_string(), "TreeDBM".to_string()),
            ("path".to_string(), self.path.display().to_string()),
            ("num_records".to_string(), core.count().to_string()),
            ("tree_level".to_string(), depth),
            ("max_page_size".to_string(), core.params.max_page_size.to_string()),
            ("max_branches".to_string(), core.params.max_branches.to_string()),
            (
                "max_cached_pages".to_string(),
                core.params.max_cached_pages.to_string(),
            ),
            ("cached_pages".to_string(), core.cache.lock().len().to_string()),
            (
                "key_comparator".to_string(),
                core.params.comparator.name().to_string(),
            ),
        ];
        props.extend(
            core.hash
                .inspect()
                .into_iter()
                .filter(|(name, _)| name != "class" && name != "path" && name != "num_records"),
        );
        props
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_healthy(&self) -> bool {
        self.core.read().hash.is_healthy()
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn comparator(&self) -> KeyComparator {
        self.core.read().params.comparator
    }

    fn locate(&self, target: Locate<'_>) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let core = self.core.read();
        let found = core.locate(target)?;
        core.trim_cache()?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(engine: &TreeEngine, key: &[u8], value: &[u8]) {
        let value = value.to_vec();
        engine
            .process(key, &mut |_, _| RecordAction::Set(value.clone()), true)
            .unwrap();
    }

    fn remove(engine: &TreeEngine, key: &[u8]) {
        engine
            .process(key, &mut |_, _| RecordAction::Remove, true)
            .unwrap();
    }

    fn get(engine: &TreeEngine, key: &[u8]) -> Option<Vec<u8>> {
        let mut found = None;
        engine
            .process(
                key,
                &mut |_, value| {
                    found = value.map(<[u8]>::to_vec);
                    RecordAction::Noop
                },
                false,
            )
            .unwrap();
        found
    }

    fn keys_forward(engine: &TreeEngine) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut cursor = engine.locate(Locate::First).unwrap();
        while let Some(key) = cursor {
            cursor = engine.locate(Locate::Gt(&key)).unwrap();
            keys.push(key);
        }
        keys
    }

    fn small_pages() -> OpenOptions {
        OpenOptions::from_params([
            ("max_page_size", "200"),
            ("max_branches", "4"),
            ("max_cached_pages", "8"),
            ("num_buckets", "64"),
        ])
        .unwrap()
    }

    #[test]
    fn splits_and_merges_keep_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkt");
        let engine = TreeEngine::open(&path, true, &small_pages()).unwrap();
        for i in (0..500).rev() {
            set(&engine, format!("{:05}", i).as_bytes(), format!("v{}", i).as_bytes());
        }
        assert_eq!(500, engine.count().unwrap());
        assert!(engine.core.read().depth().unwrap() > 2);
        let keys = keys_forward(&engine);
        assert_eq!(500, keys.len());
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));

        for i in 0..500 {
            if i % 5 != 0 {
                remove(&engine, format!("{:05}", i).as_bytes());
            }
        }
        assert_eq!(100, engine.count().unwrap());
        assert_eq!(100, keys_forward(&engine).len());
        assert_eq!(Some(b"v495".to_vec()), get(&engine, b"00495"));
        assert_eq!(None, get(&engine, b"00496"));

        for i in 0..500 {
            remove(&engine, format!("{:05}", i).as_bytes());
        }
        assert_eq!(0, engine.count().unwrap());
        assert_eq!(1, engine.core.read().depth().unwrap());
        assert_eq!(None, engine.locate(Locate::First).unwrap());
    }

    #[test]
    fn locates_neighbors() {
        let dir = TempDir::new().unwrap();
        let engine = TreeEngine::open(&dir.path().join("db.tkt"), true, &small_pages()).unwrap();
        for i in (0..100).step_by(2) {
            set(&engine, format!("{:03}", i).as_bytes(), b"x");
        }
        assert_eq!(Some(b"010".to_vec()), engine.locate(Locate::Ge(b"009")).unwrap());
        assert_eq!(Some(b"012".to_vec()), engine.locate(Locate::Gt(b"010")).unwrap());
        assert_eq!(Some(b"008".to_vec()), engine.locate(Locate::Le(b"009")).unwrap());
        assert_eq!(Some(b"008".to_vec()), engine.locate(Locate::Lt(b"010")).unwrap());
        assert_eq!(None, engine.locate(Locate::Lt(b"000")).unwrap());
        assert_eq!(None, engine.locate(Locate::Gt(b"098")).unwrap());
        assert_eq!(Some(b"098".to_vec()), engine.locate(Locate::Last).unwrap());
    }

    #[test]
    fn decimal_order_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkt");
        let mut options = small_pages();
        options.key_comparator = Some(KeyComparator::Decimal);
        let engine = TreeEngine::open(&path, true, &options).unwrap();
        for i in [10, 9, 100, 1, 55] {
            set(&engine, i.to_string().as_bytes(), b"n");
        }
        engine.close().unwrap();

        let engine = TreeEngine::open(&path, false, &OpenOptions::new()).unwrap();
        assert_eq!(KeyComparator::Decimal, engine.comparator());
        let keys: Vec<String> = keys_forward(&engine)
            .into_iter()
            .map(|key| String::from_utf8(key).unwrap())
            .collect();
        assert_eq!(vec!["1", "9", "10", "55", "100"], keys);
    }

    #[test]
    fn rebuild_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.tkt");
        let engine = TreeEngine::open(&path, true, &small_pages()).unwrap();
        for i in 0..300 {
            set(&engine, format!("{:04}", i).as_bytes(), &[b'z'; 20]);
        }
        engine
            .rebuild(&OpenOptions::from_params([("max_page_size", "1000")]).unwrap())
            .unwrap();
        assert_eq!(300, engine.count().unwrap());
        assert_eq!(Some(vec![b'z'; 20]), get(&engine, b"0123"));
        engine.close().unwrap();

        let restored = dir.path().join("restored.tkt");
        let report = TreeEngine::restore(&path, &restored, -1).unwrap();
        assert_eq!(300, report.restored);
        let engine = TreeEngine::open(&restored, false, &OpenOptions::new()).unwrap();
        assert_eq!(300, keys_forward(&engine).len());
        assert!(!dir.path().join("restored.tkt.tmp.pages").exists());
    }
}
