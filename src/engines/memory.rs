use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};

use crate::file::{File, FileOpenFlags};
use crate::flat_records::{FlatRecordReader, FlatRecordWriter};
use crate::options::OpenOptions;
use crate::util::{sibling_path, wall_time};
use crate::{Result, Status};

/// Flat record file an in-memory engine loads on open and saves on synchronize and close.
///
/// An empty path means the engine is volatile.
pub(crate) struct Backing {
    path: Option<PathBuf>,
    writable: bool,
    sync_hard: bool,
}

impl Backing {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> Result<Backing> {
        if path.as_os_str().is_empty() {
            return Ok(Backing {
                path: None,
                writable,
                sync_hard: false,
            });
        }
        let flags = FileOpenFlags {
            truncate: options.truncate,
            no_create: options.no_create,
        };
        File::open(path, writable, flags)?;
        Ok(Backing {
            path: Some(path.to_path_buf()),
            writable,
            sync_hard: options.sync_hard,
        })
    }

    pub(crate) fn path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|path| fs::metadata(path).ok())
            .map_or(0, |meta| meta.len())
    }

    /// Feeds every stored record to `visit`.
    pub(crate) fn load(&self, visit: &mut dyn FnMut(Vec<u8>, Vec<u8>)) -> Result<u64> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let file = File::open(path, false, FileOpenFlags::default())?;
        let mut count = 0;
        for record in FlatRecordReader::new(&file) {
            let (key, value) = record?;
            visit(key, value);
            count += 1;
        }
        info!("loaded {} records from {}", count, path.display());
        Ok(count)
    }

    /// Replaces the file with the records `dump` writes; a no-op for volatile or read-only
    /// engines.
    pub(crate) fn save(
        &self,
        hard: bool,
        dump: &mut dyn FnMut(&mut FlatRecordWriter<'_>) -> Result<()>,
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.writable {
            return Ok(());
        }
        let tmp = sibling_path(path, ".tmp.save");
        let written = (|| -> Result<u64> {
            let file = File::open(
                &tmp,
                true,
                FileOpenFlags {
                    truncate: true,
                    no_create: false,
                },
            )?;
            let mut writer = FlatRecordWriter::new(&file);
            dump(&mut writer)?;
            writer.flush()?;
            file.synchronize(hard || self.sync_hard)?;
            Ok(writer.count())
        })();
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        fs::rename(&tmp, path)?;
        debug!("saved {} records to {}", written, path.display());
        Ok(())
    }
}

/// Open/closed state, writability and modification time shared by the in-memory engines.
pub(crate) struct Lifecycle {
    writable: bool,
    closed: AtomicBool,
    timestamp: AtomicU64,
}

impl Lifecycle {
    pub(crate) fn new(writable: bool) -> Lifecycle {
        Lifecycle {
            writable,
            closed: AtomicBool::new(false),
            timestamp: AtomicU64::new(wall_time().to_bits()),
        }
    }

    pub(crate) fn check(&self, writable: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::precondition("closed database"));
        }
        if writable && !self.writable {
            return Err(Status::precondition("not writable database"));
        }
        Ok(())
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    /// Marks the engine closed; false if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn touch(&self) {
        self.timestamp.store(wall_time().to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn timestamp(&self) -> f64 {
        f64::from_bits(self.timestamp.load(Ordering::Relaxed))
    }
}
