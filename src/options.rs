//! Typed open, rebuild and synchronize configuration.
//!
//! Options reach the library either as a struct built in code, as string pairs (the shape a
//! binding or a command line hands over) or as a TOML document. Every tuning field is an
//! `Option` so that a rebuild can name only what it wants to change.

use std::path::PathBuf;

use serde::Deserialize;

use crate::comparator::KeyComparator;
use crate::engines::{EngineKind, Reducer};
use crate::{Result, Status};

/// How the hash engine writes updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum UpdateMode {
    /// Overwrite records at their existing offset when they fit.
    #[default]
    InPlace,
    /// Never rewrite records; every mutation goes to the file tail.
    Appending,
}

/// Checksum attached to each hash record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CrcMode {
    /// No checksum.
    #[default]
    None,
    /// CRC-8.
    Crc8,
    /// CRC-16.
    Crc16,
    /// CRC-32.
    Crc32,
}

impl CrcMode {
    /// Size of the checksum field in bytes.
    pub fn width(self) -> usize {
        match self {
            CrcMode::None => 0,
            CrcMode::Crc8 => 1,
            CrcMode::Crc16 => 2,
            CrcMode::Crc32 => 4,
        }
    }
}

/// Compression applied to stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CompressionMode {
    /// Values are stored as given.
    #[default]
    None,
    /// Values are compressed with zstd.
    Zstd,
}

/// What to do when a file opened for writing was not closed cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RestoreMode {
    /// Rebuild the file from every recoverable record.
    #[default]
    Default,
    /// Rebuild from the records up to the last synchronized size.
    Sync,
    /// Open read-only and report the database as unhealthy.
    ReadOnly,
    /// Open as-is and report the database as unhealthy.
    Noop,
}

macro_rules! byte_codes {
    ($name:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        impl $name {
            pub(crate) fn to_byte(self) -> u8 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub(crate) fn from_byte(byte: u8) -> Result<Self> {
                match byte {
                    $($code => Ok($name::$variant),)+
                    _ => Err(Status::broken_data(format!(
                        "unknown {} code {}",
                        stringify!($name),
                        byte
                    ))),
                }
            }
        }
    };
}

byte_codes!(UpdateMode { InPlace = 0, Appending = 1 });
byte_codes!(CrcMode { None = 0, Crc8 = 1, Crc16 = 2, Crc32 = 3 });
byte_codes!(CompressionMode { None = 0, Zstd = 1 });

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', "_")
}

impl TryFrom<String> for UpdateMode {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        match normalize(&value).trim_start_matches("update_") {
            "in_place" | "inplace" | "default" => Ok(UpdateMode::InPlace),
            "appending" | "append" => Ok(UpdateMode::Appending),
            _ => Err(Status::invalid_argument(format!("invalid update mode: {}", value))),
        }
    }
}

impl TryFrom<String> for CrcMode {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        match normalize(&value).trim_start_matches("record_crc_") {
            "none" | "default" | "0" => Ok(CrcMode::None),
            "8" | "crc8" => Ok(CrcMode::Crc8),
            "16" | "crc16" => Ok(CrcMode::Crc16),
            "32" | "crc32" => Ok(CrcMode::Crc32),
            _ => Err(Status::invalid_argument(format!("invalid CRC mode: {}", value))),
        }
    }
}

impl TryFrom<String> for CompressionMode {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        match normalize(&value).trim_start_matches("record_comp_") {
            "none" | "default" => Ok(CompressionMode::None),
            "zstd" => Ok(CompressionMode::Zstd),
            _ => Err(Status::invalid_argument(format!(
                "invalid compression mode: {}",
                value
            ))),
        }
    }
}

impl TryFrom<String> for RestoreMode {
    type Error = Status;

    fn try_from(value: String) -> Result<Self> {
        match normalize(&value).trim_start_matches("restore_") {
            "default" => Ok(RestoreMode::Default),
            "sync" => Ok(RestoreMode::Sync),
            "read_only" | "readonly" => Ok(RestoreMode::ReadOnly),
            "noop" => Ok(RestoreMode::Noop),
            _ => Err(Status::invalid_argument(format!("invalid restore mode: {}", value))),
        }
    }
}

/// Options for opening or rebuilding a database.
///
/// Fields that do not apply to the selected engine are ignored. `None` means "use the
/// engine default" on open and "keep the current value" on rebuild.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Engine selector; overrides the path extension.
    pub dbm: Option<EngineKind>,
    /// Discard existing content on open.
    pub truncate: bool,
    /// Fail instead of creating a missing file.
    pub no_create: bool,
    /// Accepted for compatibility; file locks are not taken.
    pub no_wait: bool,
    /// Accepted for compatibility; file locks are not taken.
    pub no_lock: bool,
    /// Synchronize to the device on close.
    pub sync_hard: bool,
    /// Accepted for compatibility; every engine is thread-safe.
    pub concurrent: bool,
    /// Number of hash buckets (hash, tree and tiny engines).
    pub num_buckets: Option<u64>,
    /// Width in bytes of record offsets.
    pub offset_width: Option<u32>,
    /// Record alignment as a power of two.
    pub align_pow: Option<u32>,
    /// Capacity of the free block pool.
    pub fbp_capacity: Option<u32>,
    /// Hash update mode.
    pub update_mode: Option<UpdateMode>,
    /// Hash record checksum.
    pub record_crc_mode: Option<CrcMode>,
    /// Hash record compression.
    pub record_comp_mode: Option<CompressionMode>,
    /// Recovery policy for unclean files.
    pub restore_mode: Option<RestoreMode>,
    /// Maximum packed size of a tree leaf.
    pub max_page_size: Option<u32>,
    /// Maximum number of children of a tree inner node.
    pub max_branches: Option<u32>,
    /// Maximum number of tree pages kept in memory.
    pub max_cached_pages: Option<u32>,
    /// Key order of tree and baby engines.
    pub key_comparator: Option<KeyComparator>,
    /// Skip list step.
    pub step_unit: Option<u32>,
    /// Skip list maximum level.
    pub max_level: Option<u32>,
    /// Skip list sort area budget in bytes.
    pub sort_mem_size: Option<u64>,
    /// Skip list writes arrive in ascending key order.
    pub insert_in_order: Option<bool>,
    /// Skip list record cache capacity.
    pub max_cached_records: Option<u32>,
    /// Cache engine record cap.
    pub cap_rec_num: Option<u64>,
    /// Cache engine memory cap in bytes.
    pub cap_mem_size: Option<u64>,
    /// Number of shards, 0 to discover an existing shard set.
    pub num_shards: Option<u32>,
    /// Skip unreadable records on rebuild.
    pub skip_broken_records: bool,
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(Status::invalid_argument(format!("invalid boolean for {}: {}", key, value))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Status::invalid_argument(format!("invalid number for {}: {}", key, value)))
}

impl OpenOptions {
    /// Options with every field at its default.
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Parses string pairs such as `("num_buckets", "100")`. Unknown keys are ignored.
    pub fn from_params<I, K, V>(params: I) -> Result<OpenOptions>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = OpenOptions::default();
        for (key, value) in params {
            options.set_param(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    /// Parses a TOML document whose top-level keys are option names.
    pub fn from_toml_str(text: &str) -> Result<OpenOptions> {
        Ok(toml::from_str(text)?)
    }

    /// Sets one option from its string form.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<()> {
        let owned = value.to_string();
        match key {
            "dbm" => self.dbm = Some(EngineKind::try_from(owned)?),
            "truncate" => self.truncate = parse_bool(key, value)?,
            "no_create" => self.no_create = parse_bool(key, value)?,
            "no_wait" => self.no_wait = parse_bool(key, value)?,
            "no_lock" => self.no_lock = parse_bool(key, value)?,
            "sync_hard" => self.sync_hard = parse_bool(key, value)?,
            "concurrent" => self.concurrent = parse_bool(key, value)?,
            "num_buckets" => self.num_buckets = Some(parse_num(key, value)?),
            "offset_width" => self.offset_width = Some(parse_num(key, value)?),
            "align_pow" => self.align_pow = Some(parse_num(key, value)?),
            "fbp_capacity" => self.fbp_capacity = Some(parse_num(key, value)?),
            "update_mode" => self.update_mode = Some(UpdateMode::try_from(owned)?),
            "record_crc_mode" => self.record_crc_mode = Some(CrcMode::try_from(owned)?),
            "record_comp_mode" => {
                self.record_comp_mode = Some(CompressionMode::try_from(owned)?)
            }
            "restore_mode" => self.restore_mode = Some(RestoreMode::try_from(owned)?),
            "max_page_size" => self.max_page_size = Some(parse_num(key, value)?),
            "max_branches" => self.max_branches = Some(parse_num(key, value)?),
            "max_cached_pages" => self.max_cached_pages = Some(parse_num(key, value)?),
            "key_comparator" => self.key_comparator = Some(KeyComparator::try_from(owned)?),
            "step_unit" => self.step_unit = Some(parse_num(key, value)?),
            "max_level" => self.max_level = Some(parse_num(key, value)?),
            "sort_mem_size" => self.sort_mem_size = Some(parse_num(key, value)?),
            "insert_in_order" => self.insert_in_order = Some(parse_bool(key, value)?),
            "max_cached_records" => self.max_cached_records = Some(parse_num(key, value)?),
            "cap_rec_num" => self.cap_rec_num = Some(parse_num(key, value)?),
            "cap_mem_size" => self.cap_mem_size = Some(parse_num(key, value)?),
            "num_shards" => self.num_shards = Some(parse_num(key, value)?),
            "skip_broken_records" => self.skip_broken_records = parse_bool(key, value)?,
            _ => log::debug!("ignoring unknown option {}", key),
        }
        Ok(())
    }
}

/// Options for `synchronize`.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Other skip list files merged into the database.
    pub merge: Vec<PathBuf>,
    /// How duplicate keys are resolved while merging.
    pub reducer: Option<Reducer>,
}

impl SyncOptions {
    /// Parses `merge` (colon-separated paths) and `reducer`. Unknown keys are ignored.
    pub fn from_params<I, K, V>(params: I) -> Result<SyncOptions>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = SyncOptions::default();
        for (key, value) in params {
            match key.as_ref() {
                "merge" => {
                    options.merge = value
                        .as_ref()
                        .split(':')
                        .filter(|path| !path.is_empty())
                        .map(PathBuf::from)
                        .collect()
                }
                "reducer" => options.reducer = Some(Reducer::try_from(value.as_ref().to_string())?),
                _ => {}
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_typed() {
        let options = OpenOptions::from_params([
            ("dbm", "HashDBM"),
            ("num_buckets", "100"),
            ("update_mode", "UPDATE_APPENDING"),
            ("record_crc_mode", "RECORD_CRC_32"),
            ("record_comp_mode", "RECORD_COMP_ZSTD"),
            ("restore_mode", "RESTORE_READ_ONLY"),
            ("key_comparator", "DecimalKeyComparator"),
            ("truncate", "true"),
            ("no_such_thing", "whatever"),
        ])
        .unwrap();
        assert_eq!(Some(EngineKind::Hash), options.dbm);
        assert_eq!(Some(100), options.num_buckets);
        assert_eq!(Some(UpdateMode::Appending), options.update_mode);
        assert_eq!(Some(CrcMode::Crc32), options.record_crc_mode);
        assert_eq!(Some(CompressionMode::Zstd), options.record_comp_mode);
        assert_eq!(Some(RestoreMode::ReadOnly), options.restore_mode);
        assert_eq!(Some(KeyComparator::Decimal), options.key_comparator);
        assert!(options.truncate);
        assert_eq!(None, options.max_page_size);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = OpenOptions::from_params([("num_buckets", "many")]).unwrap_err();
        assert_eq!(crate::StatusCode::InvalidArgumentError, err.code());
        let err = OpenOptions::from_params([("update_mode", "sideways")]).unwrap_err();
        assert_eq!(crate::StatusCode::InvalidArgumentError, err.code());
    }

    #[test]
    fn toml_document() {
        let options = OpenOptions::from_toml_str(
            "dbm = \"tree\"\nmax_page_size = 4000\nkey_comparator = \"decimal\"\nsync_hard = true\n",
        )
        .unwrap();
        assert_eq!(Some(EngineKind::Tree), options.dbm);
        assert_eq!(Some(4000), options.max_page_size);
        assert_eq!(Some(KeyComparator::Decimal), options.key_comparator);
        assert!(options.sync_hard);
        assert!(OpenOptions::from_toml_str("num_buckets = \"x\"").is_err());
    }

    #[test]
    fn sync_params() {
        let options =
            SyncOptions::from_params([("merge", "a.tks:b.tks"), ("reducer", "ReduceToLast")])
                .unwrap();
        assert_eq!(vec![PathBuf::from("a.tks"), PathBuf::from("b.tks")], options.merge);
        assert_eq!(Some(Reducer::Last), options.reducer);
    }
}
