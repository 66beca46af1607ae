use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Result, Status};

/// Hash deciding the bucket of a key inside hash-based engines.
pub(crate) fn primary_hash(data: &[u8], num_buckets: u64) -> u64 {
    const MUL: u64 = 0xc6a4_a793_5bd1_e995;
    const SHIFT: u32 = 47;
    let mut hash: u64 = 19_780_211 ^ (data.len() as u64).wrapping_mul(MUL);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        word = word.wrapping_mul(MUL);
        word ^= word >> SHIFT;
        word = word.wrapping_mul(MUL);
        hash ^= word;
        hash = hash.wrapping_mul(MUL);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        for (i, byte) in rest.iter().enumerate() {
            hash ^= (*byte as u64) << (8 * i);
        }
        hash = hash.wrapping_mul(MUL);
    }
    hash ^= hash >> SHIFT;
    hash = hash.wrapping_mul(MUL);
    hash ^= hash >> SHIFT;
    hash % num_buckets.max(1)
}

/// Hash independent of [`primary_hash`], used for shard routing and key lock stripes.
pub(crate) fn secondary_hash(data: &[u8], modulus: u64) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash ^= hash >> 32;
    hash % modulus.max(1)
}

pub(crate) fn varint_len(mut value: u64) -> usize {
    let mut len = 0;
    while value >= 0x80 {
        len += 1;
        value >>= 7;
    }
    len + 1
}

pub(crate) fn encode_varint(mut value: u64, stream: &mut impl Write) -> io::Result<usize> {
    let mut bytes_written = 0;
    while value >= 0x80 {
        stream.write_all(&[((value & 0x7F) | 0x80) as u8])?;
        bytes_written += 1;
        value >>= 7;
    }
    stream.write_all(&[value as u8])?;
    bytes_written += 1;
    Ok(bytes_written)
}

/// Decodes a varint at the head of `bytes`, returning the value and the bytes consumed.
pub(crate) fn decode_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;
        value |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok((value, bytes_read));
        }

        shift += 7;
        if shift >= 64 {
            return Err(Status::broken_data("varint too large"));
        }
    }
    Err(Status::broken_data("varint not terminated"))
}

/// Writes the low `width` bytes of `value` in big-endian order.
pub(crate) fn write_fixed(buf: &mut Vec<u8>, value: u64, width: usize) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[8 - width..]);
}

pub(crate) fn read_fixed(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
}

/// Interprets up to 8 leading bytes as a big-endian integer.
pub fn be_bytes_to_int(bytes: &[u8]) -> i64 {
    let len = bytes.len().min(8);
    read_fixed(&bytes[..len]) as i64
}

/// Encodes an integer as 8 big-endian bytes.
pub fn int_to_be_bytes(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Levenshtein distance between two sequences.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, item_a) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, item_b) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(item_a != item_b);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }
    row[b.len()]
}

/// Seconds since the Unix epoch.
pub(crate) fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// `path` with `suffix` appended to its file name, for temporary files beside a database.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varints() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            buf.clear();
            let written = encode_varint(value, &mut buf).unwrap();
            assert_eq!(varint_len(value), written);
            assert_eq!((value, written), decode_varint(&buf).unwrap());
        }
        assert!(decode_varint(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn big_endian_ints() {
        assert_eq!(0x0102, be_bytes_to_int(&[1, 2]));
        assert_eq!(-5, be_bytes_to_int(&int_to_be_bytes(-5)));
        assert_eq!(0, be_bytes_to_int(b""));
        let mut buf = Vec::new();
        write_fixed(&mut buf, 0x01_0203, 3);
        assert_eq!(vec![1, 2, 3], buf);
        assert_eq!(0x01_0203, read_fixed(&buf));
    }

    #[test]
    fn edit_distances() {
        assert_eq!(0, edit_distance(b"abc", b"abc"));
        assert_eq!(3, edit_distance(b"", b"abc"));
        assert_eq!(3, edit_distance(b"kitten", b"sitting"));
        assert_eq!(1, edit_distance(&['a', 'b'], &['a']));
    }

    #[test]
    fn hashes_are_bounded() {
        for key in [&b""[..], b"a", b"hello world, longer than eight"] {
            assert!(primary_hash(key, 100) < 100);
            assert!(secondary_hash(key, 7) < 7);
        }
        assert_eq!(primary_hash(b"same", 1000), primary_hash(b"same", 1000));
    }
}
