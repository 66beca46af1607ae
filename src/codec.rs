// Hash record format (binary):
// [magic: u8] [child: offset_width BE] [key len: varint] [value len: varint] [pad len: varint]
// [crc: 0/1/2/4 bytes BE] [key] [stored value] [padding]
//
// Magic:
// - SET: live record (or superseded, in appending mode)
// - REMOVE: tombstone written by appending mode
// - VOID: slot freed by in-place mode; only the magic byte is rewritten
//
// The child field holds the next record of the same bucket chain, shifted right by the
// alignment power. Every record starts and ends on an alignment boundary.

use std::borrow::Cow;

use crate::options::{CompressionMode, CrcMode};
use crate::util::{align_up, decode_varint, encode_varint, read_fixed, varint_len, write_fixed};
use crate::{Result, Status};

const ZSTD_LEVEL: i32 = 3;

/// Kind of a framed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordKind {
    Set = 0xC8,
    Remove = 0xD9,
    Void = 0xEA,
}

impl TryFrom<u8> for RecordKind {
    type Error = Status;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xC8 => Ok(RecordKind::Set),
            0xD9 => Ok(RecordKind::Remove),
            0xEA => Ok(RecordKind::Void),
            _ => Err(Status::broken_data(format!("invalid record magic: {:#x}", value))),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordHeader {
    pub kind: RecordKind,
    pub child: u64,
    pub key_size: usize,
    pub value_size: usize,
    pub pad_size: usize,
    pub crc: u32,
    pub header_size: usize,
}

impl RecordHeader {
    pub(crate) fn body_size(&self) -> usize {
        self.header_size + self.key_size + self.value_size
    }

    pub(crate) fn slot_size(&self) -> u64 {
        (self.body_size() + self.pad_size) as u64
    }
}

/// A decoded record; `value` is already decompressed.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub offset: u64,
    pub kind: RecordKind,
    pub child: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub slot_size: u64,
}

/// Frames records for one hash file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordCodec {
    offset_width: usize,
    align_pow: u32,
    crc: CrcMode,
    comp: CompressionMode,
}

impl RecordCodec {
    pub(crate) fn new(
        offset_width: u32,
        align_pow: u32,
        crc: CrcMode,
        comp: CompressionMode,
    ) -> RecordCodec {
        RecordCodec {
            offset_width: offset_width as usize,
            align_pow,
            crc,
            comp,
        }
    }

    pub(crate) fn alignment(&self) -> u64 {
        1 << self.align_pow
    }

    pub(crate) fn offset_width(&self) -> usize {
        self.offset_width
    }

    /// Upper bound of the header size, used to size the first read of a record.
    pub(crate) fn max_header_size(&self) -> usize {
        1 + self.offset_width + 3 * 10 + self.crc.width()
    }

    /// Largest file offset an offset field can address.
    pub(crate) fn max_offset(&self) -> u64 {
        let limit = 1u128 << (8 * self.offset_width as u32).min(64);
        let shifted = limit << self.align_pow;
        u64::try_from(shifted).unwrap_or(u64::MAX)
    }

    /// Encodes an absolute offset into an offset field.
    pub(crate) fn encode_offset(&self, offset: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.offset_width);
        write_fixed(&mut buf, offset >> self.align_pow, self.offset_width);
        buf
    }

    /// Decodes an offset field into an absolute offset.
    pub(crate) fn decode_offset(&self, field: &[u8]) -> u64 {
        read_fixed(field) << self.align_pow
    }

    /// Applies the configured compression to a value.
    pub(crate) fn store_value<'a>(&self, value: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        match self.comp {
            CompressionMode::None => Ok(Cow::Borrowed(value)),
            CompressionMode::Zstd => Ok(Cow::Owned(zstd::encode_all(value, ZSTD_LEVEL)?)),
        }
    }

    fn restore_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match self.comp {
            CompressionMode::None => Ok(stored.to_vec()),
            CompressionMode::Zstd => zstd::decode_all(stored)
                .map_err(|err| Status::broken_data(format!("decompression failed: {}", err))),
        }
    }

    fn checksum(&self, key: &[u8], stored: &[u8]) -> u32 {
        match self.crc {
            CrcMode::None => 0,
            CrcMode::Crc8 => crc8(&[key, stored]) as u32,
            CrcMode::Crc16 => crc16(&[key, stored]) as u32,
            CrcMode::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(key);
                hasher.update(stored);
                hasher.finalize()
            }
        }
    }

    fn base_size(&self, key: &[u8], stored: &[u8]) -> usize {
        1 + self.offset_width
            + varint_len(key.len() as u64)
            + varint_len(stored.len() as u64)
            + self.crc.width()
            + key.len()
            + stored.len()
    }

    /// Padding and pad field width that make a record of `base` bytes (excluding the pad
    /// length field) exactly `slot` bytes long, if there are any.
    fn fit_padding(base: usize, slot: usize) -> Option<(usize, usize)> {
        (1..=10).find_map(|field_len| {
            let pad = slot.checked_sub(base + field_len)?;
            (varint_len(pad as u64) <= field_len).then_some((pad, field_len))
        })
    }

    /// Size of the aligned slot a new record would occupy.
    pub(crate) fn required_size(&self, key: &[u8], stored: &[u8]) -> u64 {
        let base = self.base_size(key, stored);
        let alignment = self.alignment();
        let mut slot = align_up(base as u64 + 1, alignment);
        while Self::fit_padding(base, slot as usize).is_none() {
            slot += alignment;
        }
        slot
    }

    /// Frames a record filling exactly `slot` bytes, or `None` if it does not fit.
    pub(crate) fn encode(
        &self,
        kind: RecordKind,
        child: u64,
        key: &[u8],
        stored: &[u8],
        slot: u64,
    ) -> Option<Vec<u8>> {
        let (pad, pad_field) = Self::fit_padding(self.base_size(key, stored), slot as usize)?;
        let mut buf = Vec::with_capacity(slot as usize);
        buf.push(kind as u8);
        buf.extend_from_slice(&self.encode_offset(child));
        let _ = encode_varint(key.len() as u64, &mut buf);
        let _ = encode_varint(stored.len() as u64, &mut buf);
        write_padded_varint(&mut buf, pad as u64, pad_field);
        let crc = self.checksum(key, stored);
        match self.crc {
            CrcMode::None => {}
            CrcMode::Crc8 => buf.push(crc as u8),
            CrcMode::Crc16 => buf.extend_from_slice(&(crc as u16).to_be_bytes()),
            CrcMode::Crc32 => buf.extend_from_slice(&crc.to_be_bytes()),
        }
        buf.extend_from_slice(key);
        buf.extend_from_slice(stored);
        buf.resize(slot as usize, 0);
        Some(buf)
    }

    /// Parses the header at the head of `bytes`.
    pub(crate) fn parse_header(&self, bytes: &[u8]) -> Result<RecordHeader> {
        let kind = RecordKind::try_from(
            *bytes
                .first()
                .ok_or_else(|| Status::broken_data("empty record"))?,
        )?;
        let mut pos = 1;
        let child_field = bytes
            .get(pos..pos + self.offset_width)
            .ok_or_else(|| Status::broken_data("truncated record header"))?;
        let child = self.decode_offset(child_field);
        pos += self.offset_width;
        let (key_size, read) = decode_varint(&bytes[pos..])?;
        pos += read;
        let (value_size, read) = decode_varint(&bytes[pos..])?;
        pos += read;
        let (pad_size, read) = decode_varint(&bytes[pos..])?;
        pos += read;
        let crc_field = bytes
            .get(pos..pos + self.crc.width())
            .ok_or_else(|| Status::broken_data("truncated record header"))?;
        let crc = read_fixed(crc_field) as u32;
        pos += self.crc.width();
        let limit = u32::MAX as u64;
        if key_size > limit || value_size > limit || pad_size > limit {
            return Err(Status::broken_data("record size out of range"));
        }
        Ok(RecordHeader {
            kind,
            child,
            key_size: key_size as usize,
            value_size: value_size as usize,
            pad_size: pad_size as usize,
            crc,
            header_size: pos,
        })
    }

    /// Decodes a record from bytes holding at least its header, key and stored value.
    pub(crate) fn decode(&self, offset: u64, header: &RecordHeader, bytes: &[u8]) -> Result<Record> {
        let key_end = header.header_size + header.key_size;
        let body = bytes
            .get(header.header_size..header.body_size())
            .ok_or_else(|| Status::broken_data("truncated record body"))?;
        let key = &bytes[header.header_size..key_end];
        let stored = &body[header.key_size..];
        if header.kind != RecordKind::Void && self.checksum(key, stored) != header.crc {
            return Err(Status::broken_data(format!("checksum mismatch at {}", offset)));
        }
        let value = if header.kind == RecordKind::Set {
            self.restore_value(stored)?
        } else {
            Vec::new()
        };
        Ok(Record {
            offset,
            kind: header.kind,
            child: header.child,
            key: key.to_vec(),
            value,
            slot_size: header.slot_size(),
        })
    }
}

/// Writes `value` as a varint of exactly `width` bytes, using redundant continuation bytes
/// when the minimal form is shorter.
fn write_padded_varint(buf: &mut Vec<u8>, mut value: u64, width: usize) {
    for i in 0..width {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        buf.push(if i + 1 < width { low | 0x80 } else { low });
    }
}

/// CRC-8 (polynomial 0x07) over concatenated slices.
pub(crate) fn crc8(parts: &[&[u8]]) -> u8 {
    let mut crc: u8 = 0;
    for byte in parts.iter().flat_map(|part| part.iter()) {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

/// CRC-16/CCITT-FALSE over concatenated slices.
pub(crate) fn crc16(parts: &[&[u8]]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in parts.iter().flat_map(|part| part.iter()) {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &RecordCodec, key: &[u8], value: &[u8]) -> Record {
        let stored = codec.store_value(value).unwrap();
        let slot = codec.required_size(key, &stored);
        assert_eq!(0, slot % codec.alignment());
        let bytes = codec.encode(RecordKind::Set, 4096, key, &stored, slot).unwrap();
        assert_eq!(slot as usize, bytes.len());
        let header = codec.parse_header(&bytes).unwrap();
        assert_eq!(slot, header.slot_size());
        codec.decode(64, &header, &bytes).unwrap()
    }

    #[test]
    fn known_checksums() {
        assert_eq!(0xF4, crc8(&[b"123456789"]));
        assert_eq!(0x29B1, crc16(&[b"1234", b"56789"]));
    }

    #[test]
    fn frames_with_every_mode() {
        for crc in [CrcMode::None, CrcMode::Crc8, CrcMode::Crc16, CrcMode::Crc32] {
            for comp in [CompressionMode::None, CompressionMode::Zstd] {
                let codec = RecordCodec::new(4, 3, crc, comp);
                let value = b"value".repeat(50);
                let record = roundtrip(&codec, b"key", &value);
                assert_eq!(b"key".to_vec(), record.key);
                assert_eq!(value, record.value);
                assert_eq!(4096, record.child);
            }
        }
    }

    #[test]
    fn large_alignment_padding() {
        let codec = RecordCodec::new(4, 10, CrcMode::None, CompressionMode::None);
        let record = roundtrip(&codec, b"k", b"v");
        assert_eq!(1024, record.slot_size);
        let stored = codec.store_value(b"much longer value").unwrap();
        assert!(codec.encode(RecordKind::Set, 0, b"k", &stored, 1024).is_some());
        assert!(codec.encode(RecordKind::Set, 0, b"k", &[0; 2000], 1024).is_none());
    }

    #[test]
    fn every_slot_size_is_reachable() {
        let codec = RecordCodec::new(4, 0, CrcMode::None, CompressionMode::None);
        for len in 0..300 {
            let value = vec![b'x'; len];
            for extra in 0..200 {
                let slot = codec.required_size(b"key", &value) + extra;
                let bytes = codec.encode(RecordKind::Set, 0, b"key", &value, slot).unwrap();
                let header = codec.parse_header(&bytes).unwrap();
                assert_eq!(slot, header.slot_size());
            }
        }
    }

    #[test]
    fn detects_corruption() {
        let codec = RecordCodec::new(4, 3, CrcMode::Crc32, CompressionMode::None);
        let slot = codec.required_size(b"key", b"value");
        let mut bytes = codec.encode(RecordKind::Set, 0, b"key", b"value", slot).unwrap();
        let header = codec.parse_header(&bytes).unwrap();
        let last = header.body_size() - 1;
        bytes[last] ^= 0xFF;
        let err = codec.decode(0, &header, &bytes).unwrap_err();
        assert_eq!(crate::StatusCode::BrokenDataError, err.code());
        bytes[0] = 0x00;
        assert!(codec.parse_header(&bytes).is_err());
    }
}
