//! Header-less stream of length-prefixed records:
//!
//! ```text
//! [key len: varint] [key] [value len: varint] [value] ...
//! ```

use crate::file::File;
use crate::util::{decode_varint, encode_varint};
use crate::{Result, Status};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Appends records to a [`File`] through a write buffer.
///
/// Call [`FlatRecordWriter::flush`] when done; buffered records are lost otherwise.
pub struct FlatRecordWriter<'a> {
    file: &'a File,
    buffer: Vec<u8>,
    buffer_size: usize,
    written: u64,
}

impl<'a> FlatRecordWriter<'a> {
    /// Creates a writer appending to `file`.
    pub fn new(file: &'a File) -> FlatRecordWriter<'a> {
        FlatRecordWriter::with_buffer_size(file, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a writer whose buffer is flushed once it reaches `buffer_size` bytes.
    pub fn with_buffer_size(file: &'a File, buffer_size: usize) -> FlatRecordWriter<'a> {
        FlatRecordWriter {
            file,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            written: 0,
        }
    }

    /// Buffers one record.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        encode_varint(key.len() as u64, &mut self.buffer)?;
        self.buffer.extend_from_slice(key);
        encode_varint(value.len() as u64, &mut self.buffer)?;
        self.buffer.extend_from_slice(value);
        self.written += 1;
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the buffered records to the file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.append(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Number of records written so far.
    pub fn count(&self) -> u64 {
        self.written
    }
}

/// Reads records from a [`File`] from its start.
pub struct FlatRecordReader<'a> {
    file: &'a File,
    file_pos: u64,
    buffer: Vec<u8>,
    cursor: usize,
    buffer_size: usize,
}

impl<'a> FlatRecordReader<'a> {
    /// Creates a reader positioned at the start of `file`.
    pub fn new(file: &'a File) -> FlatRecordReader<'a> {
        FlatRecordReader {
            file,
            file_pos: 0,
            buffer: Vec::new(),
            cursor: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Makes at least `needed` unread bytes available if the file has them.
    fn fill(&mut self, needed: usize) -> Result<usize> {
        let available = self.buffer.len() - self.cursor;
        if available >= needed {
            return Ok(available);
        }
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        let want = needed.max(self.buffer_size) - self.buffer.len();
        let chunk = self.file.read_some(self.file_pos, want)?;
        self.file_pos += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);
        Ok(self.buffer.len())
    }

    fn read_field(&mut self) -> Result<Vec<u8>> {
        self.fill(10)?;
        let (len, read) = decode_varint(&self.buffer[self.cursor..])?;
        self.cursor += read;
        let len = len as usize;
        if self.fill(len)? < len {
            return Err(Status::broken_data("truncated flat record"));
        }
        let field = self.buffer[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        Ok(field)
    }

    /// Reads the next record, or `None` at the end of the stream.
    pub fn read(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.fill(1)? == 0 {
            return Ok(None);
        }
        let key = self.read_field()?;
        let value = self.read_field()?;
        Ok(Some((key, value)))
    }
}

impl Iterator for FlatRecordReader<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileOpenFlags;
    use tempfile::TempDir;

    #[test]
    fn stream_through_small_buffers() {
        let dir = TempDir::new().unwrap();
        let file = File::open(dir.path().join("flat"), true, FileOpenFlags::default()).unwrap();
        let mut writer = FlatRecordWriter::with_buffer_size(&file, 16);
        for i in 0..100 {
            writer
                .write(format!("key{}", i).as_bytes(), &vec![b'v'; i])
                .unwrap();
        }
        writer.write(b"", b"").unwrap();
        writer.flush().unwrap();
        assert_eq!(101, writer.count());

        let mut reader = FlatRecordReader::new(&file);
        reader.buffer_size = 7;
        let records: Vec<_> = reader.collect::<Result<_>>().unwrap();
        assert_eq!(101, records.len());
        assert_eq!((b"key42".to_vec(), vec![b'v'; 42]), records[42]);
        assert_eq!((Vec::new(), Vec::new()), records[100]);
    }

    #[test]
    fn truncated_stream_is_broken() {
        let dir = TempDir::new().unwrap();
        let file = File::open(dir.path().join("flat"), true, FileOpenFlags::default()).unwrap();
        file.append(&[3, b'a', b'b']).unwrap();
        let err = FlatRecordReader::new(&file).read().unwrap_err();
        assert_eq!(crate::StatusCode::BrokenDataError, err.code());
    }
}
