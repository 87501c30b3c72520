//! The seek index of a recording.
//!
//! One fixed-size record per frame, appended in arrival order:
//!
//! ```text
//! +----------------+-------+------------+
//! | byte offset    | flags | file number|
//! | u40 LE         | u8    | u16 LE     |
//! +----------------+-------+------------+
//! ```
//!
//! Flags bit 0 marks an independently decodable frame; the offset is
//! relative to the start of the numbered segment file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

/// File name of the index inside the recording directory.
pub const INDEX_FILE_NAME: &str = "index";

const RECORD_SIZE: usize = 8;

/// A single index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub independent: bool,
    pub file_number: u16,
    pub offset: u64,
}

/// Append-only writer for the index file.
pub struct IndexFile {
    file: File,
}

impl IndexFile {
    /// Create (or append to) the index in `dir`.
    pub fn create(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(INDEX_FILE_NAME))?;
        Ok(Self { file })
    }

    pub fn write(&mut self, independent: bool, file_number: u16, offset: u64) -> io::Result<()> {
        let mut record = BytesMut::with_capacity(RECORD_SIZE);
        record.put_uint_le(offset & 0xFF_FFFF_FFFF, 5);
        record.put_u8(independent as u8);
        record.put_u16_le(file_number);
        self.file.write_all(&record)
    }

    /// Read back all records of the index in `dir`.
    pub fn read_all(dir: &Path) -> io::Result<Vec<IndexEntry>> {
        let mut data = Vec::new();
        File::open(dir.join(INDEX_FILE_NAME))?.read_to_end(&mut data)?;
        let mut buf = &data[..];
        let mut entries = Vec::new();
        while buf.len() >= RECORD_SIZE {
            let offset = buf.get_uint_le(5);
            let flags = buf.get_u8();
            let file_number = buf.get_u16_le();
            entries.push(IndexEntry {
                independent: flags & 0x01 != 0,
                file_number,
                offset,
            });
        }
        Ok(entries)
    }
}
