//! Index block — the trailing table of member records.
//!
//! # On-disk layout (big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   index_size   total byte length of all entries (BE u32)
//!    4    ...   entries, packed back to back
//! ```
//!
//! Each entry:
//!
//! ```text
//!    0      4   offset   absolute offset of the member payload (BE u32)
//!    4      4   size     compressed payload length in bytes   (BE u32)
//!    8      4   mode     POSIX file mode bitmap               (BE u32)
//!   12    ...   name     NUL-terminated UTF-8, '/'-separated, no leading '/'
//! ```
//!
//! Entries are sorted by `offset`, offsets strictly increase, every payload
//! lies before the index, and names are unique.  The reader rejects any
//! archive violating these before handing out a single entry.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::error::{MarError, Result};
use crate::format::{read_name, write_cstring, HEADER_SIZE, MAX_NAME_LEN};

/// One member record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Absolute offset of the (compressed) payload.
    pub offset: u32,
    /// Payload length on disk, after compression.
    pub size: u32,
    /// POSIX mode bitmap.  Only the low 9 permission bits are honored on
    /// extraction; the rest survive a read/write round trip untouched.
    pub mode: u32,
    /// `/`-separated member path, no leading slash.
    pub name: String,
}

impl IndexEntry {
    /// Encoded byte length of this entry inside the index block.
    pub fn encoded_len(&self) -> usize {
        12 + self.name.len() + 1
    }

    fn read<R: Read>(r: &mut R) -> Result<Self> {
        let offset = r.read_u32::<BigEndian>()?;
        let size = r.read_u32::<BigEndian>()?;
        let mode = r.read_u32::<BigEndian>()?;
        let name = read_name(r)?;
        Ok(Self { offset, size, mode, name })
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.offset)?;
        w.write_u32::<BigEndian>(self.size)?;
        w.write_u32::<BigEndian>(self.mode)?;
        write_cstring(w, &self.name, MAX_NAME_LEN)?;
        Ok(())
    }
}

/// Reject names the index cannot represent: empty, over-long, leading `/`,
/// empty path components, or `.`/`..` components.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MarError::MalformedIndex("empty member name".into()));
    }
    if name.len() + 1 > MAX_NAME_LEN {
        return Err(MarError::NameTooLong { max: MAX_NAME_LEN });
    }
    if name.starts_with('/') {
        return Err(MarError::MalformedIndex(format!(
            "member name {name:?} has a leading slash"
        )));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(MarError::MalformedIndex(format!(
                "member name {name:?} has an empty path component"
            )));
        }
        if component == "." || component == ".." {
            return Err(MarError::MalformedIndex(format!(
                "member name {name:?} has a relative path component"
            )));
        }
    }
    Ok(())
}

/// Read and validate the full index block at `index_offset`.
pub fn read_index<R: Read + Seek>(
    r: &mut R,
    index_offset: u32,
    file_len: u64,
) -> Result<Vec<IndexEntry>> {
    if (index_offset as u64) < HEADER_SIZE {
        return Err(MarError::MalformedIndex(format!(
            "index offset {index_offset} overlaps the header"
        )));
    }
    if index_offset as u64 + 4 > file_len {
        return Err(MarError::TruncatedFile {
            offset: index_offset as u64,
            needed: 4,
        });
    }

    r.seek(SeekFrom::Start(index_offset as u64))?;
    let index_size = r.read_u32::<BigEndian>()?;
    let index_end = index_offset as u64 + 4 + index_size as u64;
    if index_end > file_len {
        return Err(MarError::TruncatedFile {
            offset: index_offset as u64 + 4,
            needed: index_end - file_len,
        });
    }

    // Pull the whole table into memory and parse it to exhaustion.
    let mut raw = vec![0u8; index_size as usize];
    r.read_exact(&mut raw)?;
    let mut cursor = Cursor::new(raw);

    let mut entries = Vec::new();
    while (cursor.position() as usize) < cursor.get_ref().len() {
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if remaining < 13 {
            return Err(MarError::MalformedIndex(format!(
                "{remaining} trailing byte(s) after the last complete entry"
            )));
        }
        entries.push(IndexEntry::read(&mut cursor)?);
    }

    validate_entries(&entries, index_offset)?;
    Ok(entries)
}

fn validate_entries(entries: &[IndexEntry], index_offset: u32) -> Result<()> {
    let mut names: HashSet<&str> = HashSet::with_capacity(entries.len());
    let mut prev_offset: Option<u32> = None;

    for entry in entries {
        check_name(&entry.name)?;

        if let Some(prev) = prev_offset {
            if entry.offset <= prev {
                return Err(MarError::IndexNotSorted {
                    name: entry.name.clone(),
                    offset: entry.offset,
                });
            }
        }
        prev_offset = Some(entry.offset);

        let start = entry.offset as u64;
        let end = start + entry.size as u64;
        if start < HEADER_SIZE || end > index_offset as u64 {
            return Err(MarError::OffsetOutOfRange {
                name: entry.name.clone(),
                start,
                end,
            });
        }

        if !names.insert(&entry.name) {
            return Err(MarError::DuplicateName(entry.name.clone()));
        }
    }
    Ok(())
}

/// Write the index block: `index_size` prefix followed by the entries.
pub fn write_index<W: Write>(w: &mut W, entries: &[IndexEntry]) -> Result<()> {
    let index_size: usize = entries.iter().map(IndexEntry::encoded_len).sum();
    w.write_u32::<BigEndian>(index_size as u32)?;
    for entry in entries {
        entry.write(w)?;
    }
    Ok(())
}
