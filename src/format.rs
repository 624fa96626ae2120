//! Format primitives — magic, fixed header, bounded strings.
//!
//! # On-disk layout (all integers big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic         = "MAR1"  (4 ASCII bytes)
//!    4      4   index_offset  absolute offset of the index block (BE u32)
//! ```
//!
//! Everything after the 8-byte header is positional: an optional signature
//! block, an optional additional block, the member payloads, and finally
//! the index block that `index_offset` points at.  Every multi-byte integer
//! in the format is an unsigned big-endian value; strings are NUL-terminated
//! with a hard upper bound.  This is frozen — there is no version field and
//! no negotiation.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{MarError, Result};

pub const MAGIC: &[u8; 4] = b"MAR1";
pub const HEADER_SIZE: u64 = 8;

/// Upper bound on a member name, including the NUL terminator.
pub const MAX_NAME_LEN: usize = 256;
/// Upper bound on each ProductInformation field, including the terminator.
pub const MAX_PRODUCT_INFO_FIELD: usize = 64;
/// A signature block declaring more entries than this is not a signature
/// block; the reader treats the file as unsigned.
pub const MAX_SIGNATURES: u32 = 8;
/// Hard cap on a single signature's byte length.
pub const MAX_SIGNATURE_LEN: u32 = 2048;

/// Read a NUL-terminated UTF-8 string of at most `max` bytes (terminator
/// included).  EOF before the terminator, non-UTF-8 content, and an
/// over-long string are all `MalformedString`.
pub fn read_cstring<R: Read>(r: &mut R, max: usize) -> Result<String> {
    read_bounded(r, max, |max| {
        MarError::MalformedString(format!("string exceeds {max} bytes (including terminator)"))
    })
}

/// Member-name variant of [`read_cstring`]: an over-long name is
/// `NameTooLong` instead of `MalformedString`.
pub fn read_name<R: Read>(r: &mut R) -> Result<String> {
    read_bounded(r, MAX_NAME_LEN, |max| MarError::NameTooLong { max })
}

fn read_bounded<R: Read>(
    r: &mut R,
    max: usize,
    overflow: fn(usize) -> MarError,
) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MarError::MalformedString("unterminated string".into())
            } else {
                MarError::Io(e)
            }
        })?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        if bytes.len() + 1 > max {
            return Err(overflow(max));
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| MarError::MalformedString("string is not valid UTF-8".into()))
}

/// Write `s` as a NUL-terminated string, enforcing the same bound as
/// [`read_cstring`].  Interior NULs cannot be represented.
pub fn write_cstring<W: Write>(w: &mut W, s: &str, max: usize) -> Result<()> {
    if s.len() + 1 > max {
        return Err(MarError::MalformedString(format!(
            "string exceeds {max} bytes (including terminator)"
        )));
    }
    if s.as_bytes().contains(&0) {
        return Err(MarError::MalformedString(format!(
            "{s:?} contains an interior NUL"
        )));
    }
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])?;
    Ok(())
}

/// The 8-byte archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarHeader {
    /// Absolute file offset of the index block.  Zero only while a writer
    /// holds a placeholder that has not been back-patched yet.
    pub index_offset: u32,
}

impl MarHeader {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MarError::TruncatedFile { offset: 0, needed: HEADER_SIZE }
            } else {
                MarError::Io(e)
            }
        })?;
        if &magic != MAGIC {
            return Err(MarError::BadMagic);
        }
        let index_offset = r.read_u32::<BigEndian>()?;
        Ok(Self { index_offset })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<BigEndian>(self.index_offset)?;
        Ok(())
    }
}
