//! Additional block — optional typed metadata entries.
//!
//! # On-disk layout (big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   block_size    whole block, this field included (BE u32)
//!    4      4   num_entries                                    (BE u32)
//!    8    ...   entries, packed back to back
//! ```
//!
//! Each entry:
//!
//! ```text
//!    0      4   entry_size    payload length + 8   (BE u32)
//!    4      4   info_type     1 = ProductInformation
//!    8    ...   payload       entry_size - 8 bytes
//! ```
//!
//! Unknown `info_type` values are preserved verbatim; only type 1 has a
//! decoded form.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{MarError, Result};
use crate::format::{read_cstring, write_cstring, MAX_PRODUCT_INFO_FIELD};

/// `info_type` of the [`ProductInformation`] entry.
pub const INFO_TYPE_PRODUCT_INFORMATION: u32 = 1;

/// One raw additional entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalEntry {
    pub info_type: u32,
    pub payload: Vec<u8>,
}

impl AdditionalEntry {
    pub fn encoded_len(&self) -> u64 {
        8 + self.payload.len() as u64
    }
}

/// The update channel and product version an archive was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInformation {
    pub mar_channel_id: String,
    pub product_version: String,
}

impl ProductInformation {
    pub fn new(mar_channel_id: &str, product_version: &str) -> Self {
        Self {
            mar_channel_id: mar_channel_id.to_owned(),
            product_version: product_version.to_owned(),
        }
    }

    /// Encode as an `info_type = 1` entry: two bounded NUL-terminated
    /// ASCII fields, channel first.
    pub fn to_entry(&self) -> Result<AdditionalEntry> {
        let mut payload = Vec::new();
        write_cstring(&mut payload, &self.mar_channel_id, MAX_PRODUCT_INFO_FIELD)?;
        write_cstring(&mut payload, &self.product_version, MAX_PRODUCT_INFO_FIELD)?;
        Ok(AdditionalEntry {
            info_type: INFO_TYPE_PRODUCT_INFORMATION,
            payload,
        })
    }

    pub fn from_entry(entry: &AdditionalEntry) -> Result<Self> {
        let mut cursor = Cursor::new(&entry.payload);
        let mar_channel_id = read_cstring(&mut cursor, MAX_PRODUCT_INFO_FIELD)?;
        let product_version = read_cstring(&mut cursor, MAX_PRODUCT_INFO_FIELD)?;
        Ok(Self { mar_channel_id, product_version })
    }
}

/// The whole additional block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdditionalBlock {
    pub entries: Vec<AdditionalEntry>,
}

impl AdditionalBlock {
    /// On-disk `block_size` of this block.
    pub fn encoded_len(&self) -> u64 {
        8 + self.entries.iter().map(AdditionalEntry::encoded_len).sum::<u64>()
    }

    /// Parse from a source positioned at the block's first byte.  Entries
    /// must fill `block_size` exactly; anything else is malformed.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let block_size = r.read_u32::<BigEndian>()? as u64;
        let num_entries = r.read_u32::<BigEndian>()?;
        if block_size < 8 {
            return Err(MarError::MalformedIndex(format!(
                "additional block_size {block_size} cannot hold its own header"
            )));
        }

        let mut consumed: u64 = 8;
        let mut entries = Vec::with_capacity(num_entries.min(16) as usize);
        for _ in 0..num_entries {
            if consumed + 8 > block_size {
                return Err(MarError::MalformedIndex(
                    "additional entry overruns its block".into(),
                ));
            }
            let entry_size = r.read_u32::<BigEndian>()? as u64;
            let info_type = r.read_u32::<BigEndian>()?;
            if entry_size < 8 || consumed + entry_size > block_size {
                return Err(MarError::MalformedIndex(format!(
                    "additional entry_size {entry_size} overruns its block"
                )));
            }
            let mut payload = vec![0u8; (entry_size - 8) as usize];
            r.read_exact(&mut payload)?;
            consumed += entry_size;
            entries.push(AdditionalEntry { info_type, payload });
        }
        if consumed != block_size {
            return Err(MarError::MalformedIndex(format!(
                "additional block declares {block_size} bytes but its entries cover {consumed}"
            )));
        }

        Ok(Self { entries })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.encoded_len() as u32)?;
        w.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            w.write_u32::<BigEndian>(entry.encoded_len() as u32)?;
            w.write_u32::<BigEndian>(entry.info_type)?;
            w.write_all(&entry.payload)?;
        }
        Ok(())
    }

    /// Decode the first ProductInformation entry, if one is present.
    pub fn product_information(&self) -> Result<Option<ProductInformation>> {
        self.entries
            .iter()
            .find(|e| e.info_type == INFO_TYPE_PRODUCT_INFORMATION)
            .map(ProductInformation::from_entry)
            .transpose()
    }
}
