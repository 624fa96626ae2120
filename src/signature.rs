//! Signature block — RSA signatures over the archive with holes.
//!
//! # On-disk layout (big-endian), starting at offset 8 when present
//!
//! ```text
//! Offset  Size  Field
//!    0      8   total_file_size   full length of the finished archive (BE u64)
//!    8      4   num_signatures    at most 8                           (BE u32)
//!   12    ...   entries, packed back to back
//! ```
//!
//! Each entry:
//!
//! ```text
//!    0      4   algorithm_id     1 = PKCS#1v1.5/SHA-1, 2 = PKCS#1v1.5/SHA-384
//!    4      4   signature_size   modulus length of the signing key, in bytes
//!    8    ...   signature bytes
//! ```
//!
//! Signatures cover the entire file with every signature-bytes range read
//! as zeros.  `total_file_size` doubles as the discriminator that lets a
//! reader decide whether offset 8 holds this block at all: it must equal
//! the file's true length exactly.
//!
//! The algorithm id selects the hash; the signature length always equals
//! the key's modulus length.  That is what admits the historical 1024-bit
//! id-1 signatures on read without a special case.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1::digest::DynDigest;
use sha1::{Digest, Sha1};
use sha2::Sha384;
use std::io::{self, Read, Write};
use std::ops::Range;

use crate::error::{MarError, Result};
use crate::format::{MAX_SIGNATURES, MAX_SIGNATURE_LEN};

/// Wire id for RSA-PKCS#1v1.5 over SHA-1.
pub const ALG_ID_RSA_PKCS1_SHA1: u32 = 1;
/// Wire id for RSA-PKCS#1v1.5 over SHA-384.
pub const ALG_ID_RSA_PKCS1_SHA384: u32 = 2;

/// The (hash, padding) pair named by a signature entry's algorithm id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaPkcs1Sha1,
    RsaPkcs1Sha384,
}

impl SignatureAlgorithm {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            ALG_ID_RSA_PKCS1_SHA1 => Some(SignatureAlgorithm::RsaPkcs1Sha1),
            ALG_ID_RSA_PKCS1_SHA384 => Some(SignatureAlgorithm::RsaPkcs1Sha384),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha1 => ALG_ID_RSA_PKCS1_SHA1,
            SignatureAlgorithm::RsaPkcs1Sha384 => ALG_ID_RSA_PKCS1_SHA384,
        }
    }

    /// Diagnostics only — never parsed.
    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha1 => "RSA-PKCS1-SHA1",
            SignatureAlgorithm::RsaPkcs1Sha384 => "RSA-PKCS1-SHA384",
        }
    }

    /// A fresh hasher for this algorithm's digest.
    pub fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha1 => Box::new(Sha1::new()),
            SignatureAlgorithm::RsaPkcs1Sha384 => Box::new(Sha384::new()),
        }
    }
}

/// One parsed signature slot.  The raw id is kept so an entry with an
/// algorithm this build does not know still round-trips; it only becomes a
/// problem at verification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    pub algorithm_id: u32,
    pub signature: Vec<u8>,
}

impl SignatureEntry {
    pub fn algorithm(&self) -> Option<SignatureAlgorithm> {
        SignatureAlgorithm::from_id(self.algorithm_id)
    }

    pub fn encoded_len(&self) -> u64 {
        8 + self.signature.len() as u64
    }
}

/// The whole signature block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    /// Byte length of the finished archive.  Must match the file exactly.
    pub total_file_size: u64,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureBlock {
    pub fn encoded_len(&self) -> u64 {
        12 + self.entries.iter().map(SignatureEntry::encoded_len).sum::<u64>()
    }

    /// Parse the block from a source positioned at its first byte.  The
    /// caller has already accepted the block via the length probe; this
    /// fails hard on malformed entries rather than falling back.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let total_file_size = r.read_u64::<BigEndian>()?;
        let num_signatures = r.read_u32::<BigEndian>()?;
        if num_signatures > MAX_SIGNATURES {
            return Err(MarError::MalformedIndex(format!(
                "signature block declares {num_signatures} signatures (limit {MAX_SIGNATURES})"
            )));
        }

        let mut entries = Vec::with_capacity(num_signatures as usize);
        for slot in 0..num_signatures {
            let algorithm_id = r.read_u32::<BigEndian>()?;
            let signature_size = r.read_u32::<BigEndian>()?;
            if signature_size > MAX_SIGNATURE_LEN {
                return Err(MarError::MalformedIndex(format!(
                    "signature {slot} declares {signature_size} bytes (limit {MAX_SIGNATURE_LEN})"
                )));
            }
            let mut signature = vec![0u8; signature_size as usize];
            r.read_exact(&mut signature).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    MarError::TruncatedFile {
                        offset: total_file_size,
                        needed: signature_size as u64,
                    }
                } else {
                    MarError::Io(e)
                }
            })?;
            entries.push(SignatureEntry { algorithm_id, signature });
        }

        Ok(Self { total_file_size, entries })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<BigEndian>(self.total_file_size)?;
        w.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            w.write_u32::<BigEndian>(entry.algorithm_id)?;
            w.write_u32::<BigEndian>(entry.signature.len() as u32)?;
            w.write_all(&entry.signature)?;
        }
        Ok(())
    }

    /// Absolute `[start, end)` range of each signature-bytes slot, given the
    /// block's own absolute start offset.  These are the holes the hasher
    /// reads as zeros.
    pub fn signature_ranges(&self, block_start: u64) -> Vec<Range<u64>> {
        let mut ranges = Vec::with_capacity(self.entries.len());
        let mut pos = block_start + 12;
        for entry in &self.entries {
            pos += 8;
            ranges.push(pos..pos + entry.signature.len() as u64);
            pos += entry.signature.len() as u64;
        }
        ranges
    }
}
