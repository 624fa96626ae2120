//! Crate-wide error type.
//!
//! Every fallible operation surfaces a [`MarError`] at the first failing
//! step.  The library never skips members, never reports success on a
//! partially written archive, and never downgrades a verification failure
//! to a warning.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarError>;

#[derive(Error, Debug)]
pub enum MarError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid magic number — not a MAR archive")]
    BadMagic,

    /// The file ends before a structure it declares.  `offset` is where the
    /// read started, `needed` how many bytes the structure still required.
    #[error("Archive truncated: needed {needed} more byte(s) at offset {offset}")]
    TruncatedFile { offset: u64, needed: u64 },

    #[error("Malformed index: {0}")]
    MalformedIndex(String),

    #[error("Malformed string: {0}")]
    MalformedString(String),

    #[error("Member name exceeds {max} bytes (including terminator)")]
    NameTooLong { max: usize },

    #[error("Member {name:?} occupies {start}..{end}, outside the content region")]
    OffsetOutOfRange { name: String, start: u64, end: u64 },

    #[error("Index entries are not sorted by offset ({name:?} at offset {offset})")]
    IndexNotSorted { name: String, offset: u32 },

    #[error("Duplicate member name {0:?}")]
    DuplicateName(String),

    #[error("Unsupported compression {0:?}")]
    UnsupportedCompression(String),

    #[error("Corrupt compressed stream: {0}")]
    CorruptCompressedStream(String),

    /// Signature slot `0` did not verify against any acceptable key.
    /// Carried inside [`VerifyOutcome`](crate::VerifyOutcome) on the normal
    /// path; surfaces as an error only through
    /// [`VerifyOutcome::into_result`](crate::VerifyOutcome::into_result).
    #[error("Signature {0} failed to verify")]
    FailedSignature(usize),

    #[error("No key was supplied for the algorithm of signature {0}")]
    UnknownSignatureAlgorithm(usize),

    #[error("Cannot load key: {0}")]
    InvalidKey(String),

    #[error("{0}")]
    Usage(String),

    #[error("Member {name:?} exceeds the 4 GiB size bound after compression")]
    MemberTooLarge { name: String },

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

impl MarError {
    /// Process exit code the `mar` binary reports for this error.
    /// 1 = usage, 2 = I/O, 3 = format violation, 4 = verification failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            MarError::Io(_) => 2,
            MarError::InvalidKey(_) | MarError::Usage(_) => 1,
            MarError::FailedSignature(_) | MarError::UnknownSignatureAlgorithm(_) => 4,
            _ => 3,
        }
    }
}
