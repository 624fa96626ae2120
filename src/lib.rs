//! # marlin — Mozilla Archive (MAR) reader, writer, and verifier
//!
//! Format guarantees (frozen):
//! - All numeric fields are big-endian; never negotiated
//! - The file starts with `"MAR1"` and a 4-byte offset to the trailing index
//! - Index entries are offset-sorted, bounds-checked, and unique by name;
//!   a violation rejects the whole archive — no partial listing
//! - Signatures are RSA-PKCS#1v1.5 over the entire file with every
//!   signature-bytes range read as zeros; `total_file_size` must equal the
//!   true file length or the block is not a signature block
//! - One compression codec per archive ({none, bzip2, xz}), one independent
//!   stream per member, recognized on read from the payload's first bytes
//! - Verification is all-or-nothing: every declared signature must check
//!   out, or the archive does not verify

pub mod error;
pub mod format;
pub mod index;
pub mod signature;
pub mod additional;
pub mod codec;
pub mod hash;
pub mod crypto;
pub mod io_stream;
pub mod archive;
pub mod keys;

// Flat re-exports for the most common types.
pub use additional::{AdditionalBlock, AdditionalEntry, ProductInformation};
pub use archive::{Mar, MemberInfo};
pub use codec::{Compression, Compressor, Decompressor};
pub use crypto::{load_private_key, load_public_key, VerifyKey, VerifyPolicy};
pub use error::{MarError, Result};
pub use format::MarHeader;
pub use hash::MaskedHasher;
pub use index::IndexEntry;
pub use io_stream::{MarReader, MarWriter, VerifyOutcome, WriteOptions};
pub use keys::{builtin_keys, builtin_names, BuiltinKeySet};
pub use signature::{SignatureAlgorithm, SignatureBlock, SignatureEntry};
