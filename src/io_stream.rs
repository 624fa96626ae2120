//! Streaming archive engine — reader and writer.
//!
//! # Reader
//! [`MarReader`] parses the header and index eagerly, then decides what
//! sits at offset 8.  The format does not tag its optional blocks, so the
//! reader probes: offset 8 holds a signature block only when the `u64`
//! there equals the file's exact length and the following count is within
//! bounds; otherwise an additional block is attempted with the equivalent
//! fits-before-the-first-payload check; otherwise offset 8 is payload.
//!
//! # Writer
//! [`MarWriter`] emits in two phases.  Phase one streams: header with a
//! zero `index_offset`, a signature block with zeroed signature slots, the
//! additional block, each member through its own compressed stream, and
//! the index.  Phase two back-patches the header and `total_file_size`,
//! re-reads the finished bytes through the masked hasher, signs each
//! digest, and patches the signatures into their reserved slots.  Payload
//! sizes after compression are unknowable up front, so back-patching into
//! a seekable sink is the only way to avoid buffering whole payloads.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

use crate::additional::{AdditionalBlock, ProductInformation};
use crate::codec::{classify_decode_error, Compression, Compressor, Decompressor};
use crate::crypto::{sign_digest, verify_digest, VerifyKey, VerifyPolicy};
use crate::error::{MarError, Result};
use crate::format::{MarHeader, HEADER_SIZE, MAX_SIGNATURES};
use crate::hash::digest_stream;
use crate::index::{check_name, read_index, write_index, IndexEntry};
use crate::signature::{SignatureAlgorithm, SignatureBlock, SignatureEntry};

// ── Verification outcome ─────────────────────────────────────────────────────

/// Result of checking an archive's signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The archive is well formed and carries no signatures.
    NoSignatures,
    /// Every declared signature verified; the count is carried.
    Verified(usize),
    /// The slot at this position did not verify under the given policy.
    FailedSignature(usize),
    /// The slot at this position uses an algorithm for which no candidate
    /// key was supplied (or one this build does not know).
    UnknownSignatureAlgorithm(usize),
}

impl VerifyOutcome {
    pub fn is_trusted(&self) -> bool {
        matches!(self, VerifyOutcome::Verified(_))
    }

    /// Fail-closed view: a failed signature becomes a hard error, every
    /// other outcome passes through for the caller to judge.
    pub fn into_result(self) -> Result<VerifyOutcome> {
        match self {
            VerifyOutcome::FailedSignature(slot) => Err(MarError::FailedSignature(slot)),
            outcome => Ok(outcome),
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Parses a MAR from a seekable source and serves member streams,
/// metadata, and signature verification.
pub struct MarReader<R: Read + Seek> {
    source: R,
    file_len: u64,
    header: MarHeader,
    entries: Vec<IndexEntry>,
    signatures: Option<SignatureBlock>,
    additional: Option<AdditionalBlock>,
}

impl<R: Read + Seek> MarReader<R> {
    /// Parse header, index, and the optional offset-8 blocks.
    pub fn open(mut source: R) -> Result<Self> {
        let file_len = source.seek(SeekFrom::End(0))?;
        if file_len < HEADER_SIZE {
            return Err(MarError::TruncatedFile { offset: 0, needed: HEADER_SIZE - file_len });
        }

        source.seek(SeekFrom::Start(0))?;
        let header = MarHeader::read(&mut source)?;
        let entries = read_index(&mut source, header.index_offset, file_len)?;

        let first_content = entries
            .iter()
            .map(|e| e.offset as u64)
            .min()
            .unwrap_or(header.index_offset as u64);

        let signatures = Self::probe_signatures(&mut source, file_len)?;
        let after_signatures = HEADER_SIZE
            + signatures.as_ref().map(SignatureBlock::encoded_len).unwrap_or(0);
        let additional = Self::probe_additional(&mut source, after_signatures, first_content)?;

        Ok(Self { source, file_len, header, entries, signatures, additional })
    }

    /// A signature block announces itself by declaring the file's exact
    /// length.  An arbitrary payload prefix cannot be ruled out entirely,
    /// but it would have to guess the final file size to collide.
    fn probe_signatures(source: &mut R, file_len: u64) -> Result<Option<SignatureBlock>> {
        if file_len < HEADER_SIZE + 12 {
            return Ok(None);
        }
        source.seek(SeekFrom::Start(HEADER_SIZE))?;
        let declared_len = source.read_u64::<BigEndian>()?;
        let num_signatures = source.read_u32::<BigEndian>()?;
        if declared_len != file_len || num_signatures > MAX_SIGNATURES {
            debug!(
                "offset 8 is not a signature block \
                 (declares {declared_len} bytes / {num_signatures} signatures, file is {file_len})"
            );
            return Ok(None);
        }

        source.seek(SeekFrom::Start(HEADER_SIZE))?;
        let block = SignatureBlock::read(source)?;
        debug!("signature block accepted with {} entries", block.entries.len());
        Ok(Some(block))
    }

    /// An additional block is accepted only when it fits completely between
    /// the preceding block and the first payload byte and parses cleanly.
    fn probe_additional(
        source: &mut R,
        at: u64,
        first_content: u64,
    ) -> Result<Option<AdditionalBlock>> {
        if at + 8 > first_content {
            return Ok(None);
        }
        source.seek(SeekFrom::Start(at))?;
        let block_size = source.read_u32::<BigEndian>()? as u64;
        if block_size < 8 || at + block_size > first_content {
            debug!("offset {at} is not an additional block (size {block_size})");
            return Ok(None);
        }

        source.seek(SeekFrom::Start(at))?;
        match AdditionalBlock::read(source) {
            Ok(block) => Ok(Some(block)),
            Err(MarError::Io(e)) => Err(e.into()),
            Err(e) => {
                debug!("offset {at} does not parse as an additional block: {e}");
                Ok(None)
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Index entries in their on-disk order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn signatures(&self) -> Option<&SignatureBlock> {
        self.signatures.as_ref()
    }

    pub fn additional(&self) -> Option<&AdditionalBlock> {
        self.additional.as_ref()
    }

    /// The decoded ProductInformation entry, if the archive carries one.
    pub fn product_info(&self) -> Result<Option<ProductInformation>> {
        match &self.additional {
            Some(block) => block.product_information(),
            None => Ok(None),
        }
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn index_offset(&self) -> u32 {
        self.header.index_offset
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    /// Decompress one member's payload into `sink`.  Returns the number of
    /// decompressed bytes.  Verification is never required for this.
    pub fn extract_entry<W: Write>(&mut self, entry: &IndexEntry, sink: &mut W) -> Result<u64> {
        self.source.seek(SeekFrom::Start(entry.offset as u64))?;
        let section = (&mut self.source).take(entry.size as u64);
        let mut decoder = Decompressor::detect(section)?;
        io::copy(&mut decoder, sink).map_err(classify_decode_error)
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Check every declared signature against the candidate keys.  The
    /// whole file is streamed through the masked hasher exactly once,
    /// with each signature-bytes range read as zeros.
    pub fn verify(&mut self, keys: &[VerifyKey], policy: VerifyPolicy) -> Result<VerifyOutcome> {
        let block = match &self.signatures {
            Some(block) if !block.entries.is_empty() => block,
            _ => return Ok(VerifyOutcome::NoSignatures),
        };

        // Resolve every slot's algorithm and key availability before
        // paying for a full read of the archive.
        let mut algorithms = Vec::with_capacity(block.entries.len());
        for (slot, entry) in block.entries.iter().enumerate() {
            let Some(algorithm) = entry.algorithm() else {
                return Ok(VerifyOutcome::UnknownSignatureAlgorithm(slot));
            };
            if !keys.iter().any(|k| k.algorithm == algorithm) {
                return Ok(VerifyOutcome::UnknownSignatureAlgorithm(slot));
            }
            algorithms.push(algorithm);
        }

        let holes = block.signature_ranges(HEADER_SIZE);
        let hashers = algorithms.iter().map(|a| a.hasher()).collect();
        let entries = block.entries.clone();

        self.source.seek(SeekFrom::Start(0))?;
        let digests = digest_stream(&mut self.source, self.file_len, hashers, holes)?;

        for (slot, ((entry, algorithm), digest)) in
            entries.iter().zip(&algorithms).zip(&digests).enumerate()
        {
            let mut candidates = keys.iter().filter(|k| k.algorithm == *algorithm);
            let passed = match policy {
                VerifyPolicy::AnyKey => candidates
                    .any(|k| verify_digest(&k.key, *algorithm, digest, &entry.signature)),
                VerifyPolicy::RequireAll => candidates
                    .all(|k| verify_digest(&k.key, *algorithm, digest, &entry.signature)),
            };
            if !passed {
                return Ok(VerifyOutcome::FailedSignature(slot));
            }
        }

        Ok(VerifyOutcome::Verified(entries.len()))
    }

    /// Release the underlying source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Configuration for [`MarWriter::new`].
#[derive(Default)]
pub struct WriteOptions {
    pub compression: Compression,
    /// Signing keys, one signature slot each, in slot order.
    pub signers: Vec<(SignatureAlgorithm, RsaPrivateKey)>,
    pub product_info: Option<ProductInformation>,
}

impl WriteOptions {
    pub fn compressed_with(compression: Compression) -> Self {
        Self { compression, ..Self::default() }
    }
}

/// Emits a MAR to a seekable sink.  The sink must also be readable:
/// finalization re-reads the emitted bytes to sign them in place of a
/// temporary copy.
pub struct MarWriter<W: Read + Write + Seek> {
    sink: W,
    compression: Compression,
    signers: Vec<(SignatureAlgorithm, RsaPrivateKey)>,
    entries: Vec<IndexEntry>,
    /// Placeholder block already on disk: zeroed signatures, zero
    /// `total_file_size`.  Patched during finalization.
    signature_block: Option<SignatureBlock>,
}

impl<W: Read + Write + Seek> MarWriter<W> {
    /// Write the header placeholder, the zeroed signature block, and the
    /// additional block.  Members stream in afterwards.
    pub fn new(mut sink: W, options: WriteOptions) -> Result<Self> {
        sink.seek(SeekFrom::Start(0))?;
        MarHeader { index_offset: 0 }.write(&mut sink)?;

        let signature_block = if options.signers.is_empty() {
            None
        } else {
            let entries = options
                .signers
                .iter()
                .map(|(algorithm, key)| SignatureEntry {
                    algorithm_id: algorithm.id(),
                    signature: vec![0u8; key.size()],
                })
                .collect();
            let block = SignatureBlock { total_file_size: 0, entries };
            block.write(&mut sink)?;
            Some(block)
        };

        if let Some(info) = &options.product_info {
            let block = AdditionalBlock { entries: vec![info.to_entry()?] };
            block.write(&mut sink)?;
        }

        Ok(Self {
            sink,
            compression: options.compression,
            signers: options.signers,
            entries: Vec::new(),
            signature_block,
        })
    }

    /// Stream one member's payload through this archive's codec and record
    /// its index entry.  Members land in call order.
    ///
    /// A member whose on-disk payload is empty is rejected: index offsets
    /// strictly increase, so two members cannot share one.  This only
    /// arises for an empty payload stored uncompressed; bzip2 and xz emit
    /// framing bytes even for empty input.
    pub fn add_member<P: Read + ?Sized>(
        &mut self,
        name: &str,
        mode: u32,
        payload: &mut P,
    ) -> Result<()> {
        check_name(name)?;
        if self.entries.iter().any(|e| e.name == name) {
            return Err(MarError::DuplicateName(name.to_owned()));
        }

        let offset = self.sink.stream_position()?;
        if offset > u32::MAX as u64 {
            return Err(MarError::MemberTooLarge { name: name.to_owned() });
        }

        let mut encoder = Compressor::new(self.compression, &mut self.sink);
        io::copy(payload, &mut encoder)?;
        let (_, compressed) = encoder.finish()?;
        if compressed == 0 {
            return Err(MarError::MalformedIndex(format!(
                "zero-byte member {name:?} cannot be represented: index offsets must strictly increase"
            )));
        }
        if compressed > u32::MAX as u64 {
            return Err(MarError::MemberTooLarge { name: name.to_owned() });
        }

        self.entries.push(IndexEntry {
            offset: offset as u32,
            size: compressed as u32,
            mode,
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Write the index, back-patch the header and signature block, sign,
    /// and flush.  Consumes the writer; an error mid-finalize leaves the
    /// sink indeterminate and the caller must discard it.
    pub fn finalize(mut self) -> Result<W> {
        let index_offset = self.sink.stream_position()?;
        if index_offset > u32::MAX as u64 {
            return Err(MarError::MalformedIndex(
                "content region exceeds the 4 GiB the index offset can address".into(),
            ));
        }
        write_index(&mut self.sink, &self.entries)?;
        let total_file_size = self.sink.stream_position()?;

        self.sink.seek(SeekFrom::Start(0))?;
        MarHeader { index_offset: index_offset as u32 }.write(&mut self.sink)?;

        if let Some(block) = self.signature_block.take() {
            self.sink.seek(SeekFrom::Start(HEADER_SIZE))?;
            self.sink.write_u64::<BigEndian>(total_file_size)?;
            self.sink.flush()?;

            let holes = block.signature_ranges(HEADER_SIZE);
            self.sign_into_slots(total_file_size, &holes)?;
        }

        self.sink.flush()?;
        Ok(self.sink)
    }

    /// Re-read the finished bytes with the signature slots read as zeros
    /// (they still hold zeros at this point), sign each digest, and patch
    /// the slots.
    fn sign_into_slots(&mut self, total_file_size: u64, holes: &[Range<u64>]) -> Result<()> {
        let hashers = self.signers.iter().map(|(a, _)| a.hasher()).collect();
        self.sink.seek(SeekFrom::Start(0))?;
        let digests = digest_stream(&mut self.sink, total_file_size, hashers, holes.to_vec())?;

        for (((algorithm, key), digest), slot) in
            self.signers.iter().zip(&digests).zip(holes)
        {
            let signature = sign_digest(key, *algorithm, digest)?;
            if signature.len() as u64 != slot.end - slot.start {
                return Err(MarError::SigningFailed(format!(
                    "signature is {} bytes but its reserved slot holds {}",
                    signature.len(),
                    slot.end - slot.start
                )));
            }
            self.sink.seek(SeekFrom::Start(slot.start))?;
            self.sink.write_all(&signature)?;
        }
        Ok(())
    }
}
