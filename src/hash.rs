//! Multi-digest hashing with holes read as zeros.
//!
//! Signatures cover the whole archive as it would look with every
//! signature-bytes range replaced by NULs.  Rather than mutating the file
//! or copying it, the hasher substitutes the zeros in flight as bytes
//! stream through.  One pass feeds every signature's hasher at once, so
//! verifying an archive with several signatures still reads it exactly
//! once.

use sha1::digest::DynDigest;
use std::io::Read;
use std::ops::Range;

use crate::error::{MarError, Result};

const ZEROS: [u8; 4096] = [0u8; 4096];

/// Feeds a byte stream into one or more hashers, reading the designated
/// `[start, end)` ranges as zeros.  Ranges must be sorted ascending and
/// non-overlapping.  A range past the end of the stream is clipped; a
/// range entirely behind the cursor is ignored.
pub struct MaskedHasher {
    hashers: Vec<Box<dyn DynDigest>>,
    holes: Vec<Range<u64>>,
    next_hole: usize,
    position: u64,
}

impl MaskedHasher {
    pub fn new(hashers: Vec<Box<dyn DynDigest>>, holes: Vec<Range<u64>>) -> Self {
        debug_assert!(
            holes.windows(2).all(|w| w[0].end <= w[1].start),
            "hole ranges must be sorted and non-overlapping"
        );
        Self { hashers, holes, next_hole: 0, position: 0 }
    }

    /// Absorb the next chunk of the stream.
    pub fn update(&mut self, buf: &[u8]) {
        let mut offset = 0;
        while offset < buf.len() {
            while self.next_hole < self.holes.len()
                && self.holes[self.next_hole].end <= self.position
            {
                self.next_hole += 1;
            }

            let remaining = buf.len() - offset;
            let (run, masked) = match self.holes.get(self.next_hole) {
                Some(hole) if self.position >= hole.start => {
                    (remaining.min((hole.end - self.position) as usize), true)
                }
                Some(hole) => (remaining.min((hole.start - self.position) as usize), false),
                None => (remaining, false),
            };

            if masked {
                let mut left = run;
                while left > 0 {
                    let n = left.min(ZEROS.len());
                    self.absorb(&ZEROS[..n]);
                    left -= n;
                }
            } else {
                self.absorb(&buf[offset..offset + run]);
            }

            offset += run;
            self.position += run as u64;
        }
    }

    fn absorb(&mut self, bytes: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(bytes);
        }
    }

    /// One digest per hasher, in construction order.
    pub fn finalize(self) -> Vec<Vec<u8>> {
        self.hashers
            .into_iter()
            .map(|h| h.finalize().to_vec())
            .collect()
    }
}

/// Pump exactly `len` bytes of `source` through a [`MaskedHasher`].
pub fn digest_stream<R: Read>(
    source: &mut R,
    len: u64,
    hashers: Vec<Box<dyn DynDigest>>,
    holes: Vec<Range<u64>>,
) -> Result<Vec<Vec<u8>>> {
    let mut masked = MaskedHasher::new(hashers, holes);
    let mut buf = [0u8; 64 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(MarError::TruncatedFile {
                offset: len - remaining,
                needed: remaining,
            });
        }
        masked.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(masked.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use sha2::Sha384;

    fn sha1_of(bytes: &[u8]) -> Vec<u8> {
        Sha1::digest(bytes).to_vec()
    }

    #[test]
    fn masked_digest_equals_digest_of_zeroed_copy() {
        let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let holes = vec![100u64..164, 5000u64..5008];

        let mut zeroed = data.clone();
        zeroed[100..164].fill(0);
        zeroed[5000..5008].fill(0);

        let mut masked = MaskedHasher::new(vec![Box::new(Sha1::new())], holes);
        // Deliberately awkward chunking across the hole boundaries.
        for chunk in data.chunks(37) {
            masked.update(chunk);
        }
        assert_eq!(masked.finalize()[0], sha1_of(&zeroed));
    }

    #[test]
    fn hole_past_eof_is_clipped() {
        let data = b"short stream".to_vec();
        let mut zeroed = data.clone();
        zeroed[8..].fill(0);

        let mut masked = MaskedHasher::new(vec![Box::new(Sha1::new())], vec![8..1_000_000]);
        masked.update(&data);
        assert_eq!(masked.finalize()[0], sha1_of(&zeroed));
    }

    #[test]
    fn empty_hole_set_is_plain_hashing() {
        let data = b"no holes at all".to_vec();
        let mut masked = MaskedHasher::new(vec![Box::new(Sha1::new())], Vec::new());
        masked.update(&data);
        assert_eq!(masked.finalize()[0], sha1_of(&data));
    }

    #[test]
    fn one_pass_feeds_every_hasher() {
        let data = vec![0xA5u8; 512];
        let mut masked = MaskedHasher::new(
            vec![Box::new(Sha1::new()), Box::new(Sha384::new())],
            vec![0..16],
        );
        masked.update(&data);
        let digests = masked.finalize();
        assert_eq!(digests[0].len(), 20);
        assert_eq!(digests[1].len(), 48);
    }
}
