//! Compression adapter — one codec per archive, streaming both ways.
//!
//! The format does not record which codec an archive uses; the whole
//! archive shares one, and the reader recognizes it from the first bytes
//! of a member payload (`BZh` for bzip2, `\xFD7zXZ\x00` for xz, anything
//! else is stored verbatim).  Each member carries its own independent
//! compressed stream so extraction never has to decode earlier members.
//!
//! The compressing side wraps a byte sink and reports the exact number of
//! compressed bytes it emitted on `finish()` — the writer records that as
//! the member's on-disk size.

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use std::io::{self, Chain, Cursor, Read, Write};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::{MarError, Result};

/// Sniffed prefix of a bzip2 stream.
pub const BZIP2_MAGIC: &[u8] = b"BZh";
/// Sniffed prefix of an xz stream.
pub const XZ_MAGIC: &[u8] = b"\xFD7zXZ\x00";

/// Codec selector for an archive being written.  Reads never need one;
/// they detect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Bzip2,
    Xz,
}

impl Compression {
    /// Diagnostics only — never parsed back from disk.
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }

    /// Parse from a CLI or config string.
    pub fn from_name(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            _ => Err(MarError::UnsupportedCompression(s.to_owned())),
        }
    }
}

// ── Compressing sink ─────────────────────────────────────────────────────────

/// Counts the bytes that actually reach the underlying sink.
pub struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A write stream that compresses into an underlying sink.
pub enum Compressor<W: Write> {
    Plain(CountingWriter<W>),
    Bzip2(BzEncoder<CountingWriter<W>>),
    Xz(XzEncoder<CountingWriter<W>>),
}

impl<W: Write> Compressor<W> {
    pub fn new(compression: Compression, sink: W) -> Self {
        let counting = CountingWriter::new(sink);
        match compression {
            Compression::None => Compressor::Plain(counting),
            Compression::Bzip2 => {
                Compressor::Bzip2(BzEncoder::new(counting, bzip2::Compression::best()))
            }
            Compression::Xz => Compressor::Xz(XzEncoder::new(counting, 9)),
        }
    }

    /// Flush the codec and return the inner sink together with the number
    /// of compressed bytes written through it.
    pub fn finish(self) -> Result<(W, u64)> {
        let counting = match self {
            Compressor::Plain(c) => c,
            Compressor::Bzip2(enc) => enc.finish()?,
            Compressor::Xz(enc) => enc.finish()?,
        };
        Ok((counting.inner, counting.written))
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(w) => w.write(buf),
            Compressor::Bzip2(w) => w.write(buf),
            Compressor::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(w) => w.flush(),
            Compressor::Bzip2(w) => w.flush(),
            Compressor::Xz(w) => w.flush(),
        }
    }
}

// ── Decompressing source ─────────────────────────────────────────────────────

/// The sniffed prefix is replayed ahead of the rest of the source, so
/// detection works on non-seekable inputs.
type Replayed<R> = Chain<Cursor<Vec<u8>>, R>;

/// A read stream that decompresses an underlying source, codec detected
/// from its first bytes.
pub enum Decompressor<R: Read> {
    Plain(Replayed<R>),
    Bzip2(BzDecoder<Replayed<R>>),
    Xz(XzDecoder<Replayed<R>>),
}

impl<R: Read> Decompressor<R> {
    /// Sniff up to 6 bytes from `source` and wrap it in the matching
    /// decoder.  Unrecognized prefixes pass through byte-exact.
    pub fn detect(mut source: R) -> Result<Self> {
        let mut head = [0u8; 6];
        let mut have = 0;
        while have < head.len() {
            match source.read(&mut head[have..])? {
                0 => break,
                n => have += n,
            }
        }
        let replay = Cursor::new(head[..have].to_vec()).chain(source);

        if head[..have].starts_with(BZIP2_MAGIC) {
            Ok(Decompressor::Bzip2(BzDecoder::new(replay)))
        } else if head[..have] == *XZ_MAGIC {
            Ok(Decompressor::Xz(XzDecoder::new(replay)))
        } else {
            Ok(Decompressor::Plain(replay))
        }
    }

    /// Which codec detection chose.
    pub fn compression(&self) -> Compression {
        match self {
            Decompressor::Plain(_) => Compression::None,
            Decompressor::Bzip2(_) => Compression::Bzip2,
            Decompressor::Xz(_) => Compression::Xz,
        }
    }
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressor::Plain(r) => r.read(buf),
            Decompressor::Bzip2(r) => r.read(buf),
            Decompressor::Xz(r) => r.read(buf),
        }
    }
}

/// Classify an error raised while pumping a [`Decompressor`]: decoder
/// failures become `CorruptCompressedStream`, transport failures stay `Io`.
pub fn classify_decode_error(e: io::Error) -> MarError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::Other => {
            MarError::CorruptCompressedStream(e.to_string())
        }
        _ => MarError::Io(e),
    }
}
