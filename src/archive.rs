//! High-level [`Mar`] API — the primary embedding surface.
//!
//! ```no_run
//! use marlin::archive::Mar;
//! use marlin::io_stream::WriteOptions;
//!
//! // Write
//! let mut ar = Mar::create("out.mar", WriteOptions::default())?;
//! ar.add_member("readme.txt", 0o644, &mut &b"Hello, world!"[..])?;
//! ar.finalize()?;
//!
//! // Read
//! let mut ar = Mar::open("out.mar")?;
//! let data = ar.read_member("readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), marlin::MarError>(())
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::additional::ProductInformation;
use crate::crypto::{VerifyKey, VerifyPolicy};
use crate::error::{MarError, Result};
use crate::index::IndexEntry;
use crate::io_stream::{MarReader, MarWriter, VerifyOutcome, WriteOptions};

// ── MemberInfo ────────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Mar::list`].
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: String,
    /// Compressed bytes on disk.
    pub size: u32,
    pub mode: u32,
    pub offset: u32,
}

impl From<&IndexEntry> for MemberInfo {
    fn from(e: &IndexEntry) -> Self {
        MemberInfo {
            name: e.name.clone(),
            size: e.size,
            mode: e.mode,
            offset: e.offset,
        }
    }
}

// ── ArchiveMode ───────────────────────────────────────────────────────────────

enum ArchiveMode {
    Read(MarReader<BufReader<File>>),
    Write(MarWriter<File>),
}

// ── Mar ───────────────────────────────────────────────────────────────────────

pub struct Mar {
    path: PathBuf,
    mode: ArchiveMode,
}

impl Mar {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let reader = MarReader::open(BufReader::new(File::open(&path)?))?;
        Ok(Self { path, mode: ArchiveMode::Read(reader) })
    }

    pub fn create<P: AsRef<Path>>(path: P, options: WriteOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        // Finalization reads the file back to sign it, so open read+write.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let writer = MarWriter::new(file, options)?;
        Ok(Self { path, mode: ArchiveMode::Write(writer) })
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    pub fn add_member<R: io::Read + ?Sized>(
        &mut self,
        name: &str,
        mode: u32,
        payload: &mut R,
    ) -> Result<()> {
        match &mut self.mode {
            ArchiveMode::Write(w) => w.add_member(name, mode, payload),
            ArchiveMode::Read(_) => Err(read_only()),
        }
    }

    /// Add a filesystem file under `name`, carrying its permission bits.
    pub fn add_path<P: AsRef<Path>>(&mut self, path: P, name: &str) -> Result<()> {
        let mut file = File::open(path.as_ref())?;
        let mode = file_mode(&file)?;
        self.add_member(name, mode, &mut file)
    }

    /// Write the index, sign, and flush.  Consumes the archive; calling
    /// any write method afterwards is impossible by construction.
    pub fn finalize(self) -> Result<()> {
        match self.mode {
            ArchiveMode::Write(w) => {
                w.finalize()?;
                Ok(())
            }
            ArchiveMode::Read(_) => Err(read_only()),
        }
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    pub fn list(&self) -> Vec<MemberInfo> {
        match &self.mode {
            ArchiveMode::Read(r) => r.entries().iter().map(MemberInfo::from).collect(),
            ArchiveMode::Write(_) => Vec::new(),
        }
    }

    pub fn read_member(&mut self, name: &str) -> Result<Vec<u8>> {
        let reader = self.reader_mut()?;
        let entry = reader.find(name).cloned().ok_or_else(|| {
            MarError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("member not found: {name}"),
            ))
        })?;
        let mut out = Vec::new();
        reader.extract_entry(&entry, &mut out)?;
        Ok(out)
    }

    /// Extract every member into `dest`, creating parent directories and
    /// applying the low 9 mode bits (the process umask still applies).
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<()> {
        let dest = dest.as_ref();
        let reader = self.reader_mut()?;
        let entries: Vec<IndexEntry> = reader.entries().to_vec();
        for entry in &entries {
            let target = dest.join(&entry.name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = create_with_mode(&target, entry.mode & 0o777)?;
            reader.extract_entry(entry, &mut out)?;
        }
        Ok(())
    }

    pub fn verify(&mut self, keys: &[VerifyKey], policy: VerifyPolicy) -> Result<VerifyOutcome> {
        self.reader_mut()?.verify(keys, policy)
    }

    pub fn product_info(&mut self) -> Result<Option<ProductInformation>> {
        self.reader_mut()?.product_info()
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reader(&self) -> Option<&MarReader<BufReader<File>>> {
        match &self.mode {
            ArchiveMode::Read(r) => Some(r),
            ArchiveMode::Write(_) => None,
        }
    }

    fn reader_mut(&mut self) -> Result<&mut MarReader<BufReader<File>>> {
        match &mut self.mode {
            ArchiveMode::Read(r) => Ok(r),
            ArchiveMode::Write(_) => Err(write_only()),
        }
    }
}

fn read_only() -> MarError {
    MarError::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "archive is open for reading",
    ))
}

fn write_only() -> MarError {
    MarError::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "archive is open for writing",
    ))
}

#[cfg(unix)]
fn file_mode(file: &File) -> Result<u32> {
    use std::os::unix::fs::MetadataExt;
    Ok(file.metadata()?.mode())
}

#[cfg(not(unix))]
fn file_mode(_file: &File) -> Result<u32> {
    Ok(0o644)
}

#[cfg(unix)]
fn create_with_mode(path: &Path, mode: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?)
}

#[cfg(not(unix))]
fn create_with_mode(path: &Path, _mode: u32) -> Result<File> {
    Ok(File::create(path)?)
}
