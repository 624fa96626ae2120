use clap::{ArgGroup, Parser};
use marlin::archive::Mar;
use marlin::codec::Compression;
use marlin::crypto::{load_private_key, VerifyKey, VerifyPolicy};
use marlin::error::{MarError, Result};
use marlin::io_stream::{VerifyOutcome, WriteOptions};
use marlin::keys::resolve_verify_keys;
use marlin::signature::SignatureAlgorithm;
use marlin::ProductInformation;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "mar",
    about = "Create, list, extract, and verify Mozilla Archive (MAR) files",
    disable_version_flag = true,
    group = ArgGroup::new("mode")
        .required(true)
        .args(["list", "detail", "extract", "create", "verify"]),
)]
struct Cli {
    /// List contents (name and size)
    #[arg(short = 't', value_name = "FILE")]
    list: Option<PathBuf>,

    /// List with detail (mode, compressed size, offset, product info,
    /// signature summary)
    #[arg(short = 'T', value_name = "FILE")]
    detail: Option<PathBuf>,

    /// Extract all members into the current directory
    #[arg(short = 'x', value_name = "FILE")]
    extract: Option<PathBuf>,

    /// Create an archive from the given paths (recursing into directories)
    #[arg(short = 'c', value_name = "FILE")]
    create: Option<PathBuf>,

    /// Verify signatures; exits 0 when verified or unsigned-and-well-formed
    #[arg(short = 'v', value_name = "FILE")]
    verify: Option<PathBuf>,

    /// Compress member payloads with bzip2 (create only)
    #[arg(short = 'j')]
    bzip2: bool,

    /// Compress member payloads with xz (create only)
    #[arg(short = 'J', conflicts_with = "bzip2")]
    xz: bool,

    /// Key selector: a PEM/DER key path, or `:name` from the built-in
    /// table (e.g. :mozilla-release).  Repeatable.
    #[arg(short = 'k', value_name = "KEY")]
    keys: Vec<String>,

    /// MAR channel id for the ProductInformation entry (create only)
    #[arg(short = 'H', value_name = "CHANNEL")]
    channel: Option<String>,

    /// Product version for the ProductInformation entry (create only)
    #[arg(short = 'V', value_name = "VERSION")]
    product_version: Option<String>,

    /// Input paths for -c
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help output is not a usage error.
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mar: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(file) = &cli.list {
        cmd_list(file)
    } else if let Some(file) = &cli.detail {
        cmd_detail(file)
    } else if let Some(file) = &cli.extract {
        cmd_extract(file)
    } else if let Some(file) = &cli.create {
        cmd_create(file, &cli)
    } else if let Some(file) = &cli.verify {
        cmd_verify(file, &cli.keys)
    } else {
        unreachable!("clap enforces exactly one mode flag")
    }
}

// ── List ─────────────────────────────────────────────────────────────────────

fn cmd_list(file: &Path) -> Result<()> {
    let ar = Mar::open(file)?;
    println!("{:>12}  Name", "Size");
    for member in ar.list() {
        println!("{:>12}  {}", member.size, member.name);
    }
    Ok(())
}

fn cmd_detail(file: &Path) -> Result<()> {
    let mut ar = Mar::open(file)?;

    println!("Archive: {}", file.display());
    let reader = ar.reader().expect("opened for reading");
    println!("  File size     {} B", reader.file_len());
    println!("  Index offset  {} B", reader.index_offset());

    match reader.signatures() {
        Some(block) => {
            println!("  Signatures    {}", block.entries.len());
            for (slot, entry) in block.entries.iter().enumerate() {
                let name = entry
                    .algorithm()
                    .map(SignatureAlgorithm::name)
                    .unwrap_or("UNKNOWN");
                println!(
                    "    [{slot}] {name} (id {}), {} B, {}…",
                    entry.algorithm_id,
                    entry.signature.len(),
                    hex::encode(&entry.signature[..entry.signature.len().min(6)]),
                );
            }
        }
        None => println!("  Signatures    none"),
    }

    match ar.product_info()? {
        Some(info) => println!(
            "  Product       channel={} version={}",
            info.mar_channel_id, info.product_version
        ),
        None => println!("  Product       none"),
    }

    println!("{:>7} {:>12} {:>12}  Name", "Mode", "Size", "Offset");
    for member in ar.list() {
        println!(
            "{:>7o} {:>12} {:>12}  {}",
            member.mode & 0o777,
            member.size,
            member.offset,
            member.name,
        );
    }
    Ok(())
}

// ── Extract ──────────────────────────────────────────────────────────────────

fn cmd_extract(file: &Path) -> Result<()> {
    let mut ar = Mar::open(file)?;
    ar.extract_all(".")?;
    for member in ar.list() {
        println!("  extracted  {}", member.name);
    }
    Ok(())
}

// ── Create ───────────────────────────────────────────────────────────────────

fn cmd_create(file: &Path, cli: &Cli) -> Result<()> {
    if cli.paths.is_empty() {
        return Err(MarError::Usage(
            "-c requires at least one input path".into(),
        ));
    }

    let compression = if cli.bzip2 {
        Compression::Bzip2
    } else if cli.xz {
        Compression::Xz
    } else {
        Compression::None
    };

    let signers = cli
        .keys
        .iter()
        .map(|arg| load_signer(arg))
        .collect::<Result<Vec<_>>>()?;

    let product_info = match (&cli.channel, &cli.product_version) {
        (Some(channel), Some(version)) => Some(ProductInformation::new(channel, version)),
        (None, None) => None,
        _ => {
            return Err(MarError::Usage(
                "-H and -V must be given together".into(),
            ))
        }
    };

    let mut ar = Mar::create(
        file,
        WriteOptions { compression, signers, product_info },
    )?;

    let mut inputs = Vec::new();
    for path in &cli.paths {
        collect_files(path, &mut inputs)?;
    }
    for (path, name) in &inputs {
        ar.add_path(path, name)?;
        println!("  packed  {name}");
    }
    ar.finalize()?;

    let size = fs::metadata(file)?.len();
    println!("Created: {}  ({} B on disk)", file.display(), size);
    Ok(())
}

/// Walk a path, collecting regular files in a stable order.
fn collect_files(path: &Path, out: &mut Vec<(PathBuf, String)>) -> Result<()> {
    if path.is_dir() {
        let mut children = fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            collect_files(&child.path(), out)?;
        }
    } else {
        out.push((path.to_owned(), member_name(path)));
    }
    Ok(())
}

fn member_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    let name = name.strip_prefix("./").unwrap_or(&name);
    name.trim_start_matches('/').to_owned()
}

/// Load a signing key from a `-k` argument and pick its slot algorithm
/// from the modulus size.  The legacy 1024-bit SHA-1 form is read-only:
/// signing with a key under 2048 bits is refused.
fn load_signer(arg: &str) -> Result<(SignatureAlgorithm, RsaPrivateKey)> {
    if arg.starts_with(':') {
        return Err(MarError::InvalidKey(format!(
            "{arg:?} names a built-in key set, which holds public keys only; \
             signing needs a private key file"
        )));
    }
    let key = load_private_key(&fs::read(arg)?)?;
    let bits = key.size() * 8;
    if bits < 2048 {
        return Err(MarError::InvalidKey(format!(
            "refusing to sign with a {bits}-bit key (minimum 2048)"
        )));
    }
    let algorithm = if bits >= 3072 {
        SignatureAlgorithm::RsaPkcs1Sha384
    } else {
        SignatureAlgorithm::RsaPkcs1Sha1
    };
    Ok((algorithm, key))
}

// ── Verify ───────────────────────────────────────────────────────────────────

fn cmd_verify(file: &Path, key_args: &[String]) -> Result<()> {
    let mut keys: Vec<VerifyKey> = Vec::new();
    for arg in key_args {
        keys.extend(resolve_verify_keys(arg)?);
    }

    let mut ar = Mar::open(file)?;
    match ar.verify(&keys, VerifyPolicy::AnyKey)? {
        VerifyOutcome::Verified(n) => {
            println!("{}: verified OK ({n} signature(s))", file.display());
            Ok(())
        }
        VerifyOutcome::NoSignatures => {
            println!("{}: no signatures", file.display());
            Ok(())
        }
        VerifyOutcome::FailedSignature(slot) => Err(MarError::FailedSignature(slot)),
        VerifyOutcome::UnknownSignatureAlgorithm(slot) => {
            Err(MarError::UnknownSignatureAlgorithm(slot))
        }
    }
}
