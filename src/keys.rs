//! Built-in key table — compile-time, immutable, resolved by name.
//!
//! Each symbolic name maps to one or more DER SubjectPublicKeyInfo blobs.
//! A name carries several keys while a rotation is in flight: an archive
//! verifies against a name when its signatures check out against any of
//! the name's keys.  Names are never negotiated and the table is never
//! extended at runtime; a deployment that needs different keys rebuilds.

use rsa::RsaPublicKey;

use crate::crypto::{load_public_key, VerifyKey};
use crate::error::{MarError, Result};

/// One named set of rotation-peer public keys.
pub struct BuiltinKeySet {
    pub name: &'static str,
    pub keys: &'static [&'static [u8]],
}

static MOZILLA_RELEASE_1: &[u8] = include_bytes!("../keys/mozilla_release_1.der");
static MOZILLA_RELEASE_2: &[u8] = include_bytes!("../keys/mozilla_release_2.der");
static MOZILLA_NIGHTLY_1: &[u8] = include_bytes!("../keys/mozilla_nightly_1.der");
static AUTOGRAPH_STAGE_1: &[u8] = include_bytes!("../keys/autograph_stage_1.der");

/// Every key set this build knows.
pub const BUILTIN_KEY_SETS: &[BuiltinKeySet] = &[
    BuiltinKeySet {
        name: "mozilla-release",
        keys: &[MOZILLA_RELEASE_1, MOZILLA_RELEASE_2],
    },
    BuiltinKeySet {
        name: "mozilla-nightly",
        keys: &[MOZILLA_NIGHTLY_1],
    },
    BuiltinKeySet {
        name: "autograph-stage",
        keys: &[AUTOGRAPH_STAGE_1],
    },
];

/// Look up the DER blobs behind a symbolic name.
pub fn builtin_keys(name: &str) -> Option<&'static [&'static [u8]]> {
    BUILTIN_KEY_SETS
        .iter()
        .find(|set| set.name == name)
        .map(|set| set.keys)
}

/// All symbolic names, for help output.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN_KEY_SETS.iter().map(|set| set.name)
}

/// Resolve a `-k` argument into public keys: `:name` consults the
/// built-in table, anything else is read from the filesystem.
pub fn resolve_public_keys(arg: &str) -> Result<Vec<RsaPublicKey>> {
    if let Some(name) = arg.strip_prefix(':') {
        let ders = builtin_keys(name).ok_or_else(|| {
            MarError::InvalidKey(format!(
                "unknown built-in key set {name:?} (known: {})",
                builtin_names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        ders.iter().map(|der| load_public_key(der)).collect()
    } else {
        Ok(vec![load_public_key(&std::fs::read(arg)?)?])
    }
}

/// Resolve a `-k` argument into verification candidates, each key offered
/// for every algorithm.
pub fn resolve_verify_keys(arg: &str) -> Result<Vec<VerifyKey>> {
    Ok(resolve_public_keys(arg)?
        .into_iter()
        .flat_map(VerifyKey::for_any_algorithm)
        .collect())
}
