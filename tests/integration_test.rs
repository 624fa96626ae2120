use marlin::archive::Mar;
use marlin::codec::Compression;
use marlin::crypto::{load_private_key, load_public_key, VerifyKey, VerifyPolicy};
use marlin::error::MarError;
use marlin::io_stream::{MarReader, MarWriter, VerifyOutcome, WriteOptions};
use marlin::keys::{builtin_keys, resolve_verify_keys};
use marlin::signature::SignatureAlgorithm;
use marlin::ProductInformation;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

fn private_key(name: &str) -> RsaPrivateKey {
    load_private_key(&fs::read(fixture(name)).unwrap()).unwrap()
}

fn public_key(name: &str) -> RsaPublicKey {
    load_public_key(&fs::read(fixture(name)).unwrap()).unwrap()
}

const HELLO: &[u8] = b"hello";

fn binary_payload() -> Vec<u8> {
    (0u8..=255).collect()
}

/// `a.txt` and `dir/b.bin`, the canonical two-member fixture.
fn build_archive(path: &std::path::Path, options: WriteOptions) {
    let mut ar = Mar::create(path, options).unwrap();
    ar.add_member("a.txt", 0o644, &mut &HELLO[..]).unwrap();
    ar.add_member("dir/b.bin", 0o755, &mut &binary_payload()[..])
        .unwrap();
    ar.finalize().unwrap();
}

// ── Create / list / extract ──────────────────────────────────────────────────

#[test]
fn create_then_list_uncompressed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.mar");
    build_archive(&path, WriteOptions::default());

    let raw = fs::read(&path).unwrap();
    assert_eq!(&raw[0..4], b"MAR1");
    // header (8) + "hello" (5) + 256 binary bytes, then the index.
    let index_offset = u32::from_be_bytes(raw[4..8].try_into().unwrap());
    assert_eq!(index_offset, 8 + 5 + 256);
    // Uncompressed payloads are stored verbatim.
    assert_eq!(&raw[8..13], HELLO);

    let ar = Mar::open(&path).unwrap();
    let members = ar.list();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "a.txt");
    assert_eq!(members[0].size, 5);
    assert_eq!(members[0].mode, 0o644);
    assert_eq!(members[0].offset, 8);
    assert_eq!(members[1].name, "dir/b.bin");
    assert_eq!(members[1].size, 256);
    assert_eq!(members[1].mode, 0o755);
}

#[test]
fn roundtrip_all_codecs() {
    for compression in [Compression::None, Compression::Bzip2, Compression::Xz] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ar.mar");
        build_archive(&path, WriteOptions::compressed_with(compression));

        let mut ar = Mar::open(&path).unwrap();
        let index_offset = ar.reader().unwrap().index_offset();
        for member in ar.list() {
            assert!(
                member.offset < index_offset,
                "{compression:?}: payload must precede the index"
            );
        }
        assert_eq!(ar.read_member("a.txt").unwrap(), HELLO);
        assert_eq!(ar.read_member("dir/b.bin").unwrap(), binary_payload());
    }
}

#[test]
fn compressed_payloads_carry_codec_magic() {
    let dir = tempdir().unwrap();

    let bz = dir.path().join("bz.mar");
    build_archive(&bz, WriteOptions::compressed_with(Compression::Bzip2));
    let raw = fs::read(&bz).unwrap();
    let first = Mar::open(&bz).unwrap().list()[0].offset as usize;
    assert_eq!(&raw[first..first + 3], b"BZh");

    let xz = dir.path().join("xz.mar");
    build_archive(&xz, WriteOptions::compressed_with(Compression::Xz));
    let raw = fs::read(&xz).unwrap();
    let first = Mar::open(&xz).unwrap().list()[0].offset as usize;
    assert_eq!(&raw[first..first + 6], b"\xFD7zXZ\x00");
}

#[test]
fn extract_all_recreates_the_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ar.mar");
    build_archive(&path, WriteOptions::compressed_with(Compression::Bzip2));

    let dest = tempdir().unwrap();
    let mut ar = Mar::open(&path).unwrap();
    ar.extract_all(dest.path()).unwrap();

    assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), HELLO);
    assert_eq!(
        fs::read(dest.path().join("dir/b.bin")).unwrap(),
        binary_payload()
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dest.path().join("dir/b.bin"))
            .unwrap()
            .permissions()
            .mode();
        // Owner execute survives any common umask; group/other may not.
        assert_eq!(mode & 0o100, 0o100);
        let mode = fs::metadata(dest.path().join("a.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o100, 0);
    }
}

#[test]
fn empty_archive_is_legal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.mar");
    let ar = Mar::create(&path, WriteOptions::default()).unwrap();
    ar.finalize().unwrap();

    let raw = fs::read(&path).unwrap();
    assert_eq!(u32::from_be_bytes(raw[4..8].try_into().unwrap()), 8);

    let mut ar = Mar::open(&path).unwrap();
    assert!(ar.list().is_empty());
    assert_eq!(
        ar.verify(&[], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::NoSignatures
    );
}

#[test]
fn zero_byte_member_is_rejected_when_stored() {
    // Uncompressed, an empty payload occupies no bytes, so its index entry
    // would share an offset with the next member.
    let dir = tempdir().unwrap();
    let mut ar = Mar::create(dir.path().join("z.mar"), WriteOptions::default()).unwrap();
    let err = ar.add_member("empty", 0o644, &mut &b""[..]).unwrap_err();
    assert!(matches!(err, MarError::MalformedIndex(_)));
}

#[test]
fn zero_byte_members_roundtrip_under_compression() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.mar");
    let mut ar = Mar::create(&path, WriteOptions::compressed_with(Compression::Bzip2)).unwrap();
    ar.add_member("empty", 0o644, &mut &b""[..]).unwrap();
    ar.add_member("also-empty", 0o644, &mut &b""[..]).unwrap();
    ar.finalize().unwrap();

    let mut ar = Mar::open(&path).unwrap();
    assert_eq!(ar.list().len(), 2);
    assert_eq!(ar.read_member("empty").unwrap(), b"");
    assert_eq!(ar.read_member("also-empty").unwrap(), b"");
}

#[test]
fn overlong_member_name_is_rejected() {
    let dir = tempdir().unwrap();
    let mut ar = Mar::create(dir.path().join("n.mar"), WriteOptions::default()).unwrap();
    let long = "n".repeat(256);
    let err = ar.add_member(&long, 0o644, &mut &b"x"[..]).unwrap_err();
    assert!(matches!(err, MarError::NameTooLong { .. }));
}

#[test]
fn oversized_product_info_field_is_malformed() {
    let dir = tempdir().unwrap();
    // 64 characters leave no room for the terminator.
    let long = "x".repeat(64);
    let err = match Mar::create(
        dir.path().join("p.mar"),
        WriteOptions {
            compression: Compression::None,
            signers: Vec::new(),
            product_info: Some(ProductInformation::new(&long, "1.0")),
        },
    ) {
        Ok(_) => panic!("oversized product info field was accepted"),
        Err(e) => e,
    };
    assert!(matches!(err, MarError::MalformedString(_)));
}

#[test]
fn duplicate_member_names_are_rejected() {
    let dir = tempdir().unwrap();
    let mut ar = Mar::create(dir.path().join("dup.mar"), WriteOptions::default()).unwrap();
    ar.add_member("same", 0o644, &mut &b"one"[..]).unwrap();
    let err = ar.add_member("same", 0o644, &mut &b"two"[..]).unwrap_err();
    assert!(matches!(err, MarError::DuplicateName(name) if name == "same"));
}

// ── Signing and verification ─────────────────────────────────────────────────

fn signed_options(signers: Vec<(SignatureAlgorithm, RsaPrivateKey)>) -> WriteOptions {
    WriteOptions {
        compression: Compression::None,
        signers,
        product_info: None,
    }
}

#[test]
fn sign_and_verify_sha384_with_2048_bit_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha384,
            private_key("rsa2048.pem"),
        )]),
    );

    let mut ar = Mar::open(&path).unwrap();
    let block = ar.reader().unwrap().signatures().unwrap().clone();
    assert_eq!(block.total_file_size, fs::metadata(&path).unwrap().len());
    assert_eq!(block.entries.len(), 1);
    assert_eq!(block.entries[0].algorithm_id, 2);
    assert_eq!(block.entries[0].signature.len(), 256);

    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha384,
        public_key("rsa2048.pub.pem"),
    );
    assert_eq!(
        ar.verify(&[key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::Verified(1)
    );
}

#[test]
fn any_flipped_byte_breaks_the_signature() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha384,
            private_key("rsa2048.pem"),
        )]),
    );
    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha384,
        public_key("rsa2048.pub.pem"),
    );

    let pristine = fs::read(&path).unwrap();
    // Byte 100 sits inside the signature bytes, 292 inside a member
    // payload, len-2 on the last name character in the index.  All are
    // covered by the signature.
    for position in [100usize, 292, pristine.len() - 2] {
        let mut tampered = pristine.clone();
        tampered[position] ^= 0x01;
        fs::write(&path, &tampered).unwrap();
        let mut ar = Mar::open(&path).unwrap();
        assert_eq!(
            ar.verify(std::slice::from_ref(&key), VerifyPolicy::AnyKey)
                .unwrap(),
            VerifyOutcome::FailedSignature(0),
            "flip at byte {position}"
        );
    }
}

#[test]
fn wrong_key_fails_verification() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha1,
            private_key("rsa2048.pem"),
        )]),
    );

    let wrong = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048_other.pub.pem"),
    );
    let mut ar = Mar::open(&path).unwrap();
    assert_eq!(
        ar.verify(&[wrong], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::FailedSignature(0)
    );
}

#[test]
fn unsigned_archive_reports_no_signatures() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.mar");
    build_archive(&path, WriteOptions::default());

    let mut ar = Mar::open(&path).unwrap();
    assert!(ar.reader().unwrap().signatures().is_none());
    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048.pub.pem"),
    );
    assert_eq!(
        ar.verify(&[key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::NoSignatures
    );
}

#[test]
fn two_signatures_need_keys_for_both_algorithms() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dual.mar");
    build_archive(
        &path,
        signed_options(vec![
            (SignatureAlgorithm::RsaPkcs1Sha1, private_key("rsa2048.pem")),
            (
                SignatureAlgorithm::RsaPkcs1Sha384,
                private_key("rsa4096.pem"),
            ),
        ]),
    );

    let sha384_key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha384,
        public_key("rsa4096.pub.pem"),
    );
    let sha1_key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048.pub.pem"),
    );

    let mut ar = Mar::open(&path).unwrap();
    // Only the id-2 key: slot 0 (id 1) has no candidate.
    assert_eq!(
        ar.verify(std::slice::from_ref(&sha384_key), VerifyPolicy::AnyKey)
            .unwrap(),
        VerifyOutcome::UnknownSignatureAlgorithm(0)
    );
    assert_eq!(
        ar.verify(&[sha1_key, sha384_key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::Verified(2)
    );
}

#[test]
fn require_all_policy_demands_every_candidate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha1,
            private_key("rsa2048.pem"),
        )]),
    );

    let good = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048.pub.pem"),
    );
    let other = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048_other.pub.pem"),
    );

    let mut ar = Mar::open(&path).unwrap();
    assert_eq!(
        ar.verify(&[good.clone(), other.clone()], VerifyPolicy::AnyKey)
            .unwrap(),
        VerifyOutcome::Verified(1)
    );
    assert_eq!(
        ar.verify(&[good, other], VerifyPolicy::RequireAll).unwrap(),
        VerifyOutcome::FailedSignature(0)
    );
}

#[test]
fn legacy_1024_bit_sha1_signatures_verify() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha1,
            private_key("rsa1024.pem"),
        )]),
    );

    let mut ar = Mar::open(&path).unwrap();
    let block = ar.reader().unwrap().signatures().unwrap();
    assert_eq!(block.entries[0].signature.len(), 128);

    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa1024.pub.pem"),
    );
    assert_eq!(
        ar.verify(&[key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::Verified(1)
    );
}

#[test]
fn signing_is_deterministic() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.mar");
    let b = dir.path().join("b.mar");
    for path in [&a, &b] {
        build_archive(
            path,
            signed_options(vec![(
                SignatureAlgorithm::RsaPkcs1Sha384,
                private_key("rsa2048.pem"),
            )]),
        );
    }
    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn truncated_archive_never_verifies() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("signed.mar");
    build_archive(
        &path,
        signed_options(vec![(
            SignatureAlgorithm::RsaPkcs1Sha384,
            private_key("rsa2048.pem"),
        )]),
    );

    let mut raw = fs::read(&path).unwrap();
    raw.pop();
    assert!(matches!(open_err(raw), MarError::TruncatedFile { .. }));
}

// ── Product information ──────────────────────────────────────────────────────

#[test]
fn product_info_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("prod.mar");
    build_archive(
        &path,
        WriteOptions {
            compression: Compression::None,
            signers: Vec::new(),
            product_info: Some(ProductInformation::new("release", "99.0")),
        },
    );

    let mut ar = Mar::open(&path).unwrap();
    let info = ar.product_info().unwrap().unwrap();
    assert_eq!(info.mar_channel_id, "release");
    assert_eq!(info.product_version, "99.0");
}

#[test]
fn product_info_coexists_with_signatures() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("prod-signed.mar");
    build_archive(
        &path,
        WriteOptions {
            compression: Compression::Bzip2,
            signers: vec![(
                SignatureAlgorithm::RsaPkcs1Sha384,
                private_key("rsa4096.pem"),
            )],
            product_info: Some(ProductInformation::new("release-cck", "123.0.1")),
        },
    );

    let mut ar = Mar::open(&path).unwrap();
    let info = ar.product_info().unwrap().unwrap();
    assert_eq!(info.mar_channel_id, "release-cck");
    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha384,
        public_key("rsa4096.pub.pem"),
    );
    assert_eq!(
        ar.verify(&[key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::Verified(1)
    );
    assert_eq!(ar.read_member("a.txt").unwrap(), HELLO);
}

// ── Malformed archives ───────────────────────────────────────────────────────

/// A raw file with the given index entries over a zero-filled payload
/// region.
fn handcrafted(entries: &[(u32, u32, u32, &str)], payload_len: u32) -> Vec<u8> {
    let mut file = Vec::new();
    file.extend_from_slice(b"MAR1");
    file.extend_from_slice(&(8 + payload_len).to_be_bytes());
    file.resize(file.len() + payload_len as usize, 0);

    let mut index = Vec::new();
    for (offset, size, mode, name) in entries {
        index.extend_from_slice(&offset.to_be_bytes());
        index.extend_from_slice(&size.to_be_bytes());
        index.extend_from_slice(&mode.to_be_bytes());
        index.extend_from_slice(name.as_bytes());
        index.push(0);
    }
    file.extend_from_slice(&(index.len() as u32).to_be_bytes());
    file.extend_from_slice(&index);
    file
}

/// Open a raw byte image and return the parse error it must produce.
fn open_err(raw: Vec<u8>) -> MarError {
    match MarReader::open(Cursor::new(raw)) {
        Ok(_) => panic!("malformed archive was accepted"),
        Err(e) => e,
    }
}

#[test]
fn bad_magic_is_rejected() {
    let mut raw = handcrafted(&[], 0);
    raw[3] = b'2';
    assert!(matches!(open_err(raw), MarError::BadMagic));
}

#[test]
fn unsorted_index_is_rejected() {
    let raw = handcrafted(&[(108, 10, 0o644, "x"), (8, 100, 0o644, "y")], 110);
    assert!(matches!(open_err(raw), MarError::IndexNotSorted { .. }));
}

#[test]
fn out_of_range_payload_is_rejected() {
    let raw = handcrafted(&[(8, 200, 0o644, "x")], 110);
    assert!(matches!(open_err(raw), MarError::OffsetOutOfRange { .. }));
}

#[test]
fn duplicate_names_in_index_are_rejected() {
    let raw = handcrafted(&[(8, 10, 0o644, "x"), (20, 10, 0o644, "x")], 110);
    assert!(matches!(open_err(raw), MarError::DuplicateName(_)));
}

#[test]
fn payload_resembling_a_signature_block_is_not_misread() {
    // A member at offset 8 whose bytes declare the true file length but an
    // impossible signature count.  The length probe alone would bite; the
    // count check rejects it.
    let name = "p";
    let payload_len = 16u32;
    let index_len = 12 + name.len() as u32 + 1;
    let file_len = 8 + payload_len as u64 + 4 + index_len as u64;

    let mut raw = handcrafted(&[(8, payload_len, 0o644, name)], payload_len);
    assert_eq!(raw.len() as u64, file_len);
    raw[8..16].copy_from_slice(&file_len.to_be_bytes());
    raw[16..20].copy_from_slice(&9u32.to_be_bytes());

    let reader = MarReader::open(Cursor::new(raw)).unwrap();
    assert!(reader.signatures().is_none());
    assert_eq!(reader.entries().len(), 1);
}

// ── Key handling ─────────────────────────────────────────────────────────────

#[test]
fn key_loaders_accept_every_fixture_encoding() {
    let reference = private_key("rsa2048.pem").to_public_key();
    assert_eq!(private_key("rsa2048.pkcs1.pem").to_public_key(), reference);
    assert_eq!(public_key("rsa2048.pub.pem"), reference);
    assert_eq!(
        load_public_key(&fs::read(fixture("rsa2048.pub.der")).unwrap()).unwrap(),
        reference
    );
}

#[test]
fn builtin_key_table_resolves_names() {
    assert_eq!(builtin_keys("mozilla-release").unwrap().len(), 2);
    assert_eq!(builtin_keys("mozilla-nightly").unwrap().len(), 1);
    assert!(builtin_keys("no-such-set").is_none());

    // Two rotation keys, each offered for both algorithms.
    assert_eq!(resolve_verify_keys(":mozilla-release").unwrap().len(), 4);
    assert!(matches!(
        resolve_verify_keys(":no-such-set").unwrap_err(),
        MarError::InvalidKey(_)
    ));
}

// ── In-memory sinks ──────────────────────────────────────────────────────────

#[test]
fn writer_works_on_an_in_memory_sink() {
    let mut writer = MarWriter::new(
        Cursor::new(Vec::new()),
        WriteOptions {
            compression: Compression::Xz,
            signers: vec![(
                SignatureAlgorithm::RsaPkcs1Sha1,
                private_key("rsa2048.pem"),
            )],
            product_info: Some(ProductInformation::new("beta", "100.0")),
        },
    )
    .unwrap();
    writer.add_member("m", 0o600, &mut &b"payload"[..]).unwrap();
    let cursor = writer.finalize().unwrap();

    let mut reader = MarReader::open(Cursor::new(cursor.into_inner())).unwrap();
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.entries()[0].mode, 0o600);
    assert_eq!(
        reader.product_info().unwrap().unwrap().product_version,
        "100.0"
    );

    let key = VerifyKey::new(
        SignatureAlgorithm::RsaPkcs1Sha1,
        public_key("rsa2048.pub.pem"),
    );
    assert_eq!(
        reader.verify(&[key], VerifyPolicy::AnyKey).unwrap(),
        VerifyOutcome::Verified(1)
    );

    let mut out = Vec::new();
    let entry = reader.entries()[0].clone();
    reader.extract_entry(&entry, &mut out).unwrap();
    assert_eq!(out, b"payload");
}
