//! End-to-end indexer scenarios (append a wire-format pack, commit, and
//! inspect the resulting `.pack`+`.idx` pair).

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use git_hash::{hasher::Hasher, HashAlgorithm, ObjectId};
use git_object::{Commit, Object, ObjectType};
use git_pack::entry::encode_entry_header;
use git_pack::indexer::{Indexer, IndexerOptions};
use git_pack::index::PackIndex;
use git_pack::store::{ObjectStore, StoreError};
use git_pack::{PackError, PACK_SIGNATURE, PACK_VERSION};

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn type_num(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

fn pack_header(entry_count: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(PACK_SIGNATURE);
    buf.extend_from_slice(&PACK_VERSION.to_be_bytes());
    buf.extend_from_slice(&entry_count.to_be_bytes());
    buf
}

fn append_trailer(pack: &mut Vec<u8>) {
    let checksum = Hasher::digest(HashAlgorithm::Sha1, pack).unwrap();
    pack.extend_from_slice(checksum.as_bytes());
}

/// S1 — a single commit whose tree is the well-known empty tree, with a
/// trivial author/committer and an empty message.
#[test]
fn s1_small_known_pack() {
    let dir = tempfile::tempdir().unwrap();

    let empty_tree = ObjectId::from_hex("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
    let sig = git_utils::date::Signature::parse(bstr::BStr::new(
        b"A U Thor <a@u.th> 1700000000 +0000",
    ))
    .unwrap();
    let commit = Commit {
        tree: empty_tree,
        parents: Vec::new(),
        author: sig.clone(),
        committer: sig,
        encoding: None,
        gpgsig: None,
        extra_headers: Vec::new(),
        message: bstr::BString::from(&b""[..]),
    };
    let payload = commit.serialize_content();
    let expected_oid =
        Hasher::hash_object(HashAlgorithm::Sha1, "commit", &payload).unwrap();

    let mut pack = pack_header(1);
    pack.extend_from_slice(&encode_entry_header(
        type_num(ObjectType::Commit),
        payload.len() as u64,
    ));
    pack.extend_from_slice(&deflate(&payload));
    append_trailer(&mut pack);

    let mut indexer =
        Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
    indexer.append(&pack).unwrap();
    let (pack_path, idx_path, trailer) = indexer.commit().unwrap();
    assert!(pack_path.exists());
    assert!(idx_path.exists());

    let idx = PackIndex::open(&idx_path).unwrap();
    assert_eq!(idx.num_objects(), 1);
    let offset = idx.lookup(&expected_oid).expect("commit indexed");
    assert_eq!(offset, 12, "single entry starts right after the 12-byte header");

    // pack trailer copied verbatim into the .idx's pack-checksum slot
    assert_eq!(trailer, idx.pack_checksum());
}

/// S3 — a blob followed by a ref-delta that resolves, unchanged, to the
/// same bytes as the blob. The two entries legally share an id.
#[test]
fn s3_ref_delta_resolves_to_identical_blob() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"a blob referenced by a trivial self-delta";
    let blob_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", content).unwrap();
    let delta = git_pack::delta::compute::compute_delta(content, content);

    let mut pack = pack_header(2);
    pack.extend_from_slice(&encode_entry_header(
        type_num(ObjectType::Blob),
        content.len() as u64,
    ));
    pack.extend_from_slice(&deflate(content));

    pack.extend_from_slice(&encode_entry_header(7, delta.len() as u64));
    pack.extend_from_slice(blob_oid.as_bytes());
    pack.extend_from_slice(&deflate(&delta));
    append_trailer(&mut pack);

    let mut indexer =
        Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
    indexer.append(&pack).unwrap();
    let (_pack_path, idx_path, _trailer) = indexer.commit().unwrap();

    let idx = PackIndex::open(&idx_path).unwrap();
    // two distinct entries at two distinct offsets, both resolving to the
    // same oid — not de-duplicated.
    assert_eq!(idx.num_objects(), 2);
    assert!(idx.lookup(&blob_oid).is_some());
}

/// S5 — a valid pack whose trailer has been corrupted. `append` (or
/// `commit`) must report `InvalidChecksum`-equivalent failure and leave no
/// files behind.
#[test]
fn s5_corrupt_trailer_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"hello\n";

    let mut pack = pack_header(1);
    pack.extend_from_slice(&encode_entry_header(
        type_num(ObjectType::Blob),
        content.len() as u64,
    ));
    pack.extend_from_slice(&deflate(content));
    append_trailer(&mut pack);
    // flip the last byte of the trailer
    let last = pack.len() - 1;
    pack[last] ^= 0xff;

    let mut indexer =
        Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
    let result = indexer.append(&pack);
    assert!(matches!(result, Err(PackError::ChecksumMismatch { .. })));

    drop(indexer);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(
        leftovers.is_empty(),
        "expected no files left in {:?}, found {:?}",
        dir.path(),
        leftovers
    );
}

struct EmptyStore;
impl ObjectStore for EmptyStore {
    fn exists(&self, _oid: &ObjectId) -> bool {
        false
    }
    fn read(&self, _oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, StoreError> {
        Ok(None)
    }
    fn header(&self, _oid: &ObjectId) -> Result<Option<(ObjectType, u64)>, StoreError> {
        Ok(None)
    }
}

/// S6 — a commit whose tree OID is absent from both the pack and the
/// external store, with verification enabled.
#[test]
fn s6_connectivity_verification_reports_missing_object() {
    let dir = tempfile::tempdir().unwrap();

    let missing_tree = ObjectId::from_hex("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef").unwrap();
    let sig = git_utils::date::Signature::parse(bstr::BStr::new(
        b"A U Thor <a@u.th> 1700000000 +0000",
    ))
    .unwrap();
    let commit = Commit {
        tree: missing_tree,
        parents: Vec::new(),
        author: sig.clone(),
        committer: sig,
        encoding: None,
        gpgsig: None,
        extra_headers: Vec::new(),
        message: bstr::BString::from(&b"orphaned commit\n"[..]),
    };
    let payload = commit.serialize_content();

    let mut pack = pack_header(1);
    pack.extend_from_slice(&encode_entry_header(
        type_num(ObjectType::Commit),
        payload.len() as u64,
    ));
    pack.extend_from_slice(&deflate(&payload));
    append_trailer(&mut pack);

    let store = EmptyStore;
    let opts = IndexerOptions {
        verify: true,
        odb: Some(&store),
        ..Default::default()
    };
    let mut indexer = Indexer::new(dir.path(), HashAlgorithm::Sha1, opts).unwrap();
    indexer.append(&pack).unwrap();
    let err = indexer.commit().unwrap_err();
    assert!(matches!(err, PackError::MissingObject(1)));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty());

    // sanity: parsing the payload back out gives the same missing tree.
    let parsed = Object::parse_content_with_algo(
        ObjectType::Commit,
        &payload,
        HashAlgorithm::Sha1,
    )
    .unwrap();
    match parsed {
        Object::Commit(c) => assert_eq!(c.tree, missing_tree),
        _ => panic!("expected a commit"),
    }
}
