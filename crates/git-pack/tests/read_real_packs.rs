//! Integration tests: read objects from a C git-generated packfile.
//!
//! The fixture pack was created by running:
//! ```sh
//! git init
//! <60-line padded text> > hello.txt && git add . && git commit -m "initial"
//! <same file, two lines edited> > hello.txt && git add . && git commit -m "modify"
//! echo "Another file" > other.txt && git add . && git commit -m "add other"
//! git repack -a -d -f --depth=250 --window=250
//! ```
//! hello.txt is large enough (~3.4KB) that git's pack-objects chooses to
//! store the second revision as an OFS_DELTA against the first, giving this
//! fixture a real delta entry to exercise.

use git_hash::ObjectId;
use git_object::ObjectType;
use git_pack::pack::PackFile;

fn fixture_pack() -> PackFile {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let pack_path = format!("{manifest_dir}/tests/fixtures/test.pack");
    PackFile::open(&pack_path).expect("failed to open fixture pack")
}

#[test]
fn open_c_git_pack() {
    let pack = fixture_pack();
    assert_eq!(pack.num_objects(), 9);
}

#[test]
fn read_known_blob() {
    let pack = fixture_pack();
    // original hello.txt blob, stored whole (the delta base)
    let oid = ObjectId::from_hex("5ac2f90d91f0244afeefd5beea5054cf17d4beab").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Blob);
    assert_eq!(obj.data.len(), 3410);
    assert!(String::from_utf8_lossy(&obj.data).contains("line number 5 of the readme"));
}

#[test]
fn read_modified_blob() {
    let pack = fixture_pack();
    // modified hello.txt blob, stored as an OFS_DELTA
    let oid = ObjectId::from_hex("8e19fd3ccdcbf185b21d69691ac02d7295278a58").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Blob);
    assert_eq!(obj.data.len(), 3370);
    assert!(String::from_utf8_lossy(&obj.data).contains("line number 5 has been modified now"));
}

#[test]
fn read_another_blob() {
    let pack = fixture_pack();
    // "Another file\n" blob
    let oid = ObjectId::from_hex("b0b9fc8f6cc2f8f110306ed7f6d1ce079541b41f").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Blob);
    assert_eq!(obj.data, b"Another file\n");
}

#[test]
fn read_commit_objects() {
    let pack = fixture_pack();

    // Latest commit: "add other"
    let oid = ObjectId::from_hex("ce4fcf17541ea8c4777975415e6549e19ab8b6e3").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Commit);
    assert!(String::from_utf8_lossy(&obj.data).contains("add other"));

    // Middle commit: "modify"
    let oid = ObjectId::from_hex("72130ecada96d29601f27b8fc6968b920d05cd7b").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Commit);
    assert!(String::from_utf8_lossy(&obj.data).contains("modify"));
}

#[test]
fn read_delta_object() {
    let pack = fixture_pack();

    // The modified hello.txt blob is stored as an OFS_DELTA against the
    // original hello.txt blob.
    let oid = ObjectId::from_hex("8e19fd3ccdcbf185b21d69691ac02d7295278a58").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Blob);
    assert!(String::from_utf8_lossy(&obj.data).contains("line number 40 has been modified now"));
}

#[test]
fn read_tree_objects() {
    let pack = fixture_pack();

    // Tree with two entries (hello.txt + other.txt)
    let oid = ObjectId::from_hex("cbb619ed27000a19a4ad1f95f022870a8fb8d601").unwrap();
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Tree);
}

#[test]
fn read_all_objects_via_index() {
    let pack = fixture_pack();

    let mut count = 0;
    for (oid, _offset) in pack.index().iter() {
        let obj = pack.read_object(&oid).unwrap();
        assert!(obj.is_some(), "failed to read object {oid}");
        count += 1;
    }
    assert_eq!(count, 9);
}

#[test]
fn missing_oid_returns_none() {
    let pack = fixture_pack();
    let missing = ObjectId::from_hex("0000000000000000000000000000000000000000").unwrap();
    assert_eq!(pack.read_object(&missing).unwrap(), None);
}

#[test]
fn verify_checksum() {
    let pack = fixture_pack();
    pack.verify_checksum().unwrap();
}
