//! The external object store capability the indexer consumes for thin-pack
//! base injection and connectivity verification.
//!
//! This trait is defined here rather than in `git-odb` (the crate whose
//! heading names it in the wider design) because `git-odb` already depends
//! on `git-pack` for `PackFile`; defining it in `git-odb` would create a
//! dependency cycle. `git-odb::ObjectDatabase` implements it here instead —
//! Rust's orphan rule permits a foreign trait to be implemented for a local
//! type, so the layering still reads as "the indexer depends on an
//! abstract capability, never on `ObjectDatabase` concretely."
//!
//! The error type is a boxed `std::error::Error` rather than `git-odb`'s
//! `OdbError` for the same reason: this crate cannot name that type.

use git_hash::ObjectId;
use git_object::ObjectType;

/// A boxed, type-erased error from the backing store.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Read-only access to an object store external to the pack being indexed.
///
/// Used for thin-pack base injection (a ref-delta's base may live outside
/// the incoming pack) and connectivity verification (a referent may
/// legitimately already be present elsewhere).
pub trait ObjectStore {
    /// Does an object with this id exist in the store?
    fn exists(&self, oid: &ObjectId) -> bool;

    /// Read an object's type and full content.
    fn read(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, StoreError>;

    /// Read just an object's type and size, without its content.
    fn header(&self, oid: &ObjectId) -> Result<Option<(ObjectType, u64)>, StoreError>;
}
