//! The indexer (C8): turns a stream of incoming packfile bytes into a
//! committed `.pack`+`.idx` pair.
//!
//! [`Indexer`] owns a [`parser::PackfileParser`](crate::parser::PackfileParser)
//! and drives it with [`append`](Indexer::append) calls, persisting every
//! byte to a tempfile as it arrives. Once the parser reports
//! `packfile_complete`, [`commit`](Indexer::commit) resolves every delta
//! (injecting thin-pack bases from an external store when needed),
//! optionally verifies that every object the pack refers to is actually
//! reachable, writes the index, and atomically renames both files into
//! place next to the object store that asked for them.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;

use git_hash::collections::{OidMap, OidSet};
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::{Object, ObjectType};

use crate::entry::encode_entry_header;
use crate::parser::{DeltaKind, PackfileParser, Sink};
use crate::store::ObjectStore;
use crate::{AbortCode, PackError, IDX_SIGNATURE, IDX_VERSION};

/// Reported after every progress-relevant step. Mirrors libgit2's
/// `git_indexer_progress`, which is the payload shape this engine's
/// callers have always expected from an indexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerProgress {
    pub total_objects: u32,
    pub indexed_objects: u32,
    pub received_objects: u32,
    pub received_bytes: u64,
    pub local_objects: u32,
    pub total_deltas: u32,
    pub indexed_deltas: u32,
}

/// Configuration for an [`Indexer`].
pub struct IndexerOptions<'a> {
    /// Verify that every object the pack refers to (tree entries, commit
    /// parents/trees, tag targets) is either in this pack or in `odb`.
    pub verify: bool,
    /// Disable thin-base injection. A ref-delta whose base isn't already
    /// in the pack becomes a hard [`PackError::MissingBase`].
    pub keep_thin_pack: bool,
    /// fsync the pack, the idx, and the containing directory before rename.
    pub fsync: bool,
    /// POSIX permission bits applied to the created pack/idx files. Ignored
    /// on non-unix targets.
    pub mode: u32,
    /// Invoked after each progress-relevant step. A non-`Ok` return aborts
    /// the operation in progress.
    pub progress: Option<Box<dyn FnMut(IndexerProgress) -> Result<(), AbortCode> + 'a>>,
    /// The external object store consulted for thin-base injection and
    /// connectivity verification. Required if either is enabled.
    pub odb: Option<&'a dyn ObjectStore>,
}

impl<'a> Default for IndexerOptions<'a> {
    fn default() -> Self {
        Self {
            verify: false,
            keep_thin_pack: false,
            fsync: false,
            mode: 0o444,
            progress: None,
            odb: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Object(ObjectType),
    OfsDelta { base_offset: u64 },
    RefDelta { base_oid: ObjectId },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u64,
    header_len: u32,
    inflated_size: u64,
    compressed_size: u64,
    crc32: u32,
    kind: EntryKind,
    /// Known immediately for non-delta entries (from the parser's own
    /// hash) and for injected thin bases (from the store); set for
    /// deltas only once [`Indexer::resolve_entry`] materialises them.
    id: Option<ObjectId>,
}

/// Everything the [`Sink`] implementation needs, separated from [`Indexer`]
/// so that `self.parser.feed(bytes, &mut self.state)` borrows two disjoint
/// fields instead of `self` twice.
struct IndexerState<'a> {
    algo: HashAlgorithm,
    verify: bool,
    odb: Option<&'a dyn ObjectStore>,

    entries: Vec<Entry>,
    position_index: HashMap<u64, usize>,
    objects_by_id: OidMap<usize>,
    offset_delta_indices: Vec<usize>,
    ref_delta_indices: Vec<usize>,
    expected_ids: OidSet,
    has_thin_entries: bool,

    /// Accumulates the inflated bytes of the entry currently being parsed,
    /// only while `verify` is set (connectivity needs the object's parsed
    /// referents; otherwise the bytes are dropped as they stream by).
    current_object_buffer: Vec<u8>,

    trailer: Option<Vec<u8>>,

    total_objects: u32,
    indexed_objects: u32,
    received_objects: u32,
    received_bytes: u64,
    local_objects: u32,
    total_deltas: u32,
    indexed_deltas: u32,

    progress: Option<Box<dyn FnMut(IndexerProgress) -> Result<(), AbortCode> + 'a>>,

    /// A rich [`PackError`] can't travel through a [`Sink`] method's
    /// `Result<(), AbortCode>` return; when one occurs it is stashed here
    /// and the method returns [`PENDING_ERROR_ABORT_CODE`], which
    /// [`Indexer::append`] recognises and unwraps back into the real error.
    pending_error: Option<PackError>,
}

const PENDING_ERROR_ABORT_CODE: AbortCode = i32::MIN;

impl<'a> IndexerState<'a> {
    fn fire_progress(&mut self) -> Result<(), AbortCode> {
        match self.progress.as_mut() {
            Some(cb) => cb(IndexerProgress {
                total_objects: self.total_objects,
                indexed_objects: self.indexed_objects,
                received_objects: self.received_objects,
                received_bytes: self.received_bytes,
                local_objects: self.local_objects,
                total_deltas: self.total_deltas,
                indexed_deltas: self.indexed_deltas,
            }),
            None => Ok(()),
        }
    }

    /// Record that `oid` is expected to be resolvable, unless it's already
    /// known to this pack or to the external store.
    fn add_expected_oid(&mut self, oid: ObjectId) {
        if self.objects_by_id.contains_key(&oid) {
            return;
        }
        if let Some(odb) = self.odb {
            if odb.exists(&oid) {
                return;
            }
        }
        self.expected_ids.insert(oid);
    }

    /// Connectivity verification treats every tree entry's OID as a
    /// referent regardless of its mode (matching libgit2's uniform walk,
    /// not just gitlinks/blobs).
    fn add_referents(&mut self, obj: &Object) {
        match obj {
            Object::Blob(_) => {}
            Object::Tree(tree) => {
                for entry in &tree.entries {
                    self.add_expected_oid(entry.oid);
                }
            }
            Object::Commit(commit) => {
                self.add_expected_oid(commit.tree);
                for parent in &commit.parents {
                    self.add_expected_oid(*parent);
                }
            }
            Object::Tag(tag) => {
                self.add_expected_oid(tag.target);
            }
        }
    }
}

impl<'a> Sink for IndexerState<'a> {
    fn packfile_header(&mut self, _version: u32, entry_count: u32) -> Result<(), AbortCode> {
        self.total_objects = entry_count;
        self.entries.reserve(entry_count as usize);
        self.offset_delta_indices.reserve(entry_count as usize / 2);
        self.ref_delta_indices.reserve(entry_count as usize / 2);
        self.fire_progress()
    }

    fn object_start(
        &mut self,
        position: u64,
        header_len: u32,
        kind: ObjectType,
        uncompressed_size: u64,
    ) -> Result<(), AbortCode> {
        self.entries.push(Entry {
            offset: position,
            header_len,
            inflated_size: uncompressed_size,
            compressed_size: 0,
            crc32: 0,
            kind: EntryKind::Object(kind),
            id: None,
        });
        self.position_index.insert(position, self.entries.len() - 1);
        if self.verify {
            self.current_object_buffer.clear();
        }
        Ok(())
    }

    fn object_data(&mut self, bytes: &[u8]) -> Result<(), AbortCode> {
        if self.verify {
            self.current_object_buffer.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn object_complete(
        &mut self,
        compressed_size: u64,
        crc32: u32,
        oid: ObjectId,
    ) -> Result<(), AbortCode> {
        let idx = self.entries.len() - 1;
        let kind = {
            let entry = &mut self.entries[idx];
            entry.compressed_size = compressed_size;
            entry.crc32 = crc32;
            entry.id = Some(oid);
            match entry.kind {
                EntryKind::Object(k) => k,
                _ => unreachable!("object_complete follows object_start"),
            }
        };
        self.objects_by_id.insert(oid, idx);

        if self.verify {
            self.expected_ids.remove(&oid);
            match Object::parse_content_with_algo(kind, &self.current_object_buffer, self.algo) {
                Ok(obj) => self.add_referents(&obj),
                Err(e) => {
                    self.pending_error = Some(PackError::Object(e));
                    return Err(PENDING_ERROR_ABORT_CODE);
                }
            }
        }

        self.received_objects += 1;
        self.indexed_objects += 1;
        self.fire_progress()
    }

    fn delta_start(
        &mut self,
        position: u64,
        header_len: u32,
        kind: DeltaKind,
        uncompressed_size: u64,
        ref_id: Option<ObjectId>,
        ofs_offset: u64,
    ) -> Result<(), AbortCode> {
        let idx = self.entries.len();
        let entry_kind = match kind {
            DeltaKind::Ofs => {
                self.offset_delta_indices.push(idx);
                EntryKind::OfsDelta {
                    base_offset: position - ofs_offset,
                }
            }
            DeltaKind::Ref => {
                self.ref_delta_indices.push(idx);
                EntryKind::RefDelta {
                    base_oid: ref_id.expect("ref-delta always carries a base oid"),
                }
            }
        };
        self.entries.push(Entry {
            offset: position,
            header_len,
            inflated_size: uncompressed_size,
            compressed_size: 0,
            crc32: 0,
            kind: entry_kind,
            id: None,
        });
        self.position_index.insert(position, idx);
        Ok(())
    }

    // delta_data is intentionally ignored: the instructions are re-read
    // from the pack tempfile during resolution, not buffered here.

    fn delta_complete(&mut self, compressed_size: u64, crc32: u32) -> Result<(), AbortCode> {
        let idx = self.entries.len() - 1;
        let entry = &mut self.entries[idx];
        entry.compressed_size = compressed_size;
        entry.crc32 = crc32;
        self.received_objects += 1;
        self.fire_progress()
    }

    fn packfile_complete(&mut self, trailer: &[u8]) -> Result<(), AbortCode> {
        self.trailer = Some(trailer.to_vec());
        Ok(())
    }
}

/// Consumes incoming packfile bytes and produces a committed `.pack`+`.idx`
/// pair. See the module documentation for the lifecycle.
pub struct Indexer<'a> {
    parser: PackfileParser,
    state: IndexerState<'a>,

    pack_file: tempfile::NamedTempFile,
    parent_dir: PathBuf,
    mode: u32,
    fsync: bool,
    keep_thin_pack: bool,

    /// Current logical length of `pack_file`'s content, always excluding
    /// anything past a trailer that hasn't been rewritten yet.
    pack_len: u64,

    /// Lazily filled as deltas (and thin-injected bases) are resolved
    /// during `commit`; indexed the same as `state.entries`.
    resolved: Vec<Option<(ObjectType, Vec<u8>)>>,
}

impl<'a> Indexer<'a> {
    /// Create an indexer that will assemble its pack/idx pair inside
    /// `parent_dir`. `algo` governs the width of OIDs the incoming pack is
    /// expected to use.
    pub fn new(
        parent_dir: impl AsRef<Path>,
        algo: HashAlgorithm,
        opts: IndexerOptions<'a>,
    ) -> Result<Self, PackError> {
        let parent_dir = parent_dir.as_ref().to_path_buf();
        let pack_file = tempfile::Builder::new()
            .prefix("pack-")
            .suffix(".pack")
            .tempfile_in(&parent_dir)?;
        set_mode(pack_file.path(), opts.mode)?;

        let state = IndexerState {
            algo,
            verify: opts.verify,
            odb: opts.odb,
            entries: Vec::new(),
            position_index: HashMap::new(),
            objects_by_id: OidMap::new(),
            offset_delta_indices: Vec::new(),
            ref_delta_indices: Vec::new(),
            expected_ids: OidSet::new(),
            has_thin_entries: false,
            current_object_buffer: Vec::new(),
            trailer: None,
            total_objects: 0,
            indexed_objects: 0,
            received_objects: 0,
            received_bytes: 0,
            local_objects: 0,
            total_deltas: 0,
            indexed_deltas: 0,
            progress: opts.progress,
            pending_error: None,
        };

        Ok(Self {
            parser: PackfileParser::new(algo),
            state,
            pack_file,
            parent_dir,
            mode: opts.mode,
            fsync: opts.fsync,
            keep_thin_pack: opts.keep_thin_pack,
            pack_len: 0,
            resolved: Vec::new(),
        })
    }

    /// The path of the underlying pack tempfile (for diagnostics only;
    /// not stable across a successful `commit`).
    pub fn tempfile_path(&self) -> &Path {
        self.pack_file.path()
    }

    pub fn progress(&self) -> IndexerProgress {
        IndexerProgress {
            total_objects: self.state.total_objects,
            indexed_objects: self.state.indexed_objects,
            received_objects: self.state.received_objects,
            received_bytes: self.state.received_bytes,
            local_objects: self.state.local_objects,
            total_deltas: self.state.total_deltas,
            indexed_deltas: self.state.indexed_deltas,
        }
    }

    /// Append the next chunk of incoming packfile bytes. Any chunking is
    /// legal; see [`PackfileParser::feed`].
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), PackError> {
        self.pack_file.write_all(bytes)?;
        self.pack_len += bytes.len() as u64;
        self.state.received_bytes += bytes.len() as u64;

        match self.parser.feed(bytes, &mut self.state) {
            Ok(()) => Ok(()),
            Err(PackError::Aborted(code)) if code == PENDING_ERROR_ABORT_CODE => Err(self
                .state
                .pending_error
                .take()
                .unwrap_or(PackError::InvalidState("pending error missing"))),
            Err(e) => Err(e),
        }
    }

    /// Resolve every delta, verify connectivity if configured, write the
    /// index, and atomically rename both files into `parent_dir`. Consumes
    /// the indexer: on any error the partially-built tempfiles are cleaned
    /// up by their own `Drop` glue as `self` unwinds.
    pub fn commit(mut self) -> Result<(PathBuf, PathBuf, ObjectId), PackError> {
        if !self.parser.is_complete() {
            return Err(PackError::InvalidState(
                "commit() called before the packfile was fully received",
            ));
        }

        self.state.total_deltas = self.state.total_objects - self.state.indexed_objects;
        self.state
            .fire_progress()
            .map_err(PackError::Aborted)?;

        self.resolved = vec![None; self.state.entries.len()];

        let offset_indices = self.state.offset_delta_indices.clone();
        for idx in offset_indices {
            self.resolve_entry(idx, 0)?;
        }
        let ref_indices = self.state.ref_delta_indices.clone();
        for idx in ref_indices {
            self.resolve_entry(idx, 0)?;
        }

        if !self.state.expected_ids.is_empty() {
            return Err(PackError::MissingObject(self.state.expected_ids.len()));
        }

        if self.state.has_thin_entries {
            self.rehash_with_new_trailer()?;
        }

        let trailer_bytes = self
            .state
            .trailer
            .clone()
            .ok_or(PackError::InvalidState("commit() reached without a trailer"))?;
        let pack_checksum = ObjectId::from_bytes(&trailer_bytes, self.state.algo)?;

        let mut idx_entries: Vec<(ObjectId, u64, u32)> = self
            .state
            .entries
            .iter()
            .map(|e| {
                (
                    e.id.expect("every entry is resolved by the time commit writes the index"),
                    e.offset,
                    e.crc32,
                )
            })
            .collect();
        let idx_bytes = build_index_buffer(&mut idx_entries, &pack_checksum, self.state.algo)?;

        let mut idx_file = tempfile::Builder::new()
            .prefix("pack-")
            .suffix(".idx")
            .tempfile_in(&self.parent_dir)?;
        idx_file.write_all(&idx_bytes)?;
        set_mode(idx_file.path(), self.mode)?;

        if self.fsync {
            self.pack_file.as_file().sync_all()?;
            idx_file.as_file().sync_all()?;
        }

        let hex = pack_checksum.to_hex();
        let pack_dest = self.parent_dir.join(format!("pack-{hex}.pack"));
        let idx_dest = self.parent_dir.join(format!("pack-{hex}.idx"));

        // Persist the idx first: if this fails, both files are still
        // tempfiles and their own Drop glue cleans them up. If the pack
        // persist below fails instead, the idx has already been renamed
        // into place, so it is unlinked to avoid leaving a `.idx` with no
        // matching `.pack`.
        idx_file
            .persist(&idx_dest)
            .map_err(|e| PackError::Io(e.error))?;
        if let Err(e) = self.pack_file.persist(&pack_dest) {
            let _ = std::fs::remove_file(&idx_dest);
            return Err(PackError::Io(e.error));
        }

        if self.fsync {
            if let Ok(dir_file) = std::fs::File::open(&self.parent_dir) {
                let _ = dir_file.sync_all();
            }
        }

        Ok((pack_dest, idx_dest, pack_checksum))
    }

    /// Produce the fully inflated `(type, oid)` of entry `idx`, recursing
    /// into its base (injecting a thin base from the external store if a
    /// ref-delta's base isn't already in the pack). Memoised in
    /// `self.resolved` so no entry is resolved twice. `depth` counts the
    /// delta links already walked to reach `idx`, matching `pack.rs`'s
    /// `read_at_offset_with_resolver` bound so an incoming, not-yet-trusted
    /// pack can't drive unbounded recursion.
    fn resolve_entry(&mut self, idx: usize, depth: usize) -> Result<(ObjectType, ObjectId), PackError> {
        if let Some((obj_type, _)) = &self.resolved[idx] {
            let id = self.state.entries[idx]
                .id
                .expect("a resolved entry always carries an id");
            return Ok((*obj_type, id));
        }

        if depth >= crate::MAX_DELTA_CHAIN_DEPTH {
            return Err(PackError::DeltaChainTooDeep {
                offset: self.state.entries[idx].offset,
                max_depth: crate::MAX_DELTA_CHAIN_DEPTH,
            });
        }

        let entry = self.state.entries[idx];
        let (obj_type, id, data) = match entry.kind {
            EntryKind::Object(obj_type) => {
                let data = self.inflate_range(
                    entry.offset,
                    entry.header_len,
                    entry.compressed_size,
                    entry.inflated_size,
                )?;
                let id = entry.id.expect("non-delta entries carry their id from parsing");
                (obj_type, id, data)
            }
            EntryKind::OfsDelta { base_offset } => {
                let base_idx = *self.state.position_index.get(&base_offset).ok_or_else(|| {
                    PackError::InvalidDelta {
                        offset: entry.offset,
                        reason: "ofs-delta base position not present in pack".into(),
                    }
                })?;
                self.resolve_entry(base_idx, depth + 1)?;
                let base_data = self.resolved[base_idx]
                    .as_ref()
                    .expect("base resolved above")
                    .1
                    .clone();
                let base_type = self.resolved[base_idx].as_ref().unwrap().0;
                let delta_bytes = self.inflate_range(
                    entry.offset,
                    entry.header_len,
                    entry.compressed_size,
                    entry.inflated_size,
                )?;
                let target = crate::delta::apply::apply_delta(&base_data, &delta_bytes)?;
                let id = Hasher::hash_object(
                    self.state.algo,
                    std::str::from_utf8(base_type.as_bytes()).unwrap(),
                    &target,
                )?;
                (base_type, id, target)
            }
            EntryKind::RefDelta { base_oid } => {
                let base_idx = match self.state.objects_by_id.get(&base_oid).copied() {
                    Some(i) => i,
                    None => self.inject_thin_base(&base_oid)?,
                };
                self.resolve_entry(base_idx, depth + 1)?;
                let base_data = self.resolved[base_idx]
                    .as_ref()
                    .expect("base resolved above")
                    .1
                    .clone();
                let base_type = self.resolved[base_idx].as_ref().unwrap().0;
                let delta_bytes = self.inflate_range(
                    entry.offset,
                    entry.header_len,
                    entry.compressed_size,
                    entry.inflated_size,
                )?;
                let target = crate::delta::apply::apply_delta(&base_data, &delta_bytes)?;
                let id = Hasher::hash_object(
                    self.state.algo,
                    std::str::from_utf8(base_type.as_bytes()).unwrap(),
                    &target,
                )?;
                (base_type, id, target)
            }
        };

        self.state.entries[idx].id = Some(id);
        self.state.objects_by_id.insert(id, idx);

        if !matches!(entry.kind, EntryKind::Object(_)) {
            self.state.indexed_deltas += 1;
            self.state.indexed_objects += 1;
            self.state
                .fire_progress()
                .map_err(PackError::Aborted)?;
        }

        if self.state.verify {
            self.state.expected_ids.remove(&id);
            let obj = Object::parse_content_with_algo(obj_type, &data, self.state.algo)?;
            self.state.add_referents(&obj);
        }

        self.resolved[idx] = Some((obj_type, data));
        Ok((obj_type, id))
    }

    /// Inflate the payload of the entry at `offset` (header already
    /// consumed) and verify it matches `inflated_size` exactly.
    fn inflate_range(
        &self,
        offset: u64,
        header_len: u32,
        compressed_size: u64,
        inflated_size: u64,
    ) -> Result<Vec<u8>, PackError> {
        let data_start = offset + header_len as u64;
        let data_len = compressed_size - header_len as u64;

        let mut file = self.pack_file.as_file();
        file.seek(SeekFrom::Start(data_start))?;
        let mut compressed = vec![0u8; data_len as usize];
        file.read_exact(&mut compressed)?;

        let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
        let mut out = Vec::with_capacity(inflated_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| PackError::Zlib(e.to_string()))?;
        if out.len() as u64 != inflated_size {
            return Err(PackError::CorruptEntry(offset));
        }
        Ok(out)
    }

    /// A ref-delta's base isn't in the pack; fetch it from the external
    /// store and append it as a full object entry. Bytes appended this way
    /// count toward `local_objects`, never toward `received_bytes` — they
    /// never arrived over the wire.
    fn inject_thin_base(&mut self, base_oid: &ObjectId) -> Result<usize, PackError> {
        if self.keep_thin_pack {
            return Err(PackError::MissingBase(*base_oid));
        }
        let odb = self.state.odb.ok_or(PackError::MissingBase(*base_oid))?;
        let (base_type, base_bytes) = match odb.read(base_oid) {
            Ok(Some(pair)) => pair,
            Ok(None) | Err(_) => return Err(PackError::MissingBase(*base_oid)),
        };

        if !self.state.has_thin_entries {
            let trailer_len = self.state.algo.digest_len() as u64;
            let new_len = self.pack_len - trailer_len;
            self.pack_file.as_file().set_len(new_len)?;
            self.pack_len = new_len;
            self.state.has_thin_entries = true;
        }

        let type_num = match base_type {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        };
        let header = encode_entry_header(type_num, base_bytes.len() as u64);
        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(&base_bytes)?;
            encoder.finish()?;
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&compressed);
        let crc32 = crc.finalize();

        let offset = self.pack_len;
        {
            let mut file = self.pack_file.as_file();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&header)?;
            file.write_all(&compressed)?;
        }
        self.pack_len += (header.len() + compressed.len()) as u64;

        let entry = Entry {
            offset,
            header_len: header.len() as u32,
            inflated_size: base_bytes.len() as u64,
            compressed_size: (header.len() + compressed.len()) as u64,
            crc32,
            kind: EntryKind::Object(base_type),
            id: Some(*base_oid),
        };
        let idx = self.state.entries.len();
        self.state.entries.push(entry);
        self.state.position_index.insert(offset, idx);
        self.state.objects_by_id.insert(*base_oid, idx);
        self.resolved.push(Some((base_type, base_bytes)));
        self.state.local_objects += 1;

        Ok(idx)
    }

    /// After thin-base injection, the old trailer no longer reflects the
    /// pack's true contents: rewrite `entry_count`, rehash byte 0..pack_len
    /// from scratch, and append the fresh trailer.
    fn rehash_with_new_trailer(&mut self) -> Result<(), PackError> {
        let new_count = self.state.entries.len() as u32;
        {
            let mut file = self.pack_file.as_file();
            file.seek(SeekFrom::Start(8))?;
            file.write_all(&new_count.to_be_bytes())?;
        }

        let mut hasher = Hasher::new(self.state.algo);
        {
            let mut file = self.pack_file.as_file();
            file.seek(SeekFrom::Start(0))?;
            let mut buf = vec![0u8; 64 * 1024];
            let mut remaining = self.pack_len;
            while remaining > 0 {
                let take = remaining.min(buf.len() as u64) as usize;
                file.read_exact(&mut buf[..take])?;
                hasher.update(&buf[..take]);
                remaining -= take as u64;
            }
        }
        let new_trailer = hasher.finalize()?;

        {
            let mut file = self.pack_file.as_file();
            file.seek(SeekFrom::Start(self.pack_len))?;
            file.write_all(new_trailer.as_bytes())?;
        }
        self.pack_len += new_trailer.as_bytes().len() as u64;
        self.state.trailer = Some(new_trailer.as_bytes().to_vec());
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), PackError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), PackError> {
    Ok(())
}

/// Build a v2 `.idx` buffer, adapted from [`crate::write::build_pack_index`]
/// to be generic over the hash algorithm (needed for SHA-256 pack OIDs,
/// which that function's SHA-1-only self-digest can't produce) and to
/// return an in-memory buffer rather than writing straight to a path, so
/// the indexer can put it through its own tempfile/rename machinery.
fn build_index_buffer(
    entries: &mut [(ObjectId, u64, u32)],
    pack_checksum: &ObjectId,
    algo: HashAlgorithm,
) -> Result<Vec<u8>, PackError> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = Vec::new();
    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let mut fanout = [0u32; 256];
    for (oid, _, _) in entries.iter() {
        fanout[oid.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        buf.extend_from_slice(&count.to_be_bytes());
    }

    for (oid, _, _) in entries.iter() {
        buf.extend_from_slice(oid.as_bytes());
    }

    for (_, _, crc) in entries.iter() {
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    let mut large_offsets: Vec<u64> = Vec::new();
    for (_, offset, _) in entries.iter() {
        if *offset >= 0x8000_0000 {
            let large_idx = large_offsets.len() as u32;
            buf.extend_from_slice(&(0x8000_0000u32 | large_idx).to_be_bytes());
            large_offsets.push(*offset);
        } else {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
    }
    for offset in &large_offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    buf.extend_from_slice(pack_checksum.as_bytes());

    let mut hasher = Hasher::new(algo);
    hasher.update(&buf);
    let idx_checksum = hasher.finalize()?;
    buf.extend_from_slice(idx_checksum.as_bytes());

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::PackIndex;
    use git_object::ObjectType;
    use std::sync::Mutex;

    struct EmptyStore;
    impl ObjectStore for EmptyStore {
        fn exists(&self, _oid: &ObjectId) -> bool {
            false
        }
        fn read(
            &self,
            _oid: &ObjectId,
        ) -> Result<Option<(ObjectType, Vec<u8>)>, crate::store::StoreError> {
            Ok(None)
        }
        fn header(
            &self,
            _oid: &ObjectId,
        ) -> Result<Option<(ObjectType, u64)>, crate::store::StoreError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MapStore {
        objects: Mutex<std::collections::HashMap<ObjectId, (ObjectType, Vec<u8>)>>,
    }
    impl ObjectStore for MapStore {
        fn exists(&self, oid: &ObjectId) -> bool {
            self.objects.lock().unwrap().contains_key(oid)
        }
        fn read(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<(ObjectType, Vec<u8>)>, crate::store::StoreError> {
            Ok(self.objects.lock().unwrap().get(oid).cloned())
        }
        fn header(
            &self,
            oid: &ObjectId,
        ) -> Result<Option<(ObjectType, u64)>, crate::store::StoreError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(oid)
                .map(|(t, b)| (*t, b.len() as u64)))
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// A minimal hand-built pack: a sequence of full (non-delta) objects.
    fn build_simple_pack(objects: &[(ObjectType, &[u8])]) -> Vec<u8> {
        let mut pack = Vec::new();
        pack.extend_from_slice(crate::PACK_SIGNATURE);
        pack.extend_from_slice(&crate::PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(objects.len() as u32).to_be_bytes());
        for (obj_type, data) in objects {
            let type_num = match obj_type {
                ObjectType::Commit => 1,
                ObjectType::Tree => 2,
                ObjectType::Blob => 3,
                ObjectType::Tag => 4,
            };
            pack.extend_from_slice(&encode_entry_header(type_num, data.len() as u64));
            pack.extend_from_slice(&deflate(data));
        }
        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(checksum.as_bytes());
        pack
    }

    #[test]
    fn indexes_a_pack_with_no_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let pack = build_simple_pack(&[
            (ObjectType::Blob, b"hello world"),
            (ObjectType::Blob, b"a second blob"),
        ]);

        let mut indexer =
            Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
        indexer.append(&pack).unwrap();
        let (pack_path, idx_path, checksum) = indexer.commit().unwrap();

        assert!(pack_path.exists());
        assert!(idx_path.exists());
        assert_eq!(pack_path.file_name().unwrap().to_str().unwrap(), format!("pack-{}.pack", checksum.to_hex()));

        let idx = PackIndex::open(&idx_path).unwrap();
        assert_eq!(idx.num_objects(), 2);
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"hello world").unwrap();
        assert!(idx.lookup(&oid).is_some());
    }

    #[test]
    fn resolves_an_offset_delta() {
        let dir = tempfile::tempdir().unwrap();
        let base = b"the quick brown fox jumps over the lazy dog";
        let target = b"the quick brown fox jumps over the lazy cat";
        let delta = crate::delta::compute::compute_delta(base, target);

        let mut pack = Vec::new();
        pack.extend_from_slice(crate::PACK_SIGNATURE);
        pack.extend_from_slice(&crate::PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&2u32.to_be_bytes());

        let base_header = encode_entry_header(3, base.len() as u64);
        pack.extend_from_slice(&base_header);
        pack.extend_from_slice(&deflate(base));

        let delta_entry_offset = pack.len() as u64;
        let delta_header = encode_entry_header(6, delta.len() as u64);
        let ofs_bytes = crate::entry::encode_ofs_delta_offset(delta_entry_offset);
        pack.extend_from_slice(&delta_header);
        pack.extend_from_slice(&ofs_bytes);
        pack.extend_from_slice(&deflate(&delta));

        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(checksum.as_bytes());

        let mut indexer =
            Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
        indexer.append(&pack).unwrap();
        let (_pack_path, idx_path, _checksum) = indexer.commit().unwrap();

        let idx = PackIndex::open(&idx_path).unwrap();
        assert_eq!(idx.num_objects(), 2);
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", target).unwrap();
        assert!(idx.lookup(&target_oid).is_some());
    }

    #[test]
    fn missing_ref_delta_base_without_odb_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing_base = ObjectId::from_hex("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        let delta = crate::delta::compute::compute_delta(b"base", b"target value");

        let mut pack = Vec::new();
        pack.extend_from_slice(crate::PACK_SIGNATURE);
        pack.extend_from_slice(&crate::PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&encode_entry_header(7, delta.len() as u64));
        pack.extend_from_slice(missing_base.as_bytes());
        pack.extend_from_slice(&deflate(&delta));
        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(checksum.as_bytes());

        let store = EmptyStore;
        let opts = IndexerOptions {
            odb: Some(&store),
            ..Default::default()
        };
        let mut indexer = Indexer::new(dir.path(), HashAlgorithm::Sha1, opts).unwrap();
        indexer.append(&pack).unwrap();
        let err = indexer.commit().unwrap_err();
        assert!(matches!(err, PackError::MissingBase(oid) if oid == missing_base));
    }

    #[test]
    fn thin_base_is_injected_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let base = b"a shared base blob used by several objects";
        let target = b"a shared base blob used by several objects, modified";
        let delta = crate::delta::compute::compute_delta(base, target);
        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base).unwrap();

        let mut pack = Vec::new();
        pack.extend_from_slice(crate::PACK_SIGNATURE);
        pack.extend_from_slice(&crate::PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&encode_entry_header(7, delta.len() as u64));
        pack.extend_from_slice(base_oid.as_bytes());
        pack.extend_from_slice(&deflate(&delta));
        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(checksum.as_bytes());

        let store = MapStore::default();
        store
            .objects
            .lock()
            .unwrap()
            .insert(base_oid, (ObjectType::Blob, base.to_vec()));
        let opts = IndexerOptions {
            odb: Some(&store),
            ..Default::default()
        };
        let mut indexer = Indexer::new(dir.path(), HashAlgorithm::Sha1, opts).unwrap();
        indexer.append(&pack).unwrap();
        let (_pack_path, idx_path, _checksum) = indexer.commit().unwrap();

        let idx = PackIndex::open(&idx_path).unwrap();
        // the thin base was injected as a second entry
        assert_eq!(idx.num_objects(), 2);
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", target).unwrap();
        assert!(idx.lookup(&target_oid).is_some());
        assert!(idx.lookup(&base_oid).is_some());
    }

    #[test]
    fn failed_pack_persist_after_idx_persist_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let pack = build_simple_pack(&[(ObjectType::Blob, b"hello world")]);
        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        let hex = checksum.to_hex();

        // Occupy the final `.pack` path with a directory so the pack's
        // rename-into-place fails after the idx has already been renamed
        // successfully, exercising the cleanup path in `commit`.
        let pack_dest = dir.path().join(format!("pack-{hex}.pack"));
        std::fs::create_dir(&pack_dest).unwrap();

        let mut indexer =
            Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
        indexer.append(&pack).unwrap();
        let err = indexer.commit().unwrap_err();
        assert!(matches!(err, PackError::Io(_)));

        let idx_dest = dir.path().join(format!("pack-{hex}.idx"));
        assert!(
            !idx_dest.exists(),
            "idx should be unlinked after the pack rename failed"
        );
        assert!(pack_dest.is_dir(), "pre-existing directory left untouched");
    }

    #[test]
    fn resolve_entry_rejects_depth_at_bound() {
        let dir = tempfile::tempdir().unwrap();
        let pack = build_simple_pack(&[(ObjectType::Blob, b"x")]);

        let mut indexer =
            Indexer::new(dir.path(), HashAlgorithm::Sha1, IndexerOptions::default()).unwrap();
        indexer.append(&pack).unwrap();
        indexer.resolved = vec![None; indexer.state.entries.len()];

        // Drive `resolve_entry` directly at the documented depth bound,
        // mirroring the guard `commit` relies on to keep a long delta
        // chain from recursing the Rust stack away.
        let err = indexer
            .resolve_entry(0, crate::MAX_DELTA_CHAIN_DEPTH)
            .unwrap_err();
        assert!(matches!(
            err,
            PackError::DeltaChainTooDeep { max_depth, .. } if max_depth == crate::MAX_DELTA_CHAIN_DEPTH
        ));
    }
}
