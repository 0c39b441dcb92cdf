//! Resumable streaming packfile parser (C6).
//!
//! [`PackfileParser`] accepts packfile bytes through repeated calls to
//! [`feed`](PackfileParser::feed), in chunks of any size and split at any
//! byte boundary, and drives a [`Sink`] through the wire format's state
//! machine exactly once per logical event regardless of how the input was
//! chunked. All per-entry state (partial header bytes, inflate state, the
//! running per-object hash, the running whole-pack hash) lives on the
//! parser struct, not on a call's stack, which is what makes this
//! resumable rather than a one-shot `parse(&[u8])`.

use flate2::{Decompress, FlushDecompress, Status};

use crate::{AbortCode, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;

/// Which kind of delta an in-flight entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Ofs,
    Ref,
}

/// Callback trait driven by [`PackfileParser::feed`].
///
/// Every method has a default no-op body returning `Ok(())`, matching
/// libgit2's "a null callback pointer means uninstalled" convention,
/// rendered as an idiomatic Rust trait instead of a struct of function
/// pointers plus an opaque `void *` payload.
pub trait Sink {
    fn packfile_header(&mut self, _version: u32, _entry_count: u32) -> Result<(), AbortCode> {
        Ok(())
    }

    fn object_start(
        &mut self,
        _position: u64,
        _header_len: u32,
        _kind: ObjectType,
        _uncompressed_size: u64,
    ) -> Result<(), AbortCode> {
        Ok(())
    }

    fn object_data(&mut self, _bytes: &[u8]) -> Result<(), AbortCode> {
        Ok(())
    }

    fn object_complete(
        &mut self,
        _compressed_size: u64,
        _crc32: u32,
        _oid: ObjectId,
    ) -> Result<(), AbortCode> {
        Ok(())
    }

    fn delta_start(
        &mut self,
        _position: u64,
        _header_len: u32,
        _kind: DeltaKind,
        _uncompressed_size: u64,
        _ref_id: Option<ObjectId>,
        _ofs_offset: u64,
    ) -> Result<(), AbortCode> {
        Ok(())
    }

    fn delta_data(&mut self, _bytes: &[u8]) -> Result<(), AbortCode> {
        Ok(())
    }

    fn delta_complete(&mut self, _compressed_size: u64, _crc32: u32) -> Result<(), AbortCode> {
        Ok(())
    }

    fn packfile_complete(&mut self, _trailer: &[u8]) -> Result<(), AbortCode> {
        Ok(())
    }
}

const DECOMPRESS_CHUNK: usize = 32 * 1024;

/// Running state for the variable-length type+size byte sequence that
/// opens every entry header.
#[derive(Debug, Default)]
struct TypeSizeAcc {
    have_first: bool,
    type_num: u8,
    size: u64,
    shift: u32,
    more: bool,
}

impl TypeSizeAcc {
    fn step(&mut self, byte: u8) {
        if !self.have_first {
            self.type_num = (byte >> 4) & 0x07;
            self.size = (byte & 0x0f) as u64;
            self.shift = 4;
            self.have_first = true;
        } else {
            self.size |= ((byte & 0x7f) as u64) << self.shift;
            self.shift += 7;
        }
        self.more = byte & 0x80 != 0;
    }
}

/// Running state for the ofs-delta variable-length negative offset, using
/// git's "+1 roll" continuation accumulation (see [`crate::entry::parse_entry_header`],
/// which implements the same algorithm for the non-resumable case).
#[derive(Debug, Default)]
struct OfsAcc {
    started: bool,
    base_offset: u64,
    more: bool,
}

impl OfsAcc {
    fn step(&mut self, byte: u8) {
        if !self.started {
            self.base_offset = (byte & 0x7f) as u64;
            self.started = true;
        } else {
            self.base_offset = ((self.base_offset + 1) << 7) + (byte & 0x7f) as u64;
        }
        self.more = byte & 0x80 != 0;
    }
}

enum HeaderPhase {
    TypeSize(TypeSizeAcc),
    Ofs { type_num: u8, size: u64, acc: OfsAcc },
    Ref { type_num: u8, size: u64, collected: Vec<u8> },
}

struct EntryHeaderState {
    position: u64,
    header_bytes: Vec<u8>,
    phase: HeaderPhase,
}

enum ActiveKind {
    Object { object_type: ObjectType, hasher: Hasher },
    Delta,
}

struct ActiveEntry {
    position: u64,
    header_len: u32,
    uncompressed_size: u64,
    decompress: Decompress,
    crc: crc32fast::Hasher,
    compressed_consumed: u64,
    produced: u64,
    kind: ActiveKind,
}

enum State {
    Header { buf: Vec<u8> },
    EntryHeader(EntryHeaderState),
    Data(ActiveEntry),
    Trailer { buf: Vec<u8> },
    Complete,
    Failed,
}

/// A resumable streaming parser for the packfile wire format.
pub struct PackfileParser {
    algo: HashAlgorithm,
    state: State,
    position: u64,
    version: u32,
    entry_count: u32,
    entries_done: u32,
    running_hash: Option<Hasher>,
    trailer: Option<Vec<u8>>,
}

impl PackfileParser {
    /// Create a parser expecting OIDs of the given hash algorithm (governs
    /// the width of ref-delta base OIDs and the trailer checksum).
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            algo,
            state: State::Header { buf: Vec::with_capacity(PACK_HEADER_SIZE) },
            position: 0,
            version: 0,
            entry_count: 0,
            entries_done: 0,
            running_hash: Some(Hasher::new(algo)),
            trailer: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// The trailer bytes, once the parser has reached `COMPLETE`.
    pub fn trailer(&self) -> Option<&[u8]> {
        self.trailer.as_deref()
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Feed the next chunk of packfile bytes, driving `sink` through every
    /// event this chunk completes. Any byte boundary is legal, including
    /// inside a header byte, an ofs-delta varint, mid-inflate, or
    /// mid-trailer; splitting a single feed into many arbitrary pieces
    /// produces the same sequence of sink calls as one large feed.
    pub fn feed(&mut self, bytes: &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        if matches!(self.state, State::Complete) {
            return Err(PackError::InvalidState("feed() called after packfile_complete"));
        }
        if matches!(self.state, State::Failed) {
            return Err(PackError::InvalidState("feed() called on a failed parser"));
        }
        match self.feed_inner(bytes, sink) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    fn hash_bytes(&mut self, bytes: &[u8]) {
        self.running_hash
            .as_mut()
            .expect("running hash present before COMPLETE")
            .update(bytes);
    }

    fn feed_inner(&mut self, mut input: &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        while !input.is_empty() {
            match &mut self.state {
                State::Header { .. } => self.step_header(&mut input, sink)?,
                State::EntryHeader(_) => self.step_entry_header(&mut input, sink)?,
                State::Data(_) => self.step_data(&mut input, sink)?,
                State::Trailer { .. } => self.step_trailer(&mut input, sink)?,
                State::Complete | State::Failed => unreachable!("guarded in feed()"),
            }
        }
        Ok(())
    }

    fn step_header(&mut self, input: &mut &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        let State::Header { buf } = &mut self.state else { unreachable!() };
        let need = PACK_HEADER_SIZE - buf.len();
        let take = need.min(input.len());
        buf.extend_from_slice(&input[..take]);
        self.hash_bytes(&input[..take]);
        self.position += take as u64;
        *input = &input[take..];

        let State::Header { buf } = &self.state else { unreachable!() };
        if buf.len() < PACK_HEADER_SIZE {
            return Ok(());
        }

        if &buf[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader(format!(
                "bad signature {:?}",
                &buf[0..4]
            )));
        }
        let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let entry_count = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        self.version = version;
        self.entry_count = entry_count;

        sink.packfile_header(version, entry_count)
            .map_err(PackError::Aborted)?;

        if entry_count == 0 {
            self.state = State::Trailer { buf: Vec::with_capacity(self.algo.digest_len()) };
        } else {
            self.state = self.start_entry_header();
        }
        Ok(())
    }

    fn start_entry_header(&self) -> State {
        State::EntryHeader(EntryHeaderState {
            position: self.position,
            header_bytes: Vec::with_capacity(8),
            phase: HeaderPhase::TypeSize(TypeSizeAcc::default()),
        })
    }

    fn step_entry_header(&mut self, input: &mut &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        let byte = input[0];
        *input = &input[1..];
        self.position += 1;
        self.hash_bytes(std::slice::from_ref(&byte));
        let algo = self.algo;

        // First pass: feed `byte` into whichever sub-state is active and
        // extract an owned `Outcome` describing what (if anything) just
        // finished. This ends the borrow of `self.state` before we need a
        // fresh `&mut self.state` to act on the outcome below — matching on
        // a borrow and then re-borrowing `self` inside the same match would
        // otherwise conflict, since a match scrutinee's borrow lives for
        // the whole match.
        enum Outcome {
            Pending,
            Object { type_num: u8, size: u64 },
            NeedOfsSubheader { type_num: u8, size: u64 },
            NeedRefSubheader { type_num: u8, size: u64 },
            OfsDone { size: u64, offset: u64 },
            RefDone { size: u64, ref_oid: ObjectId },
        }

        let State::EntryHeader(entry) = &mut self.state else { unreachable!() };
        entry.header_bytes.push(byte);
        let entry_position = entry.position;

        let outcome = match &mut entry.phase {
            HeaderPhase::TypeSize(acc) => {
                acc.step(byte);
                if acc.more {
                    Outcome::Pending
                } else {
                    match acc.type_num {
                        1..=4 => Outcome::Object { type_num: acc.type_num, size: acc.size },
                        6 => Outcome::NeedOfsSubheader { type_num: acc.type_num, size: acc.size },
                        7 => Outcome::NeedRefSubheader { type_num: acc.type_num, size: acc.size },
                        other => {
                            return Err(PackError::InvalidHeader(format!(
                                "unknown pack entry type {other}"
                            )));
                        }
                    }
                }
            }
            HeaderPhase::Ofs { size, acc, .. } => {
                acc.step(byte);
                if acc.more {
                    Outcome::Pending
                } else {
                    Outcome::OfsDone { size: *size, offset: acc.base_offset }
                }
            }
            HeaderPhase::Ref { size, collected, .. } => {
                collected.push(byte);
                if collected.len() == algo.digest_len() {
                    let ref_oid = ObjectId::from_bytes(collected, algo)?;
                    Outcome::RefDone { size: *size, ref_oid }
                } else {
                    Outcome::Pending
                }
            }
        };

        match outcome {
            Outcome::Pending => {}
            Outcome::Object { type_num, size } => {
                let object_type = match type_num {
                    1 => ObjectType::Commit,
                    2 => ObjectType::Tree,
                    3 => ObjectType::Blob,
                    _ => ObjectType::Tag,
                };
                self.finish_object_header(entry_position, object_type, size, sink)?;
            }
            Outcome::NeedOfsSubheader { type_num, size } => {
                let State::EntryHeader(entry) = &mut self.state else { unreachable!() };
                entry.phase = HeaderPhase::Ofs { type_num, size, acc: OfsAcc::default() };
            }
            Outcome::NeedRefSubheader { type_num, size } => {
                let State::EntryHeader(entry) = &mut self.state else { unreachable!() };
                entry.phase = HeaderPhase::Ref {
                    type_num,
                    size,
                    collected: Vec::with_capacity(algo.digest_len()),
                };
            }
            Outcome::OfsDone { size, offset } => {
                if offset == 0 || offset > entry_position {
                    return Err(PackError::InvalidDelta {
                        offset: entry_position,
                        reason: "ofs-delta base is non-positive or forward-pointing".into(),
                    });
                }
                self.finish_delta_header(entry_position, DeltaKind::Ofs, size, None, offset, sink)?;
            }
            Outcome::RefDone { size, ref_oid } => {
                self.finish_delta_header(entry_position, DeltaKind::Ref, size, Some(ref_oid), 0, sink)?;
            }
        }
        Ok(())
    }

    fn finish_object_header(
        &mut self,
        position: u64,
        object_type: ObjectType,
        uncompressed_size: u64,
        sink: &mut dyn Sink,
    ) -> Result<(), PackError> {
        let State::EntryHeader(entry) = &self.state else { unreachable!() };
        let header_bytes = entry.header_bytes.clone();
        let header_len = header_bytes.len() as u32;

        sink.object_start(position, header_len, object_type, uncompressed_size)
            .map_err(PackError::Aborted)?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header_bytes);
        let mut hasher = Hasher::new(self.algo);
        hasher.update(format!("{object_type} {uncompressed_size}\0").as_bytes());

        self.state = State::Data(ActiveEntry {
            position,
            header_len,
            uncompressed_size,
            decompress: Decompress::new(true),
            crc,
            compressed_consumed: 0,
            produced: 0,
            kind: ActiveKind::Object { object_type, hasher },
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_delta_header(
        &mut self,
        position: u64,
        kind: DeltaKind,
        uncompressed_size: u64,
        ref_id: Option<ObjectId>,
        ofs_offset: u64,
        sink: &mut dyn Sink,
    ) -> Result<(), PackError> {
        let State::EntryHeader(entry) = &self.state else { unreachable!() };
        let header_bytes = entry.header_bytes.clone();
        let header_len = header_bytes.len() as u32;

        sink.delta_start(position, header_len, kind, uncompressed_size, ref_id, ofs_offset)
            .map_err(PackError::Aborted)?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header_bytes);

        self.state = State::Data(ActiveEntry {
            position,
            header_len,
            uncompressed_size,
            decompress: Decompress::new(true),
            crc,
            compressed_consumed: 0,
            produced: 0,
            kind: ActiveKind::Delta,
        });
        Ok(())
    }

    fn step_data(&mut self, input: &mut &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        let mut out_buf = vec![0u8; DECOMPRESS_CHUNK];
        loop {
            let State::Data(entry) = &mut self.state else { unreachable!() };
            let before_in = entry.decompress.total_in();
            let before_out = entry.decompress.total_out();
            let status = entry
                .decompress
                .decompress(input, &mut out_buf, FlushDecompress::None)
                .map_err(|e| PackError::Zlib(e.to_string()))?;
            let consumed = (entry.decompress.total_in() - before_in) as usize;
            let produced = (entry.decompress.total_out() - before_out) as usize;

            if consumed > 0 {
                let consumed_slice = &input[..consumed];
                entry.crc.update(consumed_slice);
                self.position += consumed as u64;
                entry.compressed_consumed += consumed as u64;
                self.hash_bytes(consumed_slice);
                *input = &input[consumed..];
            }

            if produced > 0 {
                let produced_slice = &out_buf[..produced];
                entry.produced += produced as u64;
                match &mut entry.kind {
                    ActiveKind::Object { hasher, .. } => {
                        hasher.update(produced_slice);
                        sink.object_data(produced_slice).map_err(PackError::Aborted)?;
                    }
                    ActiveKind::Delta => {
                        sink.delta_data(produced_slice).map_err(PackError::Aborted)?;
                    }
                }
            }

            if status == Status::StreamEnd {
                self.finish_entry(sink)?;
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                // Exhausted this chunk's input without reaching stream end;
                // wait for the next feed() call.
                return Ok(());
            }
        }
    }

    fn finish_entry(&mut self, sink: &mut dyn Sink) -> Result<(), PackError> {
        let State::Data(entry) = std::mem::replace(&mut self.state, State::Failed) else {
            unreachable!()
        };
        if entry.produced != entry.uncompressed_size {
            return Err(PackError::InvalidHeader(format!(
                "entry at offset {} inflated to {} bytes, header declared {}",
                entry.position, entry.produced, entry.uncompressed_size
            )));
        }
        let compressed_size = entry.header_len as u64 + entry.compressed_consumed;
        let crc32 = entry.crc.finalize();

        match entry.kind {
            ActiveKind::Object { hasher, .. } => {
                let oid = hasher.finalize()?;
                sink.object_complete(compressed_size, crc32, oid)
                    .map_err(PackError::Aborted)?;
            }
            ActiveKind::Delta => {
                sink.delta_complete(compressed_size, crc32)
                    .map_err(PackError::Aborted)?;
            }
        }

        self.entries_done += 1;
        self.state = if self.entries_done == self.entry_count {
            State::Trailer { buf: Vec::with_capacity(self.algo.digest_len()) }
        } else {
            self.start_entry_header()
        };
        Ok(())
    }

    fn step_trailer(&mut self, input: &mut &[u8], sink: &mut dyn Sink) -> Result<(), PackError> {
        let hash_len = self.algo.digest_len();
        let State::Trailer { buf } = &mut self.state else { unreachable!() };
        let need = hash_len - buf.len();
        let take = need.min(input.len());
        buf.extend_from_slice(&input[..take]);
        self.position += take as u64;
        *input = &input[take..];

        let State::Trailer { buf } = &self.state else { unreachable!() };
        if buf.len() < hash_len {
            return Ok(());
        }

        let reported = ObjectId::from_bytes(buf, self.algo)?;
        let computed = self
            .running_hash
            .take()
            .expect("running hash present before COMPLETE")
            .finalize()?;
        if reported != computed {
            return Err(PackError::ChecksumMismatch {
                expected: reported,
                actual: computed,
            });
        }

        let trailer = buf.clone();
        sink.packfile_complete(&trailer).map_err(PackError::Aborted)?;
        self.trailer = Some(trailer);
        self.state = State::Complete;
        Ok(())
    }
}
