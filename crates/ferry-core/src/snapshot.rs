//! Graph snapshot format — the package an object closure travels in.
//!
//! A snapshot interns every name, id and path once. Object headers refer to
//! those tables by index, and each object's field bytes live in their own
//! chunk so the receiver can construct every object before applying any
//! field (fields may point at siblings further down the header list).
//!
//! In memory a `GraphSnapshot` is handed from serializer to channel by value.
//! For the durable store it is framed as a fixed `SnapshotFrameHeader`
//! followed by a JSON body; the header carries a BLAKE3 hash of the body.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::id::{ObjectId, ServerId};
use crate::wire::WireError;

pub type NameIndex = u32;
pub type IdIndex = u32;
pub type PathIndex = u32;

// ── References and values ─────────────────────────────────────────────────────

/// How a field refers to another object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "ref", content = "index", rename_all = "snake_case")]
pub enum EncodedRef {
    Null,
    /// Another object in this snapshot, by header position.
    Local(u32),
    /// An object outside the snapshot, by id only.
    Id(IdIndex),
    /// An object outside the snapshot that the receiver can find by name.
    Path(PathIndex),
}

/// A field value with object references replaced by table indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum EncodedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ref(EncodedRef),
    List(Vec<EncodedValue>),
    /// Field removed by a delta patch.
    Unset,
}

/// One `(field name, value)` pair inside an object chunk.
pub type FieldRecord = (NameIndex, EncodedValue);

/// Encode an object's fields into its chunk.
pub fn encode_fields(fields: &[FieldRecord]) -> Result<Bytes, WireError> {
    serde_json::to_vec(fields)
        .map(Bytes::from)
        .map_err(|e| WireError::Body(e.to_string()))
}

/// Decode an object chunk back into field records.
pub fn decode_fields(chunk: &[u8]) -> Result<Vec<FieldRecord>, WireError> {
    serde_json::from_slice(chunk).map_err(|e| WireError::Body(e.to_string()))
}

/// One link of a path reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub name: NameIndex,
    pub id: IdIndex,
}

/// The chain from a target object up to its outermost container.
/// `segments[0]` is the target itself, the last segment has no outer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathName {
    pub segments: Vec<PathSegment>,
}

/// Everything needed to construct an object before its fields are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub name: NameIndex,
    pub id: IdIndex,
    /// Registered kind tag; the receiver constructs through its kind table.
    pub kind: u16,
    pub outer: EncodedRef,
    pub prototype: EncodedRef,
    /// Lifecycle flags, see `ferry_services::object::ObjectFlags`.
    pub flags: u32,
    /// Owner once the package lands.
    pub owner: ServerId,
    /// Owner while the package was being sent.
    #[serde(default)]
    pub owner_before: ServerId,
    pub physics_authority: ServerId,
    pub serial: u64,
}

/// Snapshot flag: the package is a patch against existing objects.
pub const SNAPSHOT_FLAG_DELTA: u8 = 0x01;

/// A self-contained object-graph package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub names: Vec<String>,
    pub ids: Vec<ObjectId>,
    pub paths: Vec<PathName>,
    pub headers: Vec<ObjectHeader>,
    pub chunks: Vec<Bytes>,
    /// Header index of the object that was originally asked for.
    pub requested: u32,
    pub flags: u8,
}

impl GraphSnapshot {
    pub fn is_delta(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_DELTA != 0
    }

    pub fn object_count(&self) -> usize {
        self.headers.len()
    }

    pub fn name(&self, index: NameIndex) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn id(&self, index: IdIndex) -> Option<ObjectId> {
        self.ids.get(index as usize).copied()
    }

    /// Id of the object at a header position.
    pub fn header_id(&self, position: usize) -> Option<ObjectId> {
        self.headers.get(position).and_then(|h| self.id(h.id))
    }

    /// Id of the originally requested object.
    pub fn requested_id(&self) -> Option<ObjectId> {
        self.header_id(self.requested as usize)
    }

    /// All object ids carried by this package, in header order.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        (0..self.headers.len())
            .filter_map(|i| self.header_id(i))
            .collect()
    }

    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Frame the snapshot for storage: fixed header, then JSON body.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = serde_json::to_vec(self).map_err(|e| WireError::Body(e.to_string()))?;
        let body_len = frame_body_len(body.len())?;
        let header = SnapshotFrameHeader {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            flags: self.flags,
            reserved: 0,
            name_count: self.names.len() as u32,
            id_count: self.ids.len() as u32,
            path_count: self.paths.len() as u32,
            object_count: self.headers.len() as u32,
            body_len,
            content_hash: *blake3::hash(&body).as_bytes(),
        };
        let mut out = Vec::with_capacity(SNAPSHOT_FRAME_HEADER_LEN + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse and verify a framed snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = SnapshotFrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
            expected: SNAPSHOT_FRAME_HEADER_LEN,
            actual: bytes.len(),
        })?;

        // Copy packed fields to locals before use.
        let magic = header.magic;
        let version = header.version;
        let body_len = header.body_len as usize;
        let content_hash = header.content_hash;
        let object_count = header.object_count as usize;
        let name_count = header.name_count as usize;

        if magic != SNAPSHOT_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        if version != SNAPSHOT_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let body = &bytes[SNAPSHOT_FRAME_HEADER_LEN..];
        if body.len() != body_len {
            return Err(WireError::Truncated {
                expected: SNAPSHOT_FRAME_HEADER_LEN + body_len,
                actual: bytes.len(),
            });
        }
        if *blake3::hash(body).as_bytes() != content_hash {
            return Err(WireError::HashMismatch);
        }

        let snapshot: GraphSnapshot =
            serde_json::from_slice(body).map_err(|e| WireError::Body(e.to_string()))?;
        if snapshot.headers.len() != object_count
            || snapshot.chunks.len() != object_count
            || snapshot.names.len() != name_count
        {
            return Err(WireError::CountMismatch);
        }
        Ok(snapshot)
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"FRY1";

/// Current snapshot frame version.
pub const SNAPSHOT_VERSION: u8 = 0x01;

pub const SNAPSHOT_FRAME_HEADER_LEN: usize = 60;

/// Fixed prefix of an encoded snapshot.
///
/// Wire size: 60 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SnapshotFrameHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// Copy of `GraphSnapshot::flags`.
    pub flags: u8,
    /// Must be zero.
    pub reserved: u16,
    pub name_count: u32,
    pub id_count: u32,
    pub path_count: u32,
    pub object_count: u32,
    /// Length of the JSON body that follows this header.
    pub body_len: u32,
    /// BLAKE3 hash of the body bytes.
    pub content_hash: [u8; 32],
}

assert_eq_size!(SnapshotFrameHeader, [u8; SNAPSHOT_FRAME_HEADER_LEN]);

// ── Builder ───────────────────────────────────────────────────────────────────

/// Interning builder used by the serializer.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    names: Vec<String>,
    name_index: HashMap<String, NameIndex>,
    ids: Vec<ObjectId>,
    id_index: HashMap<ObjectId, IdIndex>,
    paths: Vec<PathName>,
    path_index: HashMap<PathName, PathIndex>,
    headers: Vec<ObjectHeader>,
    chunks: Vec<Bytes>,
    flags: u8,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta() -> Self {
        Self {
            flags: SNAPSHOT_FLAG_DELTA,
            ..Self::default()
        }
    }

    pub fn intern_name(&mut self, name: &str) -> NameIndex {
        if let Some(&index) = self.name_index.get(name) {
            return index;
        }
        let index = self.names.len() as NameIndex;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), index);
        index
    }

    pub fn intern_id(&mut self, id: ObjectId) -> IdIndex {
        *self.id_index.entry(id).or_insert_with(|| {
            self.ids.push(id);
            (self.ids.len() - 1) as IdIndex
        })
    }

    pub fn intern_path(&mut self, path: PathName) -> PathIndex {
        if let Some(&index) = self.path_index.get(&path) {
            return index;
        }
        let index = self.paths.len() as PathIndex;
        self.paths.push(path.clone());
        self.path_index.insert(path, index);
        index
    }

    /// Append an object. Returns its header position.
    pub fn push_object(&mut self, header: ObjectHeader, chunk: Bytes) -> u32 {
        self.headers.push(header);
        self.chunks.push(chunk);
        (self.headers.len() - 1) as u32
    }

    pub fn object_count(&self) -> usize {
        self.headers.len()
    }

    pub fn finish(self, requested: u32) -> GraphSnapshot {
        GraphSnapshot {
            names: self.names,
            ids: self.ids,
            paths: self.paths,
            headers: self.headers,
            chunks: self.chunks,
            requested,
            flags: self.flags,
        }
    }
}

fn frame_body_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLarge(len))
}
