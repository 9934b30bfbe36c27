//! Durable snapshot store and the Database peer that serves it.
//!
//! Snapshots are stored per root object in a two-level directory:
//!   {root}/{blake3(id)[0..2]}/{id:016x}.frame
//!
//! Each file is one framed `GraphSnapshot`. Writes go to a temp file and
//! are renamed into place, so a reader never sees half a frame. Rewriting a
//! root with byte-identical content is skipped.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::DashMap;
use ferry_core::wire::{MigrationMetadata, ResidentHint};
use ferry_core::{Envelope, GraphSnapshot, MigrationIntent, ObjectId, PeerMessage, ServerId};
use memmap2::Mmap;

use crate::channel::{InboundSource, PeerSender};

const FRAME_EXTENSION: &str = "frame";

/// Snapshot files keyed by root object id.
#[derive(Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    /// Root id → content hash of the stored frame.
    hashes: DashMap<ObjectId, [u8; 32]>,
    /// Any stored object id → the root whose frame contains it.
    containing: DashMap<ObjectId, ObjectId>,
}

impl SnapshotStore {
    /// Open (or create) a store and index whatever it already holds.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        let store = Self {
            root,
            hashes: DashMap::new(),
            containing: DashMap::new(),
        };
        store.reindex()?;
        Ok(store)
    }

    fn reindex(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)?.flatten() {
            let Ok(bucket) = fs::read_dir(entry.path()) else {
                continue;
            };
            for file in bucket.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FRAME_EXTENSION) {
                    continue;
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                    .map(ObjectId::from_raw)
                else {
                    tracing::warn!(path = %path.display(), "unrecognised file in store");
                    continue;
                };
                let bytes = fs::read(&path)
                    .with_context(|| format!("failed to read frame: {}", path.display()))?;
                let snapshot = GraphSnapshot::decode(&bytes)
                    .with_context(|| format!("corrupt frame: {}", path.display()))?;
                self.index(id, &snapshot, *blake3::hash(&bytes).as_bytes());
            }
        }
        tracing::debug!(roots = self.hashes.len(), "snapshot store indexed");
        Ok(())
    }

    fn index(&self, root: ObjectId, snapshot: &GraphSnapshot, hash: [u8; 32]) {
        self.hashes.insert(root, hash);
        for id in snapshot.object_ids() {
            self.containing.insert(id, root);
        }
    }

    pub fn has(&self, root: ObjectId) -> bool {
        self.hashes.contains_key(&root)
    }

    /// Root whose stored frame contains `object`.
    pub fn root_of(&self, object: ObjectId) -> Option<ObjectId> {
        self.containing.get(&object).map(|r| *r)
    }

    /// Persist a closure under its root id.
    ///
    /// Returns false when the stored frame already had this content.
    pub fn put(&self, root: ObjectId, snapshot: &GraphSnapshot) -> Result<bool> {
        let bytes = snapshot.encode().context("failed to encode snapshot")?;
        let hash = *blake3::hash(&bytes).as_bytes();
        if self.hashes.get(&root).is_some_and(|h| *h == hash) {
            return Ok(false);
        }

        let path = self.frame_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(&bytes).context("failed to write frame")?;
            file.sync_all().context("failed to sync frame to disk")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        // A smaller closure no longer contains what it used to.
        self.containing.retain(|_, r| *r != root);
        self.index(root, snapshot, hash);
        tracing::trace!(%root, hash = hex::encode(&hash[..8]), "snapshot stored");
        Ok(true)
    }

    /// Load the frame stored for `root`.
    pub fn get(&self, root: ObjectId) -> Result<Option<GraphSnapshot>> {
        let path = self.frame_path(root);
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open frame: {}", path.display()))?;

        // Safety: opened read-only and the map is dropped before we return.
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap frame: {}", path.display()))?
        };
        let snapshot = GraphSnapshot::decode(&mmap)
            .with_context(|| format!("corrupt frame: {}", path.display()))?;
        Ok(Some(snapshot))
    }

    pub fn remove(&self, root: ObjectId) -> Result<()> {
        let path = self.frame_path(root);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove frame: {}", path.display()))?;
        }
        self.hashes.remove(&root);
        self.containing.retain(|_, r| *r != root);
        Ok(())
    }

    /// Number of stored roots.
    pub fn count(&self) -> usize {
        self.hashes.len()
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(e) = removed {
                    tracing::warn!(path = %path.display(), error = %e, "failed to clear store entry");
                }
            }
        }
        self.hashes.clear();
        self.containing.clear();
    }

    fn frame_path(&self, root: ObjectId) -> PathBuf {
        let bucket = hex::encode(&blake3::hash(&root.raw().to_be_bytes()).as_bytes()[..1]);
        self.root
            .join(bucket)
            .join(format!("{:016x}.{FRAME_EXTENSION}", root.raw()))
    }
}

// ── Database peer ─────────────────────────────────────────────────────────────

/// The fleet's durable source for objects no server holds.
///
/// Accepts `StoreSnapshot` and answers `RequestObject`. A restored closure
/// is handed to the requester with ownership; until that server persists it
/// again, further requests are pointed at it instead of restoring twice.
pub struct DatabasePeer {
    store: SnapshotStore,
    sender: PeerSender,
    handed_out: DashMap<ObjectId, ResidentHint>,
}

impl DatabasePeer {
    pub fn new(store: SnapshotStore, sender: PeerSender) -> Self {
        Self {
            store,
            sender,
            handed_out: DashMap::new(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Handle everything that has arrived. Returns how many envelopes were
    /// handled.
    pub fn pump(&self, inbound: &mut impl InboundSource) -> Result<usize> {
        let envelopes = inbound.pump();
        let count = envelopes.len();
        for envelope in envelopes {
            self.handle(envelope)?;
        }
        Ok(count)
    }

    pub fn handle(&self, envelope: Envelope) -> Result<()> {
        match envelope.message {
            PeerMessage::StoreSnapshot { object, snapshot } => {
                let written = self.store.put(object, &snapshot)?;
                self.handed_out.remove(&object);
                tracing::info!(%object, from = %envelope.from, written, "closure persisted");
            }
            PeerMessage::RequestObject {
                object, requester, ..
            } => self.restore(object, requester)?,
            other => {
                tracing::debug!(kind = other.kind(), from = %envelope.from, "database ignores message");
            }
        }
        Ok(())
    }

    fn restore(&self, object: ObjectId, requester: ServerId) -> Result<()> {
        let Some(root) = self.store.root_of(object) else {
            tracing::debug!(%object, %requester, "not in store");
            self.sender.deny_request(object, requester, None);
            return Ok(());
        };
        if let Some(holder) = self.handed_out.get(&root).map(|h| *h) {
            self.sender.deny_request(object, requester, Some(holder));
            return Ok(());
        }
        let Some(mut snapshot) = self.store.get(root)? else {
            self.sender.deny_request(object, requester, None);
            return Ok(());
        };

        let Some(position) = (0..snapshot.object_count()).find(|&i| snapshot.header_id(i) == Some(object))
        else {
            self.sender.deny_request(object, requester, None);
            return Ok(());
        };
        snapshot.requested = position as u32;
        let mut serial = 0;
        for header in &mut snapshot.headers {
            header.owner = requester;
            header.owner_before = ServerId::DATABASE;
            serial = serial.max(header.serial);
        }

        self.handed_out.insert(
            root,
            ResidentHint {
                server: requester,
                serial,
            },
        );
        tracing::info!(%object, %root, %requester, "closure restored from store");
        self.sender.send_snapshot(
            requester,
            snapshot,
            MigrationMetadata {
                requested: object,
                sender: ServerId::DATABASE,
                new_owner: requester,
                owner_before: ServerId::DATABASE,
                intent: MigrationIntent::TakeOwnership,
            },
        );
        Ok(())
    }
}
