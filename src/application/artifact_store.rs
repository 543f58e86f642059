//! Content-addressed artifact cache on local disk.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<key[0..2]>/<key>/artifact.<ext>
//! <root>/<key[0..2]>/<key>/meta.json
//! <root>/.staging/
//! ```
//!
//! An entry is assembled in `.staging`, renamed into place, and only then
//! indexed, so readers never observe a half written artifact.

use crate::domain::{Artifact, JobKey, OutputFormat, Quality};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const SIDECAR: &str = "meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact root {path} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unreadable sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
}

/// Metadata the pipeline knows about an output before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub format: OutputFormat,
    pub quality: Quality,
    pub duration_secs: Option<f64>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: Vec<JobKey>,
    pub freed_bytes: u64,
    /// Entries that would have gone but were pinned by a lease.
    pub skipped_leased: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_total_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    key: String,
    format: OutputFormat,
    quality: Quality,
    checksum: String,
    size_bytes: u64,
    duration_secs: Option<f64>,
    title: Option<String>,
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

impl Sidecar {
    fn new(artifact: &Artifact, last_access: DateTime<Utc>) -> Self {
        Self {
            key: artifact.key.to_string(),
            format: artifact.format,
            quality: artifact.quality,
            checksum: artifact.checksum.clone(),
            size_bytes: artifact.size_bytes,
            duration_secs: artifact.duration_secs,
            title: artifact.title.clone(),
            created_at: artifact.created_at,
            last_access,
        }
    }
}

#[derive(Debug)]
struct Entry {
    artifact: Artifact,
    leases: AtomicUsize,
    last_access: Mutex<DateTime<Utc>>,
}

/// A pin on a stored artifact. While any lease is alive the entry cannot be
/// evicted, so the file behind [`ArtifactLease::path`] stays readable.
#[derive(Debug)]
pub struct ArtifactLease {
    entry: Arc<Entry>,
}

impl ArtifactLease {
    fn acquire(entry: &Arc<Entry>) -> Self {
        entry.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            entry: entry.clone(),
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.entry.artifact
    }

    pub fn path(&self) -> &Path {
        &self.entry.artifact.path
    }
}

impl Clone for ArtifactLease {
    fn clone(&self) -> Self {
        Self::acquire(&self.entry)
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        self.entry.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

type KeyLocks = Mutex<HashMap<JobKey, Arc<tokio::sync::Mutex<()>>>>;

/// Claim on the per-key publish lock. The map entry goes away with the last
/// claim, including when the owning future is dropped mid-publish.
struct KeySlot<'a> {
    locks: &'a KeyLocks,
    key: JobKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> KeySlot<'a> {
    fn claim(locks: &'a KeyLocks, key: &JobKey) -> Self {
        let lock = locks.lock().entry(key.clone()).or_default().clone();
        Self {
            locks,
            key: key.clone(),
            lock,
        }
    }
}

impl Drop for KeySlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Held by the map and by this slot only.
        let last = locks
            .get(&self.key)
            .map_or(false, |l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if last {
            locks.remove(&self.key);
        }
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    staging: PathBuf,
    max_total_bytes: u64,
    index: RwLock<HashMap<JobKey, Arc<Entry>>>,
    put_locks: KeyLocks,
}

impl ArtifactStore {
    /// Create or reopen the store at `root`, rebuilding the index from the
    /// sidecars found on disk.
    pub async fn open(root: impl Into<PathBuf>, max_total_bytes: u64) -> Result<Self, StoreError> {
        let root = root.into();
        let unwritable = |source| StoreError::Unwritable {
            path: root.clone(),
            source,
        };

        fs::create_dir_all(&root).await.map_err(unwritable)?;
        let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe").await.map_err(unwritable)?;
        fs::remove_file(&probe).await.map_err(unwritable)?;

        let staging = root.join(STAGING_DIR);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => debug!(path = %staging.display(), "cleared stale staging data"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&staging).await?;

        let store = Self {
            root,
            staging,
            max_total_bytes,
            index: RwLock::new(HashMap::new()),
            put_locks: Mutex::new(HashMap::new()),
        };
        let entries = store.scan().await?;
        let stats = {
            let mut index = store.index.write();
            for entry in entries {
                index.insert(entry.artifact.key.clone(), Arc::new(entry));
            }
            drop(index);
            store.stats()
        };
        info!(
            root = %store.root.display(),
            entries = stats.entries,
            total_bytes = stats.total_bytes,
            "artifact store opened"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_total_bytes: self.max_total_bytes,
        }
    }

    /// Non-blocking lookup: take a lease if the key is stored.
    pub fn lookup(&self, key: &JobKey) -> Option<ArtifactLease> {
        let index = self.index.read();
        let entry = index.get(key)?;
        *entry.last_access.lock() = Utc::now();
        Some(ArtifactLease::acquire(entry))
    }

    /// Write the entry's access time to its sidecar so LRU order survives a
    /// restart. Best effort.
    pub async fn persist_access(&self, lease: &ArtifactLease) {
        let key = &lease.artifact().key;
        let last_access = *lease.entry.last_access.lock();
        let sidecar = Sidecar::new(lease.artifact(), last_access);
        if let Err(e) = write_sidecar(&self.entry_dir(key), &sidecar).await {
            debug!(key = %key, error = %e, "could not persist access time");
        }
    }

    /// Publish `staged` as the artifact for `key`. Idempotent: when the key is
    /// already stored, the staged file is discarded and the existing entry
    /// returned.
    pub async fn put(
        &self,
        key: &JobKey,
        staged: &Path,
        draft: ArtifactDraft,
    ) -> Result<ArtifactLease, StoreError> {
        let slot = KeySlot::claim(&self.put_locks, key);
        let guard = slot.lock.lock().await;
        let result = self.publish(key, staged, draft).await;
        drop(guard);
        drop(slot);

        let lease = result?;
        let report = self.evict(&self.policy()).await;
        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                freed_bytes = report.freed_bytes,
                total_bytes = report.total_bytes,
                "evicted artifacts"
            );
        }
        Ok(lease)
    }

    async fn publish(
        &self,
        key: &JobKey,
        staged: &Path,
        draft: ArtifactDraft,
    ) -> Result<ArtifactLease, StoreError> {
        if let Some(existing) = self.lookup(key) {
            debug!(key = %key, "artifact already stored, discarding duplicate");
            remove_file_quietly(staged).await;
            return Ok(existing);
        }

        let stage_dir = self.staging.join(Uuid::new_v4().to_string());
        match self.assemble(key, staged, draft, &stage_dir).await {
            Ok(entry) => {
                let entry = Arc::new(entry);
                let lease = ArtifactLease::acquire(&entry);
                self.index.write().insert(key.clone(), entry);
                info!(key = %key, size_bytes = lease.artifact().size_bytes, "artifact published");
                Ok(lease)
            }
            Err(e) => {
                remove_file_quietly(staged).await;
                if let Err(cleanup) = fs::remove_dir_all(&stage_dir).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %stage_dir.display(), error = %cleanup, "failed to clean staging");
                    }
                }
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        key: &JobKey,
        staged: &Path,
        draft: ArtifactDraft,
        stage_dir: &Path,
    ) -> Result<Entry, StoreError> {
        let file_name = artifact_file_name(draft.format);
        let checksum = sha256_file(staged).await?;
        let size_bytes = fs::metadata(staged).await?.len();

        fs::create_dir_all(stage_dir).await?;
        move_file(staged, &stage_dir.join(&file_name)).await?;

        let now = Utc::now();
        let final_dir = self.entry_dir(key);
        let artifact = Artifact {
            key: key.clone(),
            path: final_dir.join(&file_name),
            format: draft.format,
            quality: draft.quality,
            size_bytes,
            checksum,
            duration_secs: draft.duration_secs,
            title: draft.title,
            created_at: now,
        };
        write_sidecar(stage_dir, &Sidecar::new(&artifact, now)).await?;

        if let Some(shard) = final_dir.parent() {
            fs::create_dir_all(shard).await?;
        }
        // Not indexed, so nothing can hold a lease on it.
        if fs::metadata(&final_dir).await.is_ok() {
            warn!(path = %final_dir.display(), "replacing unindexed entry directory");
            fs::remove_dir_all(&final_dir).await?;
        }
        fs::rename(stage_dir, &final_dir).await?;

        Ok(Entry {
            artifact,
            leases: AtomicUsize::new(0),
            last_access: Mutex::new(now),
        })
    }

    /// Drop least recently used, unleased entries until the store fits the
    /// policy.
    pub async fn evict(&self, policy: &EvictionPolicy) -> EvictionReport {
        let mut report = EvictionReport::default();
        let victims = {
            let mut index = self.index.write();
            let mut total: u64 = index.values().map(|e| e.artifact.size_bytes).sum();
            let mut victims = Vec::new();
            if total > policy.max_total_bytes {
                let mut by_age: Vec<(DateTime<Utc>, JobKey)> = index
                    .iter()
                    .map(|(key, entry)| (*entry.last_access.lock(), key.clone()))
                    .collect();
                by_age.sort();

                for (_, key) in by_age {
                    if total <= policy.max_total_bytes {
                        break;
                    }
                    let Some(entry) = index.get(&key) else { continue };
                    if entry.leases.load(Ordering::SeqCst) > 0 {
                        report.skipped_leased += 1;
                        continue;
                    }
                    // Unindexed, so no new lease can be taken on it.
                    if let Some(entry) = index.remove(&key) {
                        total -= entry.artifact.size_bytes;
                        victims.push(entry);
                    }
                }
            }
            victims
        };

        for entry in victims {
            let key = entry.artifact.key.clone();
            match self.bury(&key).await {
                Ok(true) => {
                    report.freed_bytes += entry.artifact.size_bytes;
                    report.removed.push(key);
                }
                Ok(false) => debug!(key = %key, "evicted key was published again, keeping it"),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to evict artifact");
                    self.index.write().entry(key).or_insert(entry);
                }
            }
        }
        report.total_bytes = self.stats().total_bytes;
        report
    }

    /// Move an unindexed entry out of the layout and delete it. Serialised with
    /// `put` on the same key; returns false when a put re-published the key
    /// in the meantime.
    async fn bury(&self, key: &JobKey) -> io::Result<bool> {
        let slot = KeySlot::claim(&self.put_locks, key);
        let guard = slot.lock.lock().await;
        if self.index.read().contains_key(key) {
            return Ok(false);
        }
        let graveyard = self.staging.join(format!("evicted-{}", Uuid::new_v4()));
        match fs::rename(self.entry_dir(key), &graveyard).await {
            Ok(()) => {}
            // A put already replaced the leftover directory and then failed.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        }
        drop(guard);
        drop(slot);

        if let Err(e) = fs::remove_dir_all(&graveyard).await {
            warn!(path = %graveyard.display(), error = %e, "failed to delete evicted artifact");
        }
        Ok(true)
    }

    /// Recompute the checksum of a stored artifact.
    pub async fn verify(&self, artifact: &Artifact) -> Result<bool, StoreError> {
        Ok(sha256_file(&artifact.path).await? == artifact.checksum)
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            entries: index.len(),
            total_bytes: index.values().map(|e| e.artifact.size_bytes).sum(),
            max_total_bytes: self.max_total_bytes,
        }
    }

    fn entry_dir(&self, key: &JobKey) -> PathBuf {
        self.root.join(key.shard()).join(key.as_str())
    }

    async fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        let mut entries = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let name = shard.file_name();
            let name = name.to_string_lossy();
            if name.len() != 2 || !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut keys = fs::read_dir(shard.path()).await?;
            while let Some(dir) = keys.next_entry().await? {
                let path = dir.path();
                match load_entry(&path).await {
                    Some(entry) => entries.push(entry),
                    None => {
                        warn!(path = %path.display(), "discarding invalid store entry");
                        if let Err(e) = fs::remove_dir_all(&path).await {
                            warn!(path = %path.display(), error = %e, "failed to remove invalid entry");
                        }
                    }
                }
            }
        }
        Ok(entries)
    }
}

async fn load_entry(dir: &Path) -> Option<Entry> {
    let key = JobKey::from_hex(dir.file_name()?.to_str()?)?;
    let raw = fs::read(dir.join(SIDECAR)).await.ok()?;
    let sidecar: Sidecar = serde_json::from_slice(&raw).ok()?;
    if sidecar.key != key.as_str() {
        return None;
    }
    let path = dir.join(artifact_file_name(sidecar.format));
    let size = fs::metadata(&path).await.ok()?.len();
    if size != sidecar.size_bytes {
        return None;
    }
    Some(Entry {
        artifact: Artifact {
            key,
            path,
            format: sidecar.format,
            quality: sidecar.quality,
            size_bytes: sidecar.size_bytes,
            checksum: sidecar.checksum,
            duration_secs: sidecar.duration_secs,
            title: sidecar.title,
            created_at: sidecar.created_at,
        },
        leases: AtomicUsize::new(0),
        last_access: Mutex::new(sidecar.last_access),
    })
}

fn artifact_file_name(format: OutputFormat) -> String {
    format!("artifact.{}", format.extension())
}

async fn write_sidecar(dir: &Path, sidecar: &Sidecar) -> Result<(), StoreError> {
    let tmp = dir.join(format!(".{}.{}", SIDECAR, Uuid::new_v4()));
    fs::write(&tmp, serde_json::to_vec_pretty(sidecar)?).await?;
    fs::rename(&tmp, dir.join(SIDECAR)).await?;
    Ok(())
}

/// Rename, falling back to copy when `from` lives on another filesystem.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}

pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
