//! Encrypted on-disk queue storage.
//!
//! Each user's queue is one snapshot file, rewritten atomically on every
//! change. The snapshot is a CBOR envelope (magic, schema version, blake3
//! checksum, payload) sealed with a [`CryptoProvider`] under associated data
//! naming the user and device, so a file copied into another account fails
//! to open.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::crypto::{CryptoError, CryptoProvider};
use crate::outbox::{OpId, Operation, OutboxError, QueueStorage, UserId};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const MAX_SNAPSHOT_ENTRIES: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"CRQU";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many queued operations: {count}, max {max}")]
    TooManyEntries { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for OutboxError {
    fn from(e: StoreError) -> Self {
        OutboxError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    user_id: String,
    device_id: String,
}

impl StoreContext {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    fn to_aad(&self) -> Vec<u8> {
        format!(
            "courier-queue:v{}:{}:{}",
            CURRENT_SCHEMA_VERSION, self.user_id, self.device_id
        )
        .into_bytes()
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StorePayload {
    operations: VecDeque<Operation>,
}

pub fn seal_snapshot<C: CryptoProvider + ?Sized>(
    operations: &VecDeque<Operation>,
    crypto: &C,
    ctx: &StoreContext,
) -> Result<Vec<u8>, StoreError> {
    if operations.len() > MAX_SNAPSHOT_ENTRIES {
        return Err(StoreError::TooManyEntries {
            count: operations.len(),
            max: MAX_SNAPSHOT_ENTRIES,
        });
    }

    let payload = StorePayload {
        operations: operations.clone(),
    };
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);
    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    Ok(crypto.encrypt(&envelope_bytes, &ctx.to_aad())?)
}

pub fn open_snapshot<C: CryptoProvider + ?Sized>(
    sealed: &[u8],
    crypto: &C,
    ctx: &StoreContext,
) -> Result<VecDeque<Operation>, StoreError> {
    if sealed.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: sealed.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope_bytes = crypto.decrypt(sealed, &ctx.to_aad())?;
    let envelope: StoreEnvelope = ciborium::from_reader(&envelope_bytes[..])?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;
    if payload.operations.len() > MAX_SNAPSHOT_ENTRIES {
        return Err(StoreError::TooManyEntries {
            count: payload.operations.len(),
            max: MAX_SNAPSHOT_ENTRIES,
        });
    }
    Ok(payload.operations)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[derive(Default)]
struct Snapshots {
    queues: HashMap<UserId, VecDeque<Operation>>,
    /// Users whose snapshot was quarantined and not yet reported.
    lost: HashMap<UserId, String>,
}

struct SnapshotDir<C> {
    dir: PathBuf,
    device_id: String,
    crypto: C,
    snapshots: Mutex<Snapshots>,
}

impl<C: CryptoProvider> SnapshotDir<C> {
    fn path_for(&self, user: &UserId) -> PathBuf {
        let digest = blake3::hash(user.as_str().as_bytes());
        self.dir
            .join(format!("queue-{}.bin", &hex::encode(digest.as_bytes())[..32]))
    }

    fn context(&self, user: &UserId) -> StoreContext {
        StoreContext::new(user.as_str(), self.device_id.as_str())
    }

    fn snapshots(&self) -> std::sync::MutexGuard<'_, Snapshots> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn load(&self, user: &UserId, snapshots: &mut Snapshots) -> Result<VecDeque<Operation>, StoreError> {
        let path = self.path_for(user);
        if !path.exists() {
            return Ok(VecDeque::new());
        }

        let sealed = std::fs::read(&path)?;
        let opened = if sealed.is_empty() {
            Err(StoreError::Corrupted {
                reason: "empty file",
            })
        } else {
            open_snapshot(&sealed, &self.crypto, &self.context(user))
        };

        match opened {
            Ok(operations) => Ok(operations),
            Err(StoreError::Io(e)) => Err(StoreError::Io(e)),
            Err(e) => {
                // Keep the unreadable file aside rather than overwriting it.
                let quarantine = path.with_extension("corrupt");
                error!(error = %e, path = %quarantine.display(), "queue snapshot unreadable, quarantined");
                std::fs::rename(&path, &quarantine)?;
                snapshots.lost.insert(user.clone(), e.to_string());
                Ok(VecDeque::new())
            }
        }
    }

    /// Runs `f` on the user's queue. When `f` reports a change, the new
    /// snapshot is written before the cached copy is replaced.
    fn with_queue<T>(
        &self,
        user: &UserId,
        f: impl FnOnce(&mut VecDeque<Operation>) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut snapshots = self.snapshots();

        if !snapshots.queues.contains_key(user) {
            let loaded = self.load(user, &mut snapshots)?;
            snapshots.queues.insert(user.clone(), loaded);
        }
        let mut working = snapshots.queues.get(user).cloned().unwrap_or_default();

        let (result, changed) = f(&mut working);
        if changed {
            let sealed = seal_snapshot(&working, &self.crypto, &self.context(user))?;
            write_atomic(&self.path_for(user), &sealed)?;
            debug!(entries = working.len(), "queue snapshot written");
            snapshots.queues.insert(user.clone(), working);
        }
        Ok(result)
    }

    fn load_all(&self, user: &UserId) -> Result<Vec<Result<Operation, OutboxError>>, StoreError> {
        let mut entries: Vec<Result<Operation, OutboxError>> = Vec::new();
        let operations = self.with_queue(user, |queue| (queue.clone(), false))?;
        if let Some(reason) = self.snapshots().lost.remove(user) {
            entries.push(Err(OutboxError::UnreadableQueue { reason }));
        }
        entries.extend(operations.into_iter().map(Ok));
        Ok(entries)
    }

    fn clear(&self, user: &UserId) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots();
        let path = self.path_for(user);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        snapshots.queues.remove(user);
        snapshots.lost.remove(user);
        Ok(())
    }
}

/// Queue storage keeping one encrypted snapshot file per user under `dir`.
///
/// File access runs on tokio's blocking pool.
pub struct FileQueueStorage<C: CryptoProvider> {
    inner: Arc<SnapshotDir<C>>,
}

impl<C: CryptoProvider + 'static> FileQueueStorage<C> {
    pub fn new(
        dir: impl Into<PathBuf>,
        device_id: impl Into<String>,
        crypto: C,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(SnapshotDir {
                dir,
                device_id: device_id.into(),
                crypto,
                snapshots: Mutex::new(Snapshots::default()),
            }),
        })
    }

    /// File names are derived from a hash so that account identifiers never
    /// appear on disk.
    pub fn path_for(&self, user: &UserId) -> PathBuf {
        self.inner.path_for(user)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, OutboxError>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotDir<C>) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| OutboxError::Storage(format!("queue file task failed: {e}")))?
            .map_err(OutboxError::from)
    }
}

#[async_trait::async_trait]
impl<C: CryptoProvider + 'static> QueueStorage for FileQueueStorage<C> {
    async fn append(&self, user: &UserId, op: &Operation) -> Result<(), OutboxError> {
        let (user, op) = (user.clone(), op.clone());
        self.blocking(move |dir| {
            dir.with_queue(&user, |queue| {
                if queue.iter().any(|o| o.id() == op.id()) {
                    return ((), false);
                }
                queue.push_back(op);
                ((), true)
            })
        })
        .await
    }

    async fn peek_oldest(&self, user: &UserId) -> Result<Option<Operation>, OutboxError> {
        let user = user.clone();
        self.blocking(move |dir| dir.with_queue(&user, |queue| (queue.front().cloned(), false)))
            .await
    }

    async fn remove_oldest(&self, user: &UserId, expected: &OpId) -> Result<bool, OutboxError> {
        let (user, expected) = (user.clone(), expected.clone());
        self.blocking(move |dir| {
            dir.with_queue(&user, |queue| {
                if queue.front().is_some_and(|o| o.id() == &expected) {
                    queue.pop_front();
                    (true, true)
                } else {
                    (false, false)
                }
            })
        })
        .await
    }

    async fn remove(&self, user: &UserId, op_id: &str) -> Result<bool, OutboxError> {
        let (user, op_id) = (user.clone(), op_id.to_string());
        self.blocking(move |dir| {
            dir.with_queue(&user, |queue| {
                let before = queue.len();
                queue.retain(|o| o.id().as_str() != op_id);
                let removed = queue.len() != before;
                (removed, removed)
            })
        })
        .await
    }

    async fn record_attempt(
        &self,
        user: &UserId,
        op_id: &OpId,
        retry_count: u32,
    ) -> Result<(), OutboxError> {
        let (user, op_id) = (user.clone(), op_id.clone());
        self.blocking(move |dir| {
            dir.with_queue(&user, |queue| {
                let Some(index) = queue.iter().position(|o| o.id() == &op_id) else {
                    return ((), false);
                };
                if let Some(op) = queue.remove(index) {
                    queue.insert(index, op.with_retry_count(retry_count));
                }
                ((), true)
            })
        })
        .await
    }

    async fn load_all(
        &self,
        user: &UserId,
    ) -> Result<Vec<Result<Operation, OutboxError>>, OutboxError> {
        let user = user.clone();
        self.blocking(move |dir| dir.load_all(&user)).await
    }

    async fn clear(&self, user: &UserId) -> Result<(), OutboxError> {
        let user = user.clone();
        self.blocking(move |dir| dir.clear(&user)).await
    }
}
