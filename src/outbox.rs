use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{
    ApiPath, ContentType, HttpError, HttpMethod, HttpRequest, CONTENT_TYPE_HEADER,
    MAX_REQUEST_BODY_SIZE,
};
use crate::event::{CoreEvent, EventBus, FailureReason};

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OutboxError> {
        if id.is_empty() {
            return Err(OutboxError::InvalidId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::InvalidId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OutboxError::InvalidId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated account the queue is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(OutboxError::InvalidId("UserId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::InvalidId(format!(
                "UserId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(OutboxError::InvalidId(
                "UserId contains control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

/// Selects the transport timeout for an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Chat text, metadata, settings.
    #[default]
    Standard,
    /// Uploads and analysis of images, audio, documents.
    Media,
}

/// One outbound request, as handed to the dispatcher and, when deferred,
/// persisted in the outbox.
///
/// The payload is fixed at construction. The outbox only ever changes the
/// retry counter.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    id: OpId,
    method: HttpMethod,
    path: ApiPath,
    #[serde(default, with = "serde_bytes")]
    body: Option<Vec<u8>>,
    #[serde(default)]
    content_type: Option<ContentType>,
    #[serde(default)]
    queueable: bool,
    #[serde(default)]
    class: RequestClass,
    created_at: UnixTimeMs,
    #[serde(default)]
    retry_count: u32,
}

impl Operation {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Result<Self, OutboxError> {
        let path = ApiPath::new(path).map_err(|e| OutboxError::Validation(e.to_string()))?;
        Ok(Self {
            id: OpId::generate(),
            method,
            path,
            body: None,
            content_type: None,
            queueable: false,
            class: RequestClass::Standard,
            created_at: UnixTimeMs::now(),
            retry_count: 0,
        })
    }

    pub fn get(path: impl Into<String>) -> Result<Self, OutboxError> {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Result<Self, OutboxError> {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Result<Self, OutboxError> {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Result<Self, OutboxError> {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Result<Self, OutboxError> {
        Self::new(HttpMethod::Delete, path)
    }

    /// Replaces the generated id, e.g. with one the caller already shows in
    /// the UI as the message's local id.
    #[must_use]
    pub fn with_id(mut self, id: OpId) -> Self {
        self.id = id;
        self
    }

    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, OutboxError> {
        let body = serde_json::to_vec(value).map_err(|e| OutboxError::Validation(e.to_string()))?;
        self.with_body(body, ContentType::Json)
    }

    pub fn with_body(
        mut self,
        body: Vec<u8>,
        content_type: ContentType,
    ) -> Result<Self, OutboxError> {
        if !self.method.has_request_body() {
            return Err(OutboxError::Validation(format!(
                "{} requests cannot carry a body",
                self.method
            )));
        }
        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(OutboxError::Validation(format!(
                "body of {} bytes exceeds maximum of {MAX_REQUEST_BODY_SIZE} bytes",
                body.len()
            )));
        }
        self.body = Some(body);
        self.content_type = Some(content_type);
        Ok(self)
    }

    /// Allows the dispatcher to park this operation while offline and replay
    /// it later. Only POST, PUT and PATCH qualify.
    pub fn queueable(mut self) -> Result<Self, OutboxError> {
        if !self.method.is_deferrable_write() {
            return Err(OutboxError::Validation(format!(
                "{} requests cannot be queued",
                self.method
            )));
        }
        self.queueable = true;
        Ok(self)
    }

    #[must_use]
    pub fn media(mut self) -> Self {
        self.class = RequestClass::Media;
        self
    }

    pub fn id(&self) -> &OpId {
        &self.id
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &ApiPath {
        &self.path
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    pub fn is_queueable(&self) -> bool {
        self.queueable
    }

    pub fn class(&self) -> RequestClass {
        self.class
    }

    pub fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Builds the transport request without credentials.
    pub fn to_request(&self, timeout: Duration) -> Result<HttpRequest, HttpError> {
        let mut request = HttpRequest::new(self.method, self.path.clone(), timeout);
        if let Some(content_type) = &self.content_type {
            request.headers.insert(CONTENT_TYPE_HEADER, content_type.as_str())?;
        }
        request.body.clone_from(&self.body);
        Ok(request)
    }
}

// Bodies carry user-authored chat content.
impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("queueable", &self.queueable)
            .field("class", &self.class)
            .field("created_at", &self.created_at)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no active session")]
    NoActiveSession,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted entry: {op_id}, reason: {reason}")]
    CorruptedEntry { op_id: String, reason: String },

    /// The stored queue could not be read at all; its entries are gone.
    #[error("unreadable queue: {reason}")]
    UnreadableQueue { reason: String },
}

// ============================================================================
// Persistence
// ============================================================================

/// Durable FIFO of operations, partitioned per user.
///
/// Implementations must return operations in append order and must never
/// hand one user's operations to another.
#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    async fn append(&self, user: &UserId, op: &Operation) -> Result<(), OutboxError>;

    async fn peek_oldest(&self, user: &UserId) -> Result<Option<Operation>, OutboxError>;

    /// Removes the head of the queue if its id is `expected`. Returns whether
    /// anything was removed.
    async fn remove_oldest(&self, user: &UserId, expected: &OpId) -> Result<bool, OutboxError>;

    /// Removes an entry anywhere in the queue. Takes the raw id so that
    /// undecodable rows can be dropped too.
    async fn remove(&self, user: &UserId, op_id: &str) -> Result<bool, OutboxError>;

    async fn record_attempt(
        &self,
        user: &UserId,
        op_id: &OpId,
        retry_count: u32,
    ) -> Result<(), OutboxError>;

    async fn load_all(
        &self,
        user: &UserId,
    ) -> Result<Vec<Result<Operation, OutboxError>>, OutboxError>;

    async fn clear(&self, user: &UserId) -> Result<(), OutboxError>;
}

/// Process-local queue storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    queues: Mutex<HashMap<UserId, VecDeque<Operation>>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, VecDeque<Operation>>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn append(&self, user: &UserId, op: &Operation) -> Result<(), OutboxError> {
        let mut queues = self.lock();
        let queue = queues.entry(user.clone()).or_default();
        if !queue.iter().any(|o| o.id == op.id) {
            queue.push_back(op.clone());
        }
        Ok(())
    }

    async fn peek_oldest(&self, user: &UserId) -> Result<Option<Operation>, OutboxError> {
        Ok(self.lock().get(user).and_then(|q| q.front().cloned()))
    }

    async fn remove_oldest(&self, user: &UserId, expected: &OpId) -> Result<bool, OutboxError> {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(user) else {
            return Ok(false);
        };
        if queue.front().is_some_and(|o| &o.id == expected) {
            queue.pop_front();
            return Ok(true);
        }
        Ok(false)
    }

    async fn remove(&self, user: &UserId, op_id: &str) -> Result<bool, OutboxError> {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(user) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|o| o.id.as_str() != op_id);
        Ok(queue.len() != before)
    }

    async fn record_attempt(
        &self,
        user: &UserId,
        op_id: &OpId,
        retry_count: u32,
    ) -> Result<(), OutboxError> {
        let mut queues = self.lock();
        if let Some(op) = queues
            .get_mut(user)
            .and_then(|q| q.iter_mut().find(|o| &o.id == op_id))
        {
            op.retry_count = retry_count;
        }
        Ok(())
    }

    async fn load_all(
        &self,
        user: &UserId,
    ) -> Result<Vec<Result<Operation, OutboxError>>, OutboxError> {
        Ok(self
            .lock()
            .get(user)
            .map(|q| q.iter().cloned().map(Ok).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, user: &UserId) -> Result<(), OutboxError> {
        self.lock().remove(user);
        Ok(())
    }
}

/// SQLite-backed queue storage.
///
/// One row per operation. The serialized operation in `data` is written once;
/// retries only touch the `retry_count` column.
#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteQueueStorage {
    conn: Mutex<rusqlite::Connection>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteQueueStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, OutboxError> {
        let conn = rusqlite::Connection::open(path).map_err(sqlite_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, OutboxError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, OutboxError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS outbox_operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                op_id TEXT NOT NULL,
                data BLOB NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, op_id)
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_user_seq ON outbox_operations(user_id, seq);
            ",
        )
        .map_err(sqlite_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn decode(op_id: String, data: &[u8], retry_count: u32) -> Result<Operation, OutboxError> {
        serde_json::from_slice::<Operation>(data)
            .map(|op| op.with_retry_count(retry_count))
            .map_err(|e| OutboxError::CorruptedEntry {
                op_id,
                reason: e.to_string(),
            })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn sqlite_error(e: rusqlite::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait::async_trait]
impl QueueStorage for SqliteQueueStorage {
    async fn append(&self, user: &UserId, op: &Operation) -> Result<(), OutboxError> {
        let data = serde_json::to_vec(op).map_err(|e| OutboxError::Storage(e.to_string()))?;
        let created_at = i64::try_from(op.created_at.0).unwrap_or(i64::MAX);

        self.conn()
            .execute(
                r"
                INSERT OR IGNORE INTO outbox_operations (user_id, op_id, data, retry_count, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                rusqlite::params![
                    user.as_str(),
                    op.id.as_str(),
                    data,
                    op.retry_count,
                    created_at
                ],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    async fn peek_oldest(&self, user: &UserId) -> Result<Option<Operation>, OutboxError> {
        use rusqlite::OptionalExtension;

        let row: Option<(String, Vec<u8>, u32)> = self
            .conn()
            .query_row(
                r"
                SELECT op_id, data, retry_count FROM outbox_operations
                WHERE user_id = ?1 ORDER BY seq ASC LIMIT 1
                ",
                [user.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sqlite_error)?;

        row.map(|(op_id, data, retry_count)| Self::decode(op_id, &data, retry_count))
            .transpose()
    }

    async fn remove_oldest(&self, user: &UserId, expected: &OpId) -> Result<bool, OutboxError> {
        let removed = self
            .conn()
            .execute(
                r"
                DELETE FROM outbox_operations
                WHERE seq = (SELECT MIN(seq) FROM outbox_operations WHERE user_id = ?1)
                  AND op_id = ?2
                ",
                [user.as_str(), expected.as_str()],
            )
            .map_err(sqlite_error)?;
        Ok(removed > 0)
    }

    async fn remove(&self, user: &UserId, op_id: &str) -> Result<bool, OutboxError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM outbox_operations WHERE user_id = ?1 AND op_id = ?2",
                [user.as_str(), op_id],
            )
            .map_err(sqlite_error)?;
        Ok(removed > 0)
    }

    async fn record_attempt(
        &self,
        user: &UserId,
        op_id: &OpId,
        retry_count: u32,
    ) -> Result<(), OutboxError> {
        self.conn()
            .execute(
                "UPDATE outbox_operations SET retry_count = ?1 WHERE user_id = ?2 AND op_id = ?3",
                rusqlite::params![retry_count, user.as_str(), op_id.as_str()],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }

    async fn load_all(
        &self,
        user: &UserId,
    ) -> Result<Vec<Result<Operation, OutboxError>>, OutboxError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r"
                SELECT op_id, data, retry_count FROM outbox_operations
                WHERE user_id = ?1 ORDER BY seq ASC
                ",
            )
            .map_err(sqlite_error)?;

        let rows = stmt
            .query_map([user.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, u32>(2)?,
                ))
            })
            .map_err(sqlite_error)?;

        let mut loaded = Vec::new();
        for row in rows {
            let (op_id, data, retry_count) = row.map_err(sqlite_error)?;
            loaded.push(Self::decode(op_id, &data, retry_count));
        }
        Ok(loaded)
    }

    async fn clear(&self, user: &UserId) -> Result<(), OutboxError> {
        self.conn()
            .execute(
                "DELETE FROM outbox_operations WHERE user_id = ?1",
                [user.as_str()],
            )
            .map_err(sqlite_error)?;
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub max_entries: usize,
    /// Attempts after which a queued operation is evicted.
    pub max_retries: u32,
    pub delivered_cache_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::MAX_OUTBOX_ENTRIES,
            max_retries: crate::MAX_RETRY_ATTEMPTS,
            delivered_cache_size: crate::DELIVERED_CACHE_SIZE,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_entries == 0 {
            return Err(OutboxError::Validation("max_entries must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(OutboxError::Validation("max_retries must be > 0".into()));
        }
        if self.delivered_cache_size == 0 {
            return Err(OutboxError::Validation(
                "delivered_cache_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl From<&crate::CoreConfig> for OutboxConfig {
    fn from(config: &crate::CoreConfig) -> Self {
        Self {
            max_entries: config.max_queue_entries,
            max_retries: config.max_retries,
            delivered_cache_size: config.delivered_cache_size,
        }
    }
}

// ============================================================================
// Drain vocabulary
// ============================================================================

/// Result of one delivery attempt during a drain, as classified by the
/// caller's send function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Worth another attempt later: network failure, timeout, 408/429/5xx.
    Retryable { reason: String },
    /// The server refused the operation; it will never succeed.
    Rejected { status: u16, message: String },
    /// Credentials are gone. The drain stops and leaves the queue to the
    /// session teardown.
    SessionExpired,
    /// The session was replaced while the operation was in flight. Nothing
    /// is recorded against the operation.
    SessionChanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainStop {
    #[default]
    Empty,
    Offline,
    Retryable,
    SessionExpired,
    /// The session was closed or switched mid-drain.
    SessionChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub stopped: DrainStop,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain pass holds the guard; nothing was done.
    AlreadyRunning,
    Finished(DrainReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { pending: usize },
    AlreadyQueued,
    AlreadyDelivered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub evicted: usize,
    pub corrupted: usize,
    /// The whole stored queue was unreadable and has been set aside.
    pub unreadable: bool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Outbox
// ============================================================================

struct OutboxState {
    user: Option<UserId>,
    queued: HashSet<OpId>,
    delivered: lru::LruCache<OpId, UnixTimeMs>,
}

impl OutboxState {
    fn new(delivered_cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(delivered_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            user: None,
            queued: HashSet::new(),
            delivered: lru::LruCache::new(cache_size),
        }
    }

    fn is_scoped_to(&self, user: &UserId) -> bool {
        self.user.as_ref() == Some(user)
    }
}

/// Persisted FIFO of deferred operations for the signed-in user.
///
/// Storage is the source of truth for order and retry counts; the in-memory
/// state indexes what is queued and what was recently delivered so that a
/// replayed enqueue is a no-op.
pub struct Outbox<S: QueueStorage + ?Sized = dyn QueueStorage> {
    storage: Arc<S>,
    config: OutboxConfig,
    state: RwLock<OutboxState>,
    draining: AtomicBool,
    events: EventBus,
}

impl<S: QueueStorage + ?Sized> Outbox<S> {
    pub fn new(storage: Arc<S>, config: OutboxConfig, events: EventBus) -> Result<Self, OutboxError> {
        config.validate()?;
        Ok(Self {
            storage,
            state: RwLock::new(OutboxState::new(config.delivered_cache_size)),
            config,
            draining: AtomicBool::new(false),
            events,
        })
    }

    /// Scopes the outbox to `user` and recovers their persisted operations.
    ///
    /// Operations whose persisted retry count already reached the limit are
    /// evicted (with their event) before anything is sent.
    #[instrument(skip(self, user), fields(user = %user))]
    pub async fn open_session(&self, user: UserId) -> Result<RecoveryReport, OutboxError> {
        let mut state = self.state.write().await;
        if state.user.as_ref().is_some_and(|current| current != &user) {
            warn!("opening a session while another is still open");
        }

        let loaded = self.storage.load_all(&user).await?;
        let mut report = RecoveryReport::default();
        let mut queued = HashSet::new();

        for result in loaded {
            match result {
                Ok(op) if op.retry_count >= self.config.max_retries => {
                    self.storage.remove(&user, op.id.as_str()).await?;
                    warn!(op_id = %op.id, attempts = op.retry_count, "evicting exhausted operation on recovery");
                    self.events.emit(CoreEvent::PermanentlyFailed {
                        op_id: op.id,
                        reason: FailureReason::MaxRetriesExceeded {
                            attempts: op.retry_count,
                        },
                    });
                    report.evicted += 1;
                }
                Ok(op) => {
                    queued.insert(op.id);
                    report.recovered += 1;
                }
                Err(OutboxError::CorruptedEntry { op_id, reason }) => {
                    error!(op_id = %op_id, reason = %reason, "dropping undecodable queued operation");
                    self.storage.remove(&user, &op_id).await?;
                    report.corrupted += 1;
                    let event = match OpId::new(op_id.as_str()) {
                        Ok(op_id) => CoreEvent::PermanentlyFailed {
                            op_id,
                            reason: FailureReason::Corrupted { detail: reason },
                        },
                        Err(_) => CoreEvent::QueueCorrupted {
                            reason: format!("entry {op_id:?}: {reason}"),
                        },
                    };
                    self.events.emit(event);
                }
                Err(OutboxError::UnreadableQueue { reason }) => {
                    error!(reason = %reason, "stored queue unreadable, pending operations lost");
                    report.unreadable = true;
                    self.events.emit(CoreEvent::QueueCorrupted { reason });
                }
                Err(e) => return Err(e),
            }
        }

        state.user = Some(user);
        state.queued = queued;
        state.delivered.clear();

        info!(
            recovered = report.recovered,
            evicted = report.evicted,
            corrupted = report.corrupted,
            "outbox session opened"
        );
        Ok(report)
    }

    /// Discards every pending operation of the current session and unscopes
    /// the outbox. Each discarded operation is reported as permanently
    /// failed. Returns the number discarded, or `None` if no session was
    /// open.
    #[instrument(skip(self))]
    pub async fn close_session(&self) -> Result<Option<usize>, OutboxError> {
        let mut state = self.state.write().await;
        let Some(user) = state.user.take() else {
            return Ok(None);
        };

        let pending = self.storage.load_all(&user).await?;
        self.storage.clear(&user).await?;
        state.queued.clear();
        state.delivered.clear();
        drop(state);

        let mut discarded = 0;
        for op in pending.into_iter().flatten() {
            self.events.emit(CoreEvent::PermanentlyFailed {
                op_id: op.id,
                reason: FailureReason::SessionEnded,
            });
            discarded += 1;
        }

        info!(user = %user, discarded, "outbox session closed");
        Ok(Some(discarded))
    }

    /// Appends a queueable operation. Never touches the network.
    #[instrument(skip(self, op), fields(op_id = %op.id))]
    pub async fn enqueue(&self, op: Operation) -> Result<EnqueueOutcome, OutboxError> {
        if !op.queueable {
            return Err(OutboxError::Validation(format!(
                "operation {} is not queueable",
                op.id
            )));
        }

        let mut state = self.state.write().await;
        let user = state.user.clone().ok_or(OutboxError::NoActiveSession)?;

        if state.queued.contains(&op.id) {
            debug!("operation already queued");
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        if state.delivered.contains(&op.id) {
            debug!("operation already delivered");
            return Ok(EnqueueOutcome::AlreadyDelivered);
        }
        if state.queued.len() >= self.config.max_entries {
            return Err(OutboxError::Full(self.config.max_entries));
        }

        if let Err(e) = self.storage.append(&user, &op).await {
            error!(error = %e, "failed to persist operation");
            return Err(e);
        }

        state.queued.insert(op.id.clone());
        let pending = state.queued.len();
        drop(state);

        info!(pending, "operation queued");
        self.events.emit(CoreEvent::Queued {
            op_id: op.id,
            pending,
        });
        Ok(EnqueueOutcome::Queued { pending })
    }

    /// Replays queued operations oldest first, one at a time.
    ///
    /// Returns [`DrainOutcome::AlreadyRunning`] immediately if another pass is
    /// active. `is_online` is consulted before every send.
    #[instrument(skip_all)]
    pub async fn drain<C, F, Fut>(
        &self,
        is_online: C,
        mut send: F,
    ) -> Result<DrainOutcome, OutboxError>
    where
        C: Fn() -> bool,
        F: FnMut(Operation) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("drain already running");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let user = self
            .state
            .read()
            .await
            .user
            .clone()
            .ok_or(OutboxError::NoActiveSession)?;

        let mut report = DrainReport::default();
        loop {
            if !self.state.read().await.is_scoped_to(&user) {
                report.stopped = DrainStop::SessionChanged;
                break;
            }
            if !is_online() {
                report.stopped = DrainStop::Offline;
                break;
            }
            let Some(op) = self.storage.peek_oldest(&user).await? else {
                report.stopped = DrainStop::Empty;
                break;
            };

            if op.retry_count >= self.config.max_retries {
                let attempts = op.retry_count;
                self.evict(&user, op.id, FailureReason::MaxRetriesExceeded { attempts })
                    .await?;
                report.failed += 1;
                continue;
            }

            let op_id = op.id.clone();
            let retry_count = op.retry_count;
            match send(op).await {
                Delivery::Delivered => {
                    self.complete(&user, &op_id).await?;
                    report.delivered += 1;
                }
                Delivery::Retryable { reason } => {
                    let attempts = retry_count + 1;
                    if attempts >= self.config.max_retries {
                        self.evict(&user, op_id, FailureReason::MaxRetriesExceeded { attempts })
                            .await?;
                        report.failed += 1;
                        continue;
                    }
                    self.storage.record_attempt(&user, &op_id, attempts).await?;
                    warn!(op_id = %op_id, attempts, reason = %reason, "delivery failed, will retry");
                    report.stopped = DrainStop::Retryable;
                    break;
                }
                Delivery::Rejected { status, message } => {
                    self.evict(&user, op_id, FailureReason::Rejected { status, message })
                        .await?;
                    report.failed += 1;
                }
                Delivery::SessionExpired => {
                    report.stopped = DrainStop::SessionExpired;
                    break;
                }
                Delivery::SessionChanged => {
                    report.stopped = DrainStop::SessionChanged;
                    break;
                }
            }
        }

        if report.stopped == DrainStop::Empty && report.processed() > 0 {
            info!(delivered = report.delivered, failed = report.failed, "outbox drained");
            self.events.emit(CoreEvent::QueueDrained {
                delivered: report.delivered,
            });
        }

        Ok(DrainOutcome::Finished(report))
    }

    async fn complete(&self, user: &UserId, op_id: &OpId) -> Result<(), OutboxError> {
        let mut state = self.state.write().await;
        if !state.is_scoped_to(user) {
            return Ok(());
        }
        self.storage.remove_oldest(user, op_id).await?;
        state.queued.remove(op_id);
        state.delivered.put(op_id.clone(), UnixTimeMs::now());
        let pending = state.queued.len();
        drop(state);

        info!(op_id = %op_id, pending, "queued operation delivered");
        self.events.emit(CoreEvent::Delivered {
            op_id: op_id.clone(),
            pending,
        });
        Ok(())
    }

    async fn evict(
        &self,
        user: &UserId,
        op_id: OpId,
        reason: FailureReason,
    ) -> Result<(), OutboxError> {
        let mut state = self.state.write().await;
        if !state.is_scoped_to(user) {
            return Ok(());
        }
        self.storage.remove(user, op_id.as_str()).await?;
        state.queued.remove(&op_id);
        drop(state);

        warn!(op_id = %op_id, reason = %reason, "queued operation permanently failed");
        self.events
            .emit(CoreEvent::PermanentlyFailed { op_id, reason });
        Ok(())
    }

    pub async fn pending(&self) -> usize {
        self.state.read().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending().await == 0
    }

    pub async fn is_queued(&self, op_id: &OpId) -> bool {
        self.state.read().await.queued.contains(op_id)
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.state.read().await.user.clone()
    }

    /// Snapshot of the queue in delivery order.
    pub async fn pending_operations(&self) -> Result<Vec<Operation>, OutboxError> {
        let Some(user) = self.current_user().await else {
            return Ok(Vec::new());
        };
        Ok(self
            .storage
            .load_all(&user)
            .await?
            .into_iter()
            .filter_map(Result::ok)
            .collect())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}
