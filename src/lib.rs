// lib.rs - Outbound request core for the assistant client

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod app;
pub mod capabilities;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dispatcher;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod refresh;
pub mod settings;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use app::App;
pub use capabilities::{
    ConnectivityMonitor, HttpMethod, HttpRequest, HttpResponse, KeyValueStore, Transport,
    TransportFailure,
};
pub use config::CoreConfig;
pub use credentials::{CredentialPair, CredentialStore, KvCredentialStore, MemoryCredentialStore};
pub use dispatcher::{DispatchFailure, Dispatcher};
pub use event::{CoreEvent, FailureReason};
pub use model::SyncStatus;
pub use outbox::{OpId, Operation, Outbox, OutboxError, QueueStorage, RequestClass, UserId};
pub use refresh::{AuthFailure, RefreshCoordinator, SessionLock, SessionTicket};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MEDIA_TIMEOUT: Duration = Duration::from_secs(120);
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const MAX_OUTBOX_ENTRIES: usize = 500;
pub const DELIVERED_CACHE_SIZE: usize = 1_000;
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const MAX_SERVER_MESSAGE_BYTES: usize = 512;
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// How the shell should react to an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Worth retrying as-is, possibly once connectivity returns.
    Transient,
    /// Retrying the same request will fail the same way.
    Permanent,
    /// The core cannot continue without the user restarting or signing in.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Offline,
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    QuotaExceeded,
    Server,
    Storage,
    InvalidState,
    Unknown,
}

impl ErrorKind {
    /// Stable identifier for the shell; never changes once shipped.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Server => "SERVER_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Offline
            | Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Server
            | Self::Storage => ErrorSeverity::Transient,
            Self::Authentication | Self::InvalidState => ErrorSeverity::Fatal,
            Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::QuotaExceeded
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            402 => Self::QuotaExceeded,
            403 => Self::Authorization,
            404 | 410 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

/// Error value handed across the FFI boundary to the shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    /// Diagnostic detail for logs; never shown to the user.
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.severity, ErrorSeverity::Transient)
    }

    /// Text for the chat screen. Server-provided messages for rejected
    /// requests are passed through unchanged.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        let canned = match self.kind {
            ErrorKind::Validation | ErrorKind::Server | ErrorKind::QuotaExceeded => {
                return self.message.clone();
            }
            ErrorKind::Offline => "You're offline. Messages will be sent when you reconnect.",
            ErrorKind::Network => "Couldn't reach the assistant. Check your connection.",
            ErrorKind::Timeout => "The assistant took too long to respond. Try again.",
            ErrorKind::Authentication => "You've been signed out. Sign in to continue.",
            ErrorKind::Authorization => "Your account can't do that.",
            ErrorKind::NotFound => "That conversation no longer exists.",
            ErrorKind::Conflict => "Something changed on another device. Pull to refresh.",
            ErrorKind::RateLimited => "Slow down a little and try again in a moment.",
            ErrorKind::Storage => "Couldn't save to this device. Free up some space.",
            ErrorKind::InvalidState => "Something went wrong. Restart the app.",
            ErrorKind::Unknown => "Something went wrong. Try again.",
        };
        canned.to_string()
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        Self::new(
            ErrorKind::from_status(status),
            server_message(status, body.unwrap_or_default()),
        )
        .with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())?;
        f.write_str(": ")?;
        f.write_str(&self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Extracts the human-readable message from an error response body.
///
/// JSON bodies with `message`, `detail` or `error` win; otherwise a non-empty
/// UTF-8 body is used as-is. Output is capped at [`MAX_SERVER_MESSAGE_BYTES`].
#[must_use]
pub fn server_message(status: u16, body: &[u8]) -> String {
    let mut message = serde_json::from_slice::<ApiErrorResponse>(body)
        .ok()
        .and_then(|e| e.message.or(e.detail).or(e.error))
        .or_else(|| {
            std::str::from_utf8(body)
                .ok()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP error: {status}"));

    truncate_utf8_safe(&mut message, MAX_SERVER_MESSAGE_BYTES);
    message
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

pub type AppResult<T> = Result<T, AppError>;

impl From<OutboxError> for AppError {
    fn from(e: OutboxError) -> Self {
        match &e {
            OutboxError::Full(_) => {
                AppError::new(ErrorKind::QuotaExceeded, "Too many pending operations")
                    .with_internal(e.to_string())
            }
            OutboxError::InvalidId(_) | OutboxError::Validation(_) => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            OutboxError::NoActiveSession => {
                AppError::new(ErrorKind::InvalidState, "No signed-in user")
            }
            OutboxError::Storage(_)
            | OutboxError::CorruptedEntry { .. }
            | OutboxError::UnreadableQueue { .. } => {
                AppError::new(ErrorKind::Storage, "Unable to access pending operations")
                    .with_internal(e.to_string())
            }
        }
    }
}

impl From<DispatchFailure> for AppError {
    fn from(failure: DispatchFailure) -> Self {
        match failure {
            DispatchFailure::QueuedForLater { op_id } => {
                AppError::new(ErrorKind::Offline, "Queued for delivery")
                    .with_severity(ErrorSeverity::Transient)
                    .with_context("op_id", op_id.as_str())
            }
            DispatchFailure::Offline => AppError::new(ErrorKind::Offline, "Device is offline"),
            DispatchFailure::SessionExpired => {
                AppError::new(ErrorKind::Authentication, "Session expired")
            }
            DispatchFailure::NetworkError { reason } => {
                AppError::new(ErrorKind::Network, "Network request failed").with_internal(reason)
            }
            DispatchFailure::ServerError { status, message } => {
                let mut error = AppError::from_http_status(status, None);
                error.message = message;
                error
            }
            DispatchFailure::QueueRejected { reason } => {
                AppError::new(ErrorKind::Storage, "Unable to queue request").with_internal(reason)
            }
        }
    }
}

impl From<credentials::CredentialError> for AppError {
    fn from(e: credentials::CredentialError) -> Self {
        AppError::new(ErrorKind::Storage, "Unable to access saved credentials")
            .with_internal(e.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::new(ErrorKind::InvalidState, "Invalid configuration").with_internal(e.to_string())
    }
}

impl From<settings::SettingsError> for AppError {
    fn from(e: settings::SettingsError) -> Self {
        AppError::new(ErrorKind::Storage, "Unable to load settings").with_internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_new() {
        let error = AppError::new(ErrorKind::Network, "Test error");

        assert_eq!(error.kind, ErrorKind::Network);
        assert_eq!(error.severity, ErrorSeverity::Transient);
        assert_eq!(error.message, "Test error");
        assert!(error.internal_message.is_none());
        assert!(error.is_retryable());
    }

    #[test]
    fn test_fatal_severity_is_not_retryable() {
        let error = AppError::new(ErrorKind::Network, "x").with_severity(ErrorSeverity::Fatal);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_from_http_status_uses_server_message() {
        let body = br#"{"message":"Prompt too long"}"#;
        let error = AppError::from_http_status(422, Some(body));

        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.message, "Prompt too long");
        assert_eq!(error.user_facing_message(), "Prompt too long");
        assert_eq!(error.context.get("http_status").map(String::as_str), Some("422"));
    }

    #[test]
    fn test_server_message_fallbacks() {
        assert_eq!(server_message(500, br#"{"detail":"boom"}"#), "boom");
        assert_eq!(server_message(502, b"  bad gateway \n"), "bad gateway");
        assert_eq!(server_message(503, b""), "HTTP error: 503");
    }

    #[test]
    fn test_server_message_truncated_on_char_boundary() {
        let body = "é".repeat(MAX_SERVER_MESSAGE_BYTES);
        let message = server_message(400, body.as_bytes());
        assert!(message.len() <= MAX_SERVER_MESSAGE_BYTES);
        assert!(message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_queued_for_later_maps_to_transient() {
        let error: AppError = DispatchFailure::QueuedForLater {
            op_id: OpId::new("op-1").unwrap(),
        }
        .into();
        assert_eq!(error.kind, ErrorKind::Offline);
        assert_eq!(error.severity, ErrorSeverity::Transient);
    }

    #[test]
    fn test_server_error_keeps_message() {
        let error: AppError = DispatchFailure::ServerError {
            status: 403,
            message: "Quota reached for today".into(),
        }
        .into();
        assert_eq!(error.kind, ErrorKind::Authorization);
        assert_eq!(error.message, "Quota reached for today");
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorKind::Authentication.code(), "AUTH_ERROR");
        assert_eq!(ErrorKind::Offline.code(), "OFFLINE");
    }
}
