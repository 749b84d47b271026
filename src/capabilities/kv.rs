//! Key-value capability: keychain/keystore for credentials, plain
//! preferences for settings.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Where a value lives on the device. The host maps [`KeyNamespace::Session`]
/// to secure storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Session,
    Settings,
}

impl KeyNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Settings => "settings",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    name: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, name: impl Into<String>) -> Result<Self, KvError> {
        let name = name.into();
        let invalid = |reason: &str| KvError::InvalidKey {
            key: name.chars().take(64).collect(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("empty"));
        }
        if name.len() > MAX_KEY_LENGTH {
            return Err(invalid("too long"));
        }
        if name.contains("..") || name.starts_with(['/', '\\']) {
            return Err(invalid("looks like a path"));
        }
        if name.chars().any(char::is_control) {
            return Err(invalid("control characters"));
        }
        Ok(Self { namespace, name })
    }

    /// `namespace:name`, the string hosts store the value under.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.name)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }
}

/// Host key-value capability (keychain, shared preferences, ...).
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    async fn delete(&self, key: &KvKey) -> Result<(), KvError>;
}

pub async fn get_json<K, T>(store: &K, key: &KvKey) -> Result<Option<T>, KvError>
where
    K: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: Some(key.raw()),
            }),
        None => Ok(None),
    }
}

pub async fn set_json<K, T>(store: &K, key: &KvKey, value: &T) -> Result<(), KvError>
where
    K: KeyValueStore + ?Sized,
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: Some(key.raw()),
    })?;
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: bytes.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    store.set(key, bytes).await
}

/// Process-local store, used in tests and as a fallback when the host
/// provides no persistent one.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.lock().get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.lock().insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        self.lock().remove(&key.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(KvKey::new(KeyNamespace::Session, "").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "   ").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "a\0b").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "../secrets").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "/abs").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(KvKey::new(KeyNamespace::Session, "credentials").is_ok());
    }

    #[test]
    fn test_raw_key_and_security() {
        let key = KvKey::new(KeyNamespace::Settings, "preferences").unwrap();
        assert_eq!(key.raw(), "settings:preferences");
        assert!(!key.namespace().is_secure());
        assert!(KeyNamespace::Session.is_secure());
    }

    #[tokio::test]
    async fn test_json_roundtrip_through_memory_store() {
        let store = MemoryKeyValueStore::new();
        let key = KvKey::new(KeyNamespace::Session, "user").unwrap();

        assert_eq!(get_json::<_, String>(&store, &key).await.unwrap(), None);

        set_json(&store, &key, &"alice".to_string()).await.unwrap();
        assert_eq!(
            get_json::<_, String>(&store, &key).await.unwrap().as_deref(),
            Some("alice")
        );

        store.delete(&key).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_value_reports_key() {
        let store = MemoryKeyValueStore::new();
        let key = KvKey::new(KeyNamespace::Session, "user").unwrap();
        store.set(&key, b"not json".to_vec()).await.unwrap();

        let result = get_json::<_, String>(&store, &key).await;
        assert!(matches!(
            result,
            Err(KvError::Serialization { key: Some(ref k), .. }) if k == "session:user"
        ));
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::Storage {
            message: "busy".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!KvError::ValueTooLarge { size: 2, max: 1 }.is_retryable());
    }
}
