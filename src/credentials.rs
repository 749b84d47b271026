use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use zeroize::Zeroize;

use crate::capabilities::{get_json, set_json, KeyNamespace, KeyValueStore, KvError, KvKey};

const MAX_TOKEN_LENGTH: usize = 8192;
const CREDENTIALS_KEY: &str = "credentials";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid token: {0}")]
    InvalidToken(&'static str),

    #[error("credential storage error: {0}")]
    Storage(#[from] KvError),
}

/// Opaque bearer or refresh token. Redacted in `Debug`, wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Result<Self, CredentialError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CredentialError::InvalidToken("token cannot be empty"));
        }
        if value.len() > MAX_TOKEN_LENGTH {
            return Err(CredentialError::InvalidToken("token too long"));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CredentialError::InvalidToken(
                "token contains whitespace or control characters",
            ));
        }
        Ok(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// The signed-in user's tokens. Always read and replaced as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: Token,
    pub refresh_token: Option<Token>,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            access_token: Token::new(access_token)?,
            refresh_token: refresh_token.map(Token::new).transpose()?,
        })
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Holder of the current [`CredentialPair`].
///
/// `get` is synchronous and returns a snapshot; `set` and `clear` replace the
/// whole pair so no reader observes a mix of old and new tokens.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<CredentialPair>;
    async fn set(&self, pair: CredentialPair) -> Result<(), CredentialError>;
    async fn clear(&self) -> Result<(), CredentialError>;
}

fn read_slot(slot: &RwLock<Option<CredentialPair>>) -> Option<CredentialPair> {
    slot.read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

fn write_slot(slot: &RwLock<Option<CredentialPair>>, value: Option<CredentialPair>) {
    *slot
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = value;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            current: RwLock::new(Some(pair)),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        read_slot(&self.current)
    }

    async fn set(&self, pair: CredentialPair) -> Result<(), CredentialError> {
        write_slot(&self.current, Some(pair));
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        write_slot(&self.current, None);
        Ok(())
    }
}

/// Credential store persisted through the host key-value capability
/// (keychain / keystore), with an in-memory snapshot for synchronous reads.
pub struct KvCredentialStore<K: KeyValueStore + ?Sized> {
    kv: Arc<K>,
    key: KvKey,
    current: RwLock<Option<CredentialPair>>,
}

impl<K: KeyValueStore + ?Sized> KvCredentialStore<K> {
    /// Loads whatever pair was persisted by a previous run.
    ///
    /// An unreadable record is treated as signed out and removed.
    pub async fn load(kv: Arc<K>) -> Result<Self, CredentialError> {
        let key = KvKey::new(KeyNamespace::Session, CREDENTIALS_KEY)?;
        let current = match get_json::<K, CredentialPair>(kv.as_ref(), &key).await {
            Ok(pair) => pair,
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "discarding unreadable persisted credentials");
                kv.delete(&key).await?;
                None
            }
            Err(e) => return Err(e.into()),
        };
        debug!(signed_in = current.is_some(), "credentials loaded");

        Ok(Self {
            kv,
            key,
            current: RwLock::new(current),
        })
    }
}

#[async_trait::async_trait]
impl<K: KeyValueStore + ?Sized> CredentialStore for KvCredentialStore<K> {
    fn get(&self) -> Option<CredentialPair> {
        read_slot(&self.current)
    }

    /// Persists first; the in-memory pair only changes once the write
    /// succeeded.
    #[instrument(skip_all)]
    async fn set(&self, pair: CredentialPair) -> Result<(), CredentialError> {
        set_json(self.kv.as_ref(), &self.key, &pair).await?;
        write_slot(&self.current, Some(pair));
        Ok(())
    }

    /// Forgets the in-memory pair before touching storage so that nothing
    /// keeps using it even if the delete fails.
    #[instrument(skip_all)]
    async fn clear(&self) -> Result<(), CredentialError> {
        write_slot(&self.current, None);
        self.kv.delete(&self.key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKeyValueStore;

    fn pair(access: &str, refresh: Option<&str>) -> CredentialPair {
        CredentialPair::new(access, refresh.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_token_validation() {
        assert!(Token::new("").is_err());
        assert!(Token::new("has space").is_err());
        assert!(Token::new("line\nbreak").is_err());
        assert!(Token::new("x".repeat(MAX_TOKEN_LENGTH + 1)).is_err());
        assert!(Token::new("eyJhbGciOi.abc.def").is_ok());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let p = pair("secret-access", Some("secret-refresh"));
        let debug = format!("{p:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_memory_store_replaces_whole_pair() {
        let store = MemoryCredentialStore::with_pair(pair("a1", Some("r1")));
        store.set(pair("a2", Some("r2"))).await.unwrap();

        let current = store.get().unwrap();
        assert_eq!(current.access_token.expose(), "a2");
        assert_eq!(current.refresh_token.unwrap().expose(), "r2");

        store.clear().await.unwrap();
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_kv_store_persists_across_reload() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        {
            let store = KvCredentialStore::load(kv.clone()).await.unwrap();
            assert!(store.get().is_none());
            store.set(pair("a1", Some("r1"))).await.unwrap();
        }

        let store = KvCredentialStore::load(kv.clone()).await.unwrap();
        assert_eq!(store.get(), Some(pair("a1", Some("r1"))));

        store.clear().await.unwrap();
        assert!(kv.is_empty());
        assert!(KvCredentialStore::load(kv).await.unwrap().get().is_none());
    }

    #[tokio::test]
    async fn test_kv_store_discards_corrupt_record() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let key = KvKey::new(KeyNamespace::Session, CREDENTIALS_KEY).unwrap();
        kv.set(&key, b"{not json".to_vec()).await.unwrap();

        let store = KvCredentialStore::load(kv.clone()).await.unwrap();
        assert!(store.get().is_none());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_previous_pair() {
        struct ReadOnlyKv;

        #[async_trait::async_trait]
        impl KeyValueStore for ReadOnlyKv {
            async fn get(&self, _key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
                Ok(None)
            }
            async fn set(&self, _key: &KvKey, _value: Vec<u8>) -> Result<(), KvError> {
                Err(KvError::Storage {
                    message: "keychain locked".into(),
                    retryable: true,
                })
            }
            async fn delete(&self, _key: &KvKey) -> Result<(), KvError> {
                Ok(())
            }
        }

        let store = KvCredentialStore::load(Arc::new(ReadOnlyKv)).await.unwrap();
        assert!(store.set(pair("a1", None)).await.is_err());
        assert!(store.get().is_none());
    }
}
