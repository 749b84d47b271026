use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::capabilities::ApiPath;
use crate::outbox::RequestClass;
use crate::{
    DEFAULT_REFRESH_PATH, DELIVERED_CACHE_SIZE, EVENT_CHANNEL_CAPACITY, MAX_OUTBOX_ENTRIES,
    MAX_RETRY_ATTEMPTS, MEDIA_TIMEOUT, REFRESH_TIMEOUT, REQUEST_TIMEOUT,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Core configuration, built by the host and passed in at construction.
///
/// Durations are expressed in milliseconds in the serialized form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub refresh_path: String,
    pub request_timeout_ms: u64,
    pub media_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub max_retries: u32,
    pub max_queue_entries: usize,
    pub delivered_cache_size: usize,
    pub event_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com".to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_ms: duration_ms(REQUEST_TIMEOUT),
            media_timeout_ms: duration_ms(MEDIA_TIMEOUT),
            refresh_timeout_ms: duration_ms(REFRESH_TIMEOUT),
            max_retries: MAX_RETRY_ATTEMPTS,
            max_queue_entries: MAX_OUTBOX_ENTRIES,
            delivered_cache_size: DELIVERED_CACHE_SIZE,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        self.refresh_path()?;

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.media_timeout_ms < self.request_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "media_timeout_ms",
                reason: "must be >= request_timeout_ms".into(),
            });
        }
        if self.refresh_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refresh_timeout_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_retries",
                reason: "must be > 0".into(),
            });
        }
        if self.max_queue_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_queue_entries",
                reason: "must be > 0".into(),
            });
        }
        if self.delivered_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "delivered_cache_size",
                reason: "must be > 0".into(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.api_base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.api_base_url.clone(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.api_base_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.api_base_url.clone(),
                reason: "missing host".into(),
            });
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.api_base_url.clone(),
                reason: "credentials in URL are not allowed".into(),
            });
        }
        Ok(url)
    }

    pub fn refresh_path(&self) -> Result<ApiPath, ConfigError> {
        ApiPath::new(self.refresh_path.clone()).map_err(|e| ConfigError::InvalidValue {
            field: "refresh_path",
            reason: e.to_string(),
        })
    }

    /// Absolute URL for a request path, for transport implementations.
    pub fn endpoint(&self, path: &ApiPath) -> Result<Url, ConfigError> {
        let base = self.base_url()?;
        let mut joined = base.as_str().trim_end_matches('/').to_string();
        joined.push_str(path.as_str());
        Url::parse(&joined).map_err(|e| ConfigError::InvalidBaseUrl {
            url: joined,
            reason: e.to_string(),
        })
    }

    pub fn timeout_for(&self, class: RequestClass) -> Duration {
        match class {
            RequestClass::Standard => Duration::from_millis(self.request_timeout_ms),
            RequestClass::Media => Duration::from_millis(self.media_timeout_ms),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{"api_base_url": "https://assistant.example.org/v1", "max_retries": 3}"#,
        )
        .unwrap();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.refresh_path, DEFAULT_REFRESH_PATH);
        assert_eq!(config.timeout_for(RequestClass::Standard), REQUEST_TIMEOUT);
        assert_eq!(config.timeout_for(RequestClass::Media), MEDIA_TIMEOUT);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = CoreConfig::from_json_str(r#"{"max_retry": 3}"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_base_url_validation() {
        let mut config = CoreConfig {
            api_base_url: "ftp://example.com".into(),
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());

        config.api_base_url = "https://user:pw@example.com".into();
        assert!(config.validate().is_err());

        config.api_base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = CoreConfig {
            max_retries: 0,
            ..CoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "max_retries", .. })
        ));

        let config = CoreConfig {
            media_timeout_ms: 1,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let config = CoreConfig {
            api_base_url: "https://assistant.example.org/v1/".into(),
            ..CoreConfig::default()
        };
        let path = ApiPath::new("/chat/messages").unwrap();
        assert_eq!(
            config.endpoint(&path).unwrap().as_str(),
            "https://assistant.example.org/v1/chat/messages"
        );
    }

    #[test]
    fn test_independent_configs_coexist() {
        let fast = CoreConfig {
            request_timeout_ms: 1_000,
            media_timeout_ms: 2_000,
            ..CoreConfig::default()
        };
        let slow = CoreConfig::default();
        assert_ne!(
            fast.timeout_for(RequestClass::Standard),
            slow.timeout_for(RequestClass::Standard)
        );
    }
}
