//! Local user preferences.
//!
//! Stored through the host [`KeyValueStore`] as a versioned JSON document.
//! Older app versions wrote a single pipe-delimited `key=value` string; that
//! form is read as schema 0 and rewritten as the current schema on load.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{set_json, KeyNamespace, KeyValueStore, KvError, KvKey};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
const SETTINGS_KEY: &str = "preferences";
const MIN_TEXT_SCALE: u16 = 50;
const MAX_TEXT_SCALE: u16 = 200;
const MAX_LANGUAGE_TAG_LENGTH: usize = 35;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings storage error: {0}")]
    Storage(#[from] KvError),

    #[error("settings document is corrupted: {0}")]
    Corrupted(String),

    #[error("settings schema {found} is newer than supported {supported}")]
    FutureSchema { found: u32, supported: u32 },

    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl Theme {
    fn parse_legacy(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "system" | "auto" => Some(Self::System),
            "light" => Some(Self::Light),
            "dark" => Some(Self::Dark),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    pub theme: Theme,
    pub language: String,
    pub assistant_model: Option<String>,
    pub speech_enabled: bool,
    pub send_on_enter: bool,
    pub text_scale_percent: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            language: "en".to_string(),
            assistant_model: None,
            speech_enabled: false,
            send_on_enter: true,
            text_scale_percent: 100,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let lang = &self.language;
        if lang.is_empty()
            || lang.len() > MAX_LANGUAGE_TAG_LENGTH
            || !lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(SettingsError::Invalid {
                field: "language",
                reason: format!("'{lang}' is not a language tag"),
            });
        }
        if !(MIN_TEXT_SCALE..=MAX_TEXT_SCALE).contains(&self.text_scale_percent) {
            return Err(SettingsError::Invalid {
                field: "text_scale_percent",
                reason: format!(
                    "{} outside {MIN_TEXT_SCALE}..={MAX_TEXT_SCALE}",
                    self.text_scale_percent
                ),
            });
        }
        if self.assistant_model.as_deref().is_some_and(str::is_empty) {
            return Err(SettingsError::Invalid {
                field: "assistant_model",
                reason: "empty model name".to_string(),
            });
        }
        Ok(())
    }

    /// Reads the schema 0 form, e.g. `theme=dark|language=de|speech=1`.
    ///
    /// Unknown keys and unparseable values fall back to defaults; a legacy
    /// string is never a reason to lose the rest of the user's settings.
    pub fn from_legacy(raw: &str) -> Self {
        let mut settings = Self::default();
        for pair in raw.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                warn!(entry = pair, "skipping malformed legacy setting");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let applied = match key {
                "theme" => Theme::parse_legacy(value).map(|t| settings.theme = t),
                "language" | "lang" => {
                    Some(value.to_string()).filter(|v| !v.is_empty()).map(|v| settings.language = v)
                }
                "model" => {
                    settings.assistant_model = Some(value.to_string()).filter(|v| !v.is_empty());
                    Some(())
                }
                "speech" | "tts" => parse_legacy_bool(value).map(|b| settings.speech_enabled = b),
                "send_on_enter" | "enter_sends" => {
                    parse_legacy_bool(value).map(|b| settings.send_on_enter = b)
                }
                "text_scale" | "font_scale" => value
                    .parse::<u16>()
                    .ok()
                    .filter(|s| (MIN_TEXT_SCALE..=MAX_TEXT_SCALE).contains(s))
                    .map(|s| settings.text_scale_percent = s),
                _ => {
                    debug!(key, "ignoring unknown legacy setting");
                    Some(())
                }
            };
            if applied.is_none() {
                warn!(key, "legacy setting has an invalid value, using default");
            }
        }

        if settings.validate().is_err() {
            settings.language = Self::default().language;
        }
        settings
    }
}

fn parse_legacy_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Serialize, Deserialize)]
struct SettingsEnvelope {
    schema: u32,
    settings: AppSettings,
}

#[derive(Deserialize)]
struct SchemaProbe {
    schema: u32,
}

enum Decoded {
    Current(AppSettings),
    Migrated(AppSettings),
}

fn decode(bytes: &[u8]) -> Result<Decoded, SettingsError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SettingsError::Corrupted(format!("not UTF-8: {e}")))?;
    let trimmed = text.trim_start();

    if !trimmed.starts_with('{') {
        return Ok(Decoded::Migrated(AppSettings::from_legacy(text)));
    }

    let probe: SchemaProbe =
        serde_json::from_str(trimmed).map_err(|e| SettingsError::Corrupted(e.to_string()))?;
    match probe.schema {
        0 => Err(SettingsError::Corrupted(
            "schema 0 is only valid in the legacy text form".to_string(),
        )),
        SETTINGS_SCHEMA_VERSION => {
            let envelope: SettingsEnvelope = serde_json::from_str(trimmed)
                .map_err(|e| SettingsError::Corrupted(e.to_string()))?;
            envelope.settings.validate()?;
            Ok(Decoded::Current(envelope.settings))
        }
        found => Err(SettingsError::FutureSchema {
            found,
            supported: SETTINGS_SCHEMA_VERSION,
        }),
    }
}

pub struct SettingsStore<K: KeyValueStore + ?Sized> {
    kv: Arc<K>,
    key: KvKey,
}

impl<K: KeyValueStore + ?Sized> SettingsStore<K> {
    pub fn new(kv: Arc<K>) -> Result<Self, SettingsError> {
        Ok(Self {
            kv,
            key: KvKey::new(KeyNamespace::Settings, SETTINGS_KEY)?,
        })
    }

    /// Returns the stored settings, defaults if none were ever saved.
    ///
    /// A legacy record is migrated and written back in the current schema.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<AppSettings, SettingsError> {
        let Some(bytes) = self.kv.get(&self.key).await? else {
            return Ok(AppSettings::default());
        };

        match decode(&bytes)? {
            Decoded::Current(settings) => Ok(settings),
            Decoded::Migrated(settings) => {
                info!(
                    to = SETTINGS_SCHEMA_VERSION,
                    "migrating legacy settings"
                );
                self.save(&settings).await?;
                Ok(settings)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn save(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        let envelope = SettingsEnvelope {
            schema: SETTINGS_SCHEMA_VERSION,
            settings: settings.clone(),
        };
        set_json(self.kv.as_ref(), &self.key, &envelope).await?;
        Ok(())
    }

    /// Loads, applies `change`, validates and saves. Nothing is written if
    /// the changed settings are invalid.
    pub async fn update<F>(&self, change: F) -> Result<AppSettings, SettingsError>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut settings = self.load().await?;
        change(&mut settings);
        self.save(&settings).await?;
        Ok(settings)
    }

    pub async fn reset(&self) -> Result<(), SettingsError> {
        self.kv.delete(&self.key).await?;
        Ok(())
    }
}
