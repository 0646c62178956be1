#![allow(dead_code)]
//! Service settings and document profiles.
//!
//! Settings come from the environment (after `.env` is loaded). Document
//! profiles are compiled in from `profiles/*.json`; a `PROFILES_DIR` may
//! override any of them by kind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::schema::DocumentKind;

const BUILTIN_PROFILES: [&str; 7] = [
    include_str!("../profiles/w2.json"),
    include_str!("../profiles/1099_int.json"),
    include_str!("../profiles/1099_div.json"),
    include_str!("../profiles/1099_nec.json"),
    include_str!("../profiles/1099_misc.json"),
    include_str!("../profiles/1099_r.json"),
    include_str!("../profiles/1099_g.json"),
];

// ============================================================================
// Settings
// ============================================================================

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_DATABASE: &str = "tax_assistant";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_UPLOAD_MB: usize = 25;

/// Runtime settings for the server.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// `None` keeps sessions in memory.
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
    /// `None` disables the CPA assistant and the LLM field fallback.
    pub openai: Option<OpenAiSettings>,
    /// Enables remote OCR for scanned PDFs and images.
    pub mistral_api_key: Option<String>,
    pub profiles_dir: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
    pub state_rates_path: Option<PathBuf>,
    /// When set, user identity comes from HS256 bearer tokens.
    pub jwt_secret: Option<String>,
    pub max_upload_bytes: usize,
    pub llm_field_fallback: bool,
}

#[derive(Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl std::fmt::Debug for OpenAiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let openai = get("OPENAI_API_KEY").map(|api_key| OpenAiSettings {
            api_key,
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        });

        let max_upload_mb = match get("MAX_UPLOAD_MB") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("MAX_UPLOAD_MB must be a whole number, got {:?}", raw))?,
            None => DEFAULT_MAX_UPLOAD_MB,
        };

        let llm_field_fallback = match get("LLM_FIELD_FALLBACK") {
            Some(raw) => parse_bool(&raw)
                .with_context(|| format!("LLM_FIELD_FALLBACK must be true/false, got {:?}", raw))?,
            None => openai.is_some(),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            mongodb_uri: get("MONGODB_URI"),
            mongodb_database: get("MONGODB_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            openai,
            mistral_api_key: get("MISTRAL_API_KEY"),
            profiles_dir: get("PROFILES_DIR").map(PathBuf::from),
            templates_dir: get("TEMPLATES_DIR").map(PathBuf::from),
            state_rates_path: get("STATE_RATES_PATH").map(PathBuf::from),
            jwt_secret: get("JWT_SECRET"),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            llm_field_fallback,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Document profiles
// ============================================================================

/// Classification and parsing rules for one document kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentProfile {
    pub kind: DocumentKind,
    pub description: String,
    /// Regexes that identify the form itself (e.g. `1099-INT`). Weighted heavily.
    #[serde(default)]
    pub form_patterns: Vec<String>,
    /// Case-insensitive phrases typical of the form's box labels.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldPattern>,
    /// Fields without which the document cannot be used for a refund estimate.
    #[serde(default)]
    pub required: Vec<String>,
}

/// Regex patterns for one field.
///
/// Patterns may use `{amount}` and `{state}` placeholders, which expand to
/// a money capture group and a two-letter code capture group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPattern {
    pub field: String,
    pub label: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub value_type: ValueType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Amount,
    Text,
    State,
}

/// In-memory store for all loaded profiles, keyed by document kind.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: Arc<RwLock<BTreeMap<DocumentKind, DocumentProfile>>>,
}

impl ProfileStore {
    /// Profiles compiled into the binary.
    pub fn builtin() -> Result<Self> {
        let mut profiles = BTreeMap::new();
        for raw in BUILTIN_PROFILES {
            let profile: DocumentProfile =
                serde_json::from_str(raw).context("Failed to parse built-in profile")?;
            profiles.insert(profile.kind, profile);
        }
        Ok(Self {
            profiles: Arc::new(RwLock::new(profiles)),
        })
    }

    /// Built-in profiles, overridden by any `*.json` profile in `dir`.
    pub fn load_with_overrides(dir: &Path) -> Result<Self> {
        let store = Self::builtin()?;

        if !dir.exists() {
            anyhow::bail!("Profile directory does not exist: {:?}", dir);
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read profile: {:?}", path))?;

                let profile: DocumentProfile = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse profile: {:?}", path))?;

                if profile.kind == DocumentKind::Unknown {
                    warn!("Ignoring profile {:?}: kind UNKNOWN cannot be configured", path);
                    continue;
                }

                info!("Loaded profile: {} from {:?}", profile.kind, path);
                store.insert(profile);
            }
        }

        Ok(store)
    }

    pub fn get(&self, kind: DocumentKind) -> Option<DocumentProfile> {
        self.read().get(&kind).cloned()
    }

    /// All profiles, in kind order.
    pub fn all(&self) -> Vec<DocumentProfile> {
        self.read().values().cloned().collect()
    }

    pub fn list(&self) -> Vec<DocumentKind> {
        self.read().keys().copied().collect()
    }

    pub fn insert(&self, profile: DocumentProfile) {
        self.profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(profile.kind, profile);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DocumentKind, DocumentProfile>> {
        self.profiles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(settings.bind_addr, "0.0.0.0:3000");
        assert!(settings.mongodb_uri.is_none());
        assert_eq!(settings.mongodb_database, "tax_assistant");
        assert!(settings.openai.is_none());
        assert!(!settings.llm_field_fallback);
        assert_eq!(settings.max_upload_bytes, 25 * 1024 * 1024);
    }

    #[test]
    fn test_settings_openai_enables_fallback() {
        let settings = Settings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
        ]))
        .unwrap();

        let openai = settings.openai.unwrap();
        assert_eq!(openai.model, "gpt-4o-mini");
        assert_eq!(openai.base_url, "http://localhost:8080/v1");
        assert!(settings.llm_field_fallback);
    }

    #[test]
    fn test_settings_blank_values_are_unset() {
        let settings = Settings::from_lookup(lookup(&[("MONGODB_URI", "  ")])).unwrap();

        assert!(settings.mongodb_uri.is_none());
    }

    #[test]
    fn test_settings_rejects_bad_upload_limit() {
        let result = Settings::from_lookup(lookup(&[("MAX_UPLOAD_MB", "lots")]));

        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_profiles_cover_every_kind() {
        let store = ProfileStore::builtin().unwrap();

        assert_eq!(store.list(), DocumentKind::ALL.to_vec());
        let w2 = store.get(DocumentKind::W2).unwrap();
        assert!(w2.required.contains(&"wages".to_string()));
    }

    #[test]
    fn test_override_dir_replaces_profile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("w2.json"),
            r#"{"kind": "W2", "description": "Custom W-2", "fields": [], "required": []}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = ProfileStore::load_with_overrides(dir.path()).unwrap();

        assert_eq!(store.get(DocumentKind::W2).unwrap().description, "Custom W-2");
        assert_eq!(store.list().len(), 7);
    }

    #[test]
    fn test_missing_override_dir_is_an_error() {
        let result = ProfileStore::load_with_overrides(Path::new("/nonexistent/profiles"));

        assert!(result.is_err());
    }
}
