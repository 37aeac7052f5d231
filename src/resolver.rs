use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::backend::{BackendConfig, ConnectionParams};
use crate::types::{RelayError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyPreference {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Turns a logical provider id into a ready-to-use backend config.
pub trait BackendResolver: Send + Sync {
    fn resolve(
        &self,
        provider_id: &str,
        model: Option<&str>,
        privacy: PrivacyPreference,
    ) -> Result<BackendConfig>;

    fn default_provider(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cli,
    OpenaiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Data stays inside the EU, so request anonymization is not needed.
    #[serde(default)]
    pub eu_resident: bool,
    /// Ordered alternates to try when this provider is unavailable.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCatalog {
    pub default_provider: String,
    pub providers: Vec<ProviderEntry>,
}

impl ProviderCatalog {
    /// Single local CLI provider with no fallback.
    pub fn builtin() -> Self {
        Self {
            default_provider: "cli".to_string(),
            providers: vec![ProviderEntry {
                id: "cli".to_string(),
                kind: ProviderKind::Cli,
                model: "sonnet".to_string(),
                model_aliases: HashMap::new(),
                program: Some("claude".to_string()),
                args: vec![
                    "--permission-mode".to_string(),
                    "bypassPermissions".to_string(),
                ],
                env: BTreeMap::new(),
                working_dir: None,
                base_url: None,
                api_key_env: None,
                headers: BTreeMap::new(),
                region: None,
                eu_resident: false,
                fallbacks: Vec::new(),
            }],
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Configuration(format!("cannot read provider catalog {:?}: {}", path, e))
        })?;
        let catalog: ProviderCatalog = serde_json::from_str(&raw).map_err(|e| {
            RelayError::Configuration(format!("invalid provider catalog {:?}: {}", path, e))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry(&self.default_provider).is_none() {
            return Err(RelayError::Configuration(format!(
                "default provider '{}' is not in the catalog",
                self.default_provider
            ))
            .into());
        }
        for p in &self.providers {
            for fb in &p.fallbacks {
                if fb == &p.id || self.entry(fb).is_none() {
                    return Err(RelayError::Configuration(format!(
                        "provider '{}' has invalid fallback '{}'",
                        p.id, fb
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn entry(&self, provider_id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.id == provider_id)
    }

    pub fn fallback_chains(&self) -> HashMap<String, Vec<String>> {
        self.providers
            .iter()
            .map(|p| (p.id.clone(), p.fallbacks.clone()))
            .collect()
    }
}

impl BackendResolver for ProviderCatalog {
    fn resolve(
        &self,
        provider_id: &str,
        model: Option<&str>,
        privacy: PrivacyPreference,
    ) -> Result<BackendConfig> {
        let entry = self.entry(provider_id).ok_or_else(|| {
            RelayError::Configuration(format!("unknown provider '{}'", provider_id))
        })?;

        let resolved_model_id = match model {
            Some(m) => entry.model_aliases.get(m).cloned().unwrap_or_else(|| m.to_string()),
            None => entry.model.clone(),
        };

        let privacy_enabled = match privacy {
            PrivacyPreference::Enabled => true,
            PrivacyPreference::Disabled => false,
            PrivacyPreference::Auto => !is_eu_resident(entry),
        };

        let connection = match entry.kind {
            ProviderKind::Cli => ConnectionParams::Cli {
                program: entry.program.clone().ok_or_else(|| {
                    RelayError::Configuration(format!("provider '{}' has no program", entry.id))
                })?,
                args: entry.args.clone(),
                env: entry.env.clone(),
                working_dir: entry.working_dir.clone(),
            },
            ProviderKind::OpenaiCompatible => {
                let base_url = entry.base_url.clone().ok_or_else(|| {
                    RelayError::Configuration(format!("provider '{}' has no base_url", entry.id))
                })?;
                let api_key = match &entry.api_key_env {
                    Some(var) => match std::env::var(var) {
                        Ok(k) if !k.is_empty() => Some(k),
                        _ => {
                            return Err(RelayError::Configuration(format!(
                                "provider '{}' needs {} to be set",
                                entry.id, var
                            ))
                            .into())
                        }
                    },
                    None => None,
                };
                ConnectionParams::OpenAiCompatible {
                    base_url,
                    api_key,
                    headers: entry.headers.clone(),
                }
            }
        };

        Ok(BackendConfig {
            provider_id: entry.id.clone(),
            connection,
            resolved_model_id,
            privacy_enabled,
        })
    }

    fn default_provider(&self) -> &str {
        &self.default_provider
    }
}

fn is_eu_resident(entry: &ProviderEntry) -> bool {
    entry.eu_resident
        || entry
            .region
            .as_deref()
            .is_some_and(|r| r.starts_with("eu-"))
}
