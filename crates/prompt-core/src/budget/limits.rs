//! Model profile registry.
//!
//! Provides known context window sizes, output ceilings and token encodings for
//! common models, with fallback to configurable overrides loaded from a file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::budget::types::{BudgetPolicy, TokenBudget};

/// Token encoding scheme used by a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Encoding {
    #[serde(rename = "cl100k_base")]
    Cl100kBase,
    #[serde(rename = "p50k_base")]
    P50kBase,
    #[serde(rename = "o200k_base")]
    O200kBase,
}

impl Encoding {
    pub const ALL: [Encoding; 3] = [Encoding::Cl100kBase, Encoding::P50kBase, Encoding::O200kBase];

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::O200kBase => "o200k_base",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known model profiles: (name, max total tokens, max output tokens, encoding).
pub const KNOWN_MODEL_PROFILES: &[(&str, u32, u32, Encoding)] = &[
    // GPT-4 family
    ("gpt-4", 8_192, 4_096, Encoding::Cl100kBase),
    ("gpt-4-32k", 32_768, 8_192, Encoding::Cl100kBase),
    ("gpt-4-turbo", 128_000, 4_096, Encoding::Cl100kBase),
    ("gpt-4o", 128_000, 16_384, Encoding::O200kBase),
    ("gpt-4o-mini", 128_000, 16_384, Encoding::O200kBase),
    // GPT-3.5 family
    ("gpt-3.5-turbo", 16_385, 4_096, Encoding::Cl100kBase),
    ("text-davinci-003", 4_097, 2_048, Encoding::P50kBase),
    ("code-davinci-002", 8_001, 4_000, Encoding::P50kBase),
];

/// Name of the profile used when nothing matches.
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Immutable description of one LLM variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelProfile {
    /// Model identifier (partial match supported, e.g. "gpt-4o" matches "gpt-4o-2024-08-06")
    pub name: String,
    /// Maximum context window size in tokens (input + output)
    pub max_total_tokens: u32,
    /// Maximum tokens the model will generate in one call
    pub max_output_tokens: u32,
    /// Token encoding scheme
    pub encoding: Encoding,
}

impl ModelProfile {
    pub fn new(
        name: impl Into<String>,
        max_total_tokens: u32,
        max_output_tokens: u32,
        encoding: Encoding,
    ) -> Self {
        Self {
            name: name.into(),
            max_total_tokens,
            max_output_tokens,
            encoding,
        }
    }

    /// The profile used for unrecognized model names.
    pub fn fallback() -> Self {
        Self::new(DEFAULT_PROFILE_NAME, 8_192, 4_096, Encoding::Cl100kBase)
    }

    fn from_known(entry: &(&str, u32, u32, Encoding)) -> Self {
        let (name, total, output, encoding) = *entry;
        Self::new(name, total, output, encoding)
    }
}

/// Registry of model profiles with built-in defaults and overrides.
#[derive(Debug, Clone, Default)]
pub struct ModelProfileRegistry {
    /// Overrides (higher priority than built-in)
    overrides: HashMap<String, ModelProfile>,
    /// Path for the overrides file
    config_path: Option<PathBuf>,
}

impl ModelProfileRegistry {
    /// Create a registry with built-in profiles only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with a specific overrides file path.
    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            overrides: HashMap::new(),
            config_path: Some(path.into()),
        }
    }

    /// Load overrides from the configured path.
    ///
    /// Default path: `~/.prompt-engine/model_profiles.json`. A missing file is
    /// not an error.
    pub async fn load_overrides(&mut self) -> std::io::Result<()> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(default_config_path);

        if !path.exists() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let profiles: Vec<ModelProfile> = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        for profile in profiles {
            self.overrides.insert(profile.name.clone(), profile);
        }

        tracing::info!(
            "Loaded {} model profile overrides from {:?}",
            self.overrides.len(),
            path
        );
        Ok(())
    }

    /// Add a profile override.
    pub fn add_profile(&mut self, profile: ModelProfile) {
        self.overrides.insert(profile.name.clone(), profile);
    }

    /// Look up a profile, overrides first.
    ///
    /// # Matching Strategy
    /// 1. Exact match (overrides, then built-in)
    /// 2. Model name contains a known name; the longest (most specific) wins
    pub fn get(&self, model: &str) -> Option<ModelProfile> {
        if let Some(profile) = self.overrides.get(model) {
            return Some(profile.clone());
        }

        if let Some(entry) = KNOWN_MODEL_PROFILES.iter().find(|(name, ..)| *name == model) {
            return Some(ModelProfile::from_known(entry));
        }

        let best_override = self
            .overrides
            .iter()
            .filter(|(name, _)| model.contains(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, profile)| profile.clone());

        if best_override.is_some() {
            return best_override;
        }

        KNOWN_MODEL_PROFILES
            .iter()
            .filter(|(name, ..)| model.contains(name))
            .max_by_key(|(name, ..)| name.len())
            .map(ModelProfile::from_known)
    }

    /// Look up a profile, falling back to the default profile.
    pub fn get_or_default(&self, model: &str) -> ModelProfile {
        self.get(model).unwrap_or_else(|| {
            tracing::debug!("No profile for model '{}', using default", model);
            self.overrides
                .get(DEFAULT_PROFILE_NAME)
                .cloned()
                .unwrap_or_else(ModelProfile::fallback)
        })
    }

    /// Budget skeleton for a model under the given policy.
    pub fn budget_for(&self, model: &str, policy: &BudgetPolicy) -> TokenBudget {
        TokenBudget::new(&self.get_or_default(model), policy)
    }
}

/// Get the default overrides file path.
pub fn default_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".prompt-engine").join("model_profiles.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_contain_common_models() {
        let gpt4 = KNOWN_MODEL_PROFILES
            .iter()
            .find(|(name, ..)| *name == "gpt-4")
            .expect("Should have gpt-4");
        assert_eq!(gpt4.1, 8_192);
        assert_eq!(gpt4.3, Encoding::Cl100kBase);
    }

    #[test]
    fn registry_finds_builtin_by_exact_match() {
        let registry = ModelProfileRegistry::new();
        let profile = registry.get("gpt-4-32k").expect("Should find gpt-4-32k");
        assert_eq!(profile.max_total_tokens, 32_768);
    }

    #[test]
    fn registry_prefers_longest_partial_match() {
        let registry = ModelProfileRegistry::new();
        // contains both "gpt-4" and "gpt-4o"
        let profile = registry.get("gpt-4o-2024-08-06").expect("Should match gpt-4o");
        assert_eq!(profile.name, "gpt-4o");
        assert_eq!(profile.encoding, Encoding::O200kBase);
    }

    #[test]
    fn registry_returns_default_for_unknown() {
        let registry = ModelProfileRegistry::new();
        let profile = registry.get_or_default("unknown-model-xyz");
        assert_eq!(profile.name, DEFAULT_PROFILE_NAME);
        assert_eq!(profile, ModelProfile::fallback());
    }

    #[test]
    fn override_takes_precedence() {
        let mut registry = ModelProfileRegistry::new();
        registry.add_profile(ModelProfile::new("gpt-4", 4_000, 1_000, Encoding::Cl100kBase));

        let profile = registry.get("gpt-4").expect("Should find overridden profile");
        assert_eq!(profile.max_total_tokens, 4_000);
    }

    #[tokio::test]
    async fn loads_overrides_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("profiles.json");
        std::fs::write(
            &path,
            r#"[{"name": "local-llama", "max_total_tokens": 4096, "max_output_tokens": 1024, "encoding": "cl100k_base"}]"#,
        )
        .expect("write");

        let mut registry = ModelProfileRegistry::with_config_path(&path);
        registry.load_overrides().await.expect("load");

        let profile = registry.get("local-llama-7b").expect("partial override match");
        assert_eq!(profile.max_output_tokens, 1_024);
    }

    #[tokio::test]
    async fn missing_override_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = ModelProfileRegistry::with_config_path(dir.path().join("absent.json"));
        assert!(registry.load_overrides().await.is_ok());
    }

    #[test]
    fn budget_for_uses_profile_window() {
        let registry = ModelProfileRegistry::new();
        let budget = registry.budget_for("gpt-4", &BudgetPolicy::default());
        assert_eq!(budget.total_max, 8_192);
        assert_eq!(budget.input_buffer, 4_096);
    }
}
