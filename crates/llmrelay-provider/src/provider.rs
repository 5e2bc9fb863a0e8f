//! The `Provider` record and the validation rules enforced on every save,
//! shared by every repository backend so the invariants can't drift between
//! the relational and file-backed implementations.

use std::collections::HashMap;

use llmrelay_protocol::Platform;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub platform: Platform,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub priority_level: u32,
    pub supported_models: Vec<String>,
    pub model_mapping: HashMap<String, String>,
}

impl Provider {
    /// `0` and `1` are treated identically — `0` means "unset", not
    /// "highest priority below everything".
    pub fn effective_priority(&self) -> u32 {
        self.priority_level.max(1)
    }

    pub fn accepts_model(&self, requested: &str) -> bool {
        llmrelay_transform::is_supported(requested, &self.supported_models)
    }

    pub fn effective_model(&self, requested: &str) -> String {
        llmrelay_transform::effective(requested, &self.model_mapping)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("name_not_mutable")]
    NameNotMutable,
    #[error("mapping_target_unsupported: {0}")]
    MappingTargetUnsupported(String),
}

/// Whether `target` is covered by `whitelist` for mapping-validation
/// purposes. Unlike `is_supported` (used for request-time filtering, where
/// an empty whitelist means "accept all"), an empty whitelist here provides
/// zero coverage — a mapping target must be literally matched by an entry,
/// never waved through because the whitelist happens to be absent.
fn mapping_target_covered(target: &str, whitelist: &[String]) -> bool {
    !whitelist.is_empty() && llmrelay_transform::is_supported(target, whitelist)
}

/// Validates an entire platform's provider set the way `save` must before
/// persisting: name immutability against the previously-stored set, and
/// mapping-target coverage by `supportedModels`. Returns warnings (never
/// failures) for the "accept everything" empty-whitelist-and-mapping case.
pub fn validate_providers(existing: &[Provider], incoming: &[Provider]) -> Result<Vec<String>, ProviderError> {
    let mut warnings = Vec::new();

    for provider in incoming {
        if let Some(stored) = existing.iter().find(|p| p.id == provider.id) {
            if stored.name != provider.name {
                return Err(ProviderError::NameNotMutable);
            }
        }

        for target in provider.model_mapping.values() {
            if !mapping_target_covered(target, &provider.supported_models) {
                return Err(ProviderError::MappingTargetUnsupported(target.clone()));
            }
        }

        if provider.supported_models.is_empty() && provider.model_mapping.is_empty() {
            warnings.push(format!(
                "provider '{}' has no supportedModels and no modelMapping; it will accept all models",
                provider.name
            ));
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: i64, name: &str) -> Provider {
        Provider {
            id,
            platform: Platform::Claude,
            name: name.to_string(),
            base_url: "https://example.invalid".to_string(),
            api_key: "key".to_string(),
            enabled: true,
            priority_level: 1,
            supported_models: vec!["claude-*".to_string()],
            model_mapping: HashMap::new(),
        }
    }

    #[test]
    fn rejects_renamed_existing_provider() {
        let existing = vec![provider(1, "primary")];
        let mut incoming = existing.clone();
        incoming[0].name = "renamed".to_string();
        assert_eq!(validate_providers(&existing, &incoming), Err(ProviderError::NameNotMutable));
    }

    #[test]
    fn rejects_mapping_target_not_in_whitelist() {
        let mut p = provider(1, "primary");
        p.model_mapping.insert("claude-sonnet-4".to_string(), "gpt-4o".to_string());
        let err = validate_providers(&[], std::slice::from_ref(&p)).unwrap_err();
        assert_eq!(err, ProviderError::MappingTargetUnsupported("gpt-4o".to_string()));
    }

    #[test]
    fn empty_whitelist_with_mapping_rejects_even_if_target_looks_plausible() {
        let mut p = provider(1, "primary");
        p.supported_models.clear();
        p.model_mapping.insert("gpt-4".to_string(), "nonexistent-model".to_string());
        let err = validate_providers(&[], std::slice::from_ref(&p)).unwrap_err();
        assert_eq!(err, ProviderError::MappingTargetUnsupported("nonexistent-model".to_string()));
    }

    #[test]
    fn empty_whitelist_and_mapping_warns_not_fails() {
        let mut p = provider(1, "primary");
        p.supported_models.clear();
        let warnings = validate_providers(&[], std::slice::from_ref(&p)).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn priority_zero_is_treated_as_one() {
        let mut p = provider(1, "primary");
        p.priority_level = 0;
        assert_eq!(p.effective_priority(), 1);
    }
}
