use serde::{Deserialize, Serialize};

use super::{ApiStyle, ProviderKind};
use crate::core::error::StoryResult;

const MODELS_JSON: &str = include_str!("models.json");

/// Routing and hard limits for one model id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub provider: ProviderKind,
    pub api: ApiStyle,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
}

impl ModelSpec {
    /// Clamp caller-requested budgets to the model's hard caps.
    pub fn effective_limits(&self, max_input_tokens: i64, max_output_tokens: i64) -> (i64, i64) {
        (
            max_input_tokens.min(self.max_input_tokens),
            max_output_tokens.min(self.max_output_tokens),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FallbackRule {
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    contains: Option<String>,
    provider: ProviderKind,
    api: ApiStyle,
    max_input_tokens: i64,
    max_output_tokens: i64,
}

impl FallbackRule {
    fn matches(&self, model: &str) -> bool {
        if let Some(prefix) = &self.prefix
            && !model.starts_with(prefix.as_str())
        {
            return false;
        }
        if let Some(needle) = &self.contains
            && !model.contains(needle.as_str())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRegistry {
    models: Vec<ModelSpec>,
    fallbacks: Vec<FallbackRule>,
}

impl ModelRegistry {
    pub fn load() -> StoryResult<Self> {
        Ok(serde_json::from_str(MODELS_JSON)?)
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// Exact id first, then the first matching fallback rule. `None` only if
    /// no rule matches at all.
    pub fn lookup(&self, model: &str) -> Option<ModelSpec> {
        let normalized = model.trim().to_lowercase();
        if let Some(spec) = self.models.iter().find(|m| m.id == normalized) {
            return Some(spec.clone());
        }
        self.fallbacks
            .iter()
            .find(|rule| rule.matches(&normalized))
            .map(|rule| ModelSpec {
                id: model.trim().to_string(),
                provider: rule.provider,
                api: rule.api,
                max_input_tokens: rule.max_input_tokens,
                max_output_tokens: rule.max_output_tokens,
            })
    }
}
