pub mod providers;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::config::ProvidersConfig;
use crate::core::error::{StoryError, StoryResult};

pub use registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

/// How a model takes its input: a system + user message exchange, or a raw
/// completion over the user prompt alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    Chat,
    Completion,
}

#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub model: &'a str,
    pub system_role: &'a str,
    pub user_prompt: &'a str,
    pub max_output_tokens: i64,
    pub temperature: f64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_kind(&self) -> ProviderKind;

    async fn generate(&self, api: ApiStyle, request: &PromptRequest<'_>) -> Result<String>;
}

/// Routes prompts to the provider that serves a model.
pub struct LlmManager {
    providers: Vec<Box<dyn LlmProvider>>,
    registry: ModelRegistry,
}

impl LlmManager {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            providers: Vec::new(),
            registry,
        }
    }

    /// Register the HTTP providers that have an API key configured.
    pub fn from_config(config: &ProvidersConfig) -> StoryResult<Self> {
        let mut manager = Self::new(ModelRegistry::load()?);
        if let Some(key) = &config.openai_api_key {
            manager.register_provider(Box::new(providers::OpenAiProvider::new(
                key.clone(),
                config.openai_base_url.clone(),
            )));
        }
        if let Some(key) = &config.anthropic_api_key {
            manager.register_provider(Box::new(providers::AnthropicProvider::new(
                key.clone(),
                config.anthropic_base_url.clone(),
            )));
        }
        if manager.providers.is_empty() {
            warn!("No LLM provider keys configured; every generation will fail to route.");
        }
        Ok(manager)
    }

    pub fn register_provider(&mut self, provider: Box<dyn LlmProvider>) {
        info!("Registered LLM Provider: {:?}", provider.provider_kind());
        self.providers.push(provider);
    }

    pub fn get_provider(&self, kind: ProviderKind) -> Option<&dyn LlmProvider> {
        self.providers
            .iter()
            .find(|p| p.provider_kind() == kind)
            .map(|p| p.as_ref())
    }

    /// Model spec plus a registered provider for it.
    pub fn resolve(&self, model: &str) -> StoryResult<ModelSpec> {
        let spec = self
            .registry
            .lookup(model)
            .ok_or_else(|| StoryError::Validation(format!("unknown model: {}", model)))?;
        if self.get_provider(spec.provider).is_none() {
            return Err(StoryError::Validation(format!(
                "no {:?} provider registered for model {}",
                spec.provider, model
            )));
        }
        Ok(spec)
    }

    /// Send one prompt. Transport and API failures are logged and come back
    /// as an empty string; only an unroutable model is an error.
    pub async fn send_prompt(&self, request: &PromptRequest<'_>) -> StoryResult<String> {
        let spec = self.resolve(request.model)?;
        let Some(provider) = self.get_provider(spec.provider) else {
            return Ok(String::new());
        };
        match provider.generate(spec.api, request).await {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(
                    "LLM call failed for model {} ({:?}): {:#}",
                    request.model, spec.provider, e
                );
                Ok(String::new())
            }
        }
    }
}
