mod defaults;
mod engine;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::error::{StoryError, StoryResult};
use crate::core::store::DocumentStore;

pub use defaults::{
    SLOT_APPLY_NOTES, SLOT_GENERATE_BEAT_SHEET, SLOT_GENERATE_SCENE_FROM_SEED, SLOT_GENERATE_SCRIPT,
    SLOT_GENERATE_STORY_FROM_SEED, SLOT_REWRITE_SEGMENT, SLOT_SUGGEST_STORY_TITLE,
    seed_default_templates,
};
pub use engine::{Template, TemplateError, render};

/// Rendered system-role / user-prompt pair for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system_role: String,
    pub prompt_text: String,
}

/// Resolves template reference keys and prompt slots against the store.
#[derive(Clone)]
pub struct PromptRenderer {
    store: Arc<DocumentStore>,
}

impl PromptRenderer {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn render_key(
        &self,
        reference_key: &str,
        vars: &HashMap<String, String>,
    ) -> StoryResult<String> {
        let template = self
            .store
            .get_template_by_key(reference_key)
            .await?
            .ok_or_else(|| TemplateError::NotFound(reference_key.to_string()))?;
        Ok(render(&template.prompt_text, vars)?)
    }

    pub async fn render_slot(
        &self,
        slot: &str,
        vars: &HashMap<String, String>,
    ) -> StoryResult<RenderedPrompt> {
        let binding = self
            .store
            .get_prompt_slot(slot)
            .await?
            .ok_or_else(|| StoryError::not_found("prompt slot", slot))?;
        debug!(
            "Rendering slot {} with {} / {}",
            slot, binding.system_role, binding.user_prompt
        );
        Ok(RenderedPrompt {
            system_role: self.render_key(&binding.system_role, vars).await?,
            prompt_text: self.render_key(&binding.user_prompt, vars).await?,
        })
    }
}

/// Build a variable map from string pairs.
pub fn vars<const N: usize>(pairs: [(&str, &str); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{PromptSlot, PromptTemplate, test_store};

    async fn renderer_with(templates: &[(&str, &str)]) -> PromptRenderer {
        let store = Arc::new(test_store());
        for (key, text) in templates {
            store
                .upsert_template(&PromptTemplate {
                    name: key.to_string(),
                    reference_key: key.to_string(),
                    prompt_text: text.to_string(),
                    owner: "admin".to_string(),
                })
                .await
                .unwrap();
        }
        PromptRenderer::new(store)
    }

    #[tokio::test]
    async fn renders_by_reference_key() {
        let renderer = renderer_with(&[("greet", "Hello <<name>>")]).await;
        let out = renderer
            .render_key("greet", &vars([("name", "World")]))
            .await
            .unwrap();
        assert_eq!(out, "Hello World");
    }

    #[tokio::test]
    async fn missing_key_is_template_not_found() {
        let renderer = renderer_with(&[]).await;
        let err = renderer.render_key("nope", &vars([])).await.unwrap_err();
        assert!(matches!(err, StoryError::Template(TemplateError::NotFound(_))));
    }

    #[tokio::test]
    async fn slot_renders_both_halves() {
        let renderer = renderer_with(&[("sys", "You write <<genre>>."), ("usr", "Seed: <<text_seed>>")]).await;
        renderer
            .store
            .set_prompt_slot(
                "prompts.test",
                &PromptSlot {
                    system_role: "sys".to_string(),
                    user_prompt: "usr".to_string(),
                },
            )
            .await
            .unwrap();
        let rendered = renderer
            .render_slot("prompts.test", &vars([("genre", "noir"), ("text_seed", "rain")]))
            .await
            .unwrap();
        assert_eq!(rendered.system_role, "You write noir.");
        assert_eq!(rendered.prompt_text, "Seed: rain");
    }

    #[tokio::test]
    async fn unbound_slot_is_not_found() {
        let renderer = renderer_with(&[]).await;
        let err = renderer.render_slot("prompts.none", &vars([])).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
