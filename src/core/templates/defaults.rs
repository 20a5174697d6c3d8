use tracing::info;

use crate::core::error::StoryResult;
use crate::core::store::{DocumentStore, PromptSlot, PromptTemplate};

pub const SLOT_GENERATE_STORY_FROM_SEED: &str = "prompts.generateStoryFromSeed";
pub const SLOT_GENERATE_SCENE_FROM_SEED: &str = "prompts.generateSceneFromSeed";
pub const SLOT_GENERATE_BEAT_SHEET: &str = "prompts.generateBeatSheet";
pub const SLOT_GENERATE_SCRIPT: &str = "prompts.generateScript";
pub const SLOT_APPLY_NOTES: &str = "prompts.applyNotes";
pub const SLOT_REWRITE_SEGMENT: &str = "prompts.rewriteSegment";
pub const SLOT_SUGGEST_STORY_TITLE: &str = "prompts.suggestStoryTitle";

const SYSTEM_OWNER: &str = "system";

const TEMPLATES: &[(&str, &str, &str)] = &[
    (
        "system.storyWriter",
        "Story writer",
        "You are an experienced fiction writer. Write vivid, coherent prose and return only the story text.",
    ),
    (
        "system.screenwriter",
        "Screenwriter",
        "You are a professional screenwriter. Follow standard screenplay conventions and return only the requested text.",
    ),
    (
        "system.editor",
        "Editor",
        "You are a careful fiction editor. Preserve the author's voice and change only what the instructions ask for.",
    ),
    (
        "user.generateStoryFromSeed",
        "Story from seed",
        "Write a complete short story based on this idea:\n\n<<text_seed>>\n",
    ),
    (
        "user.generateSceneFromSeed",
        "Scene from seed",
        "Story so far:\n<<story_text>>\n\nWrite the next scene based on this idea:\n\n<<text_seed>>\n",
    ),
    (
        "user.generateBeatSheet",
        "Beat sheet from scene",
        "Break the following scene into <<beat_count>> beats, one line each.\n\nScene:\n<<scene_text>>\n\nBeats:\n[% for i in range(beat_count) %]- Beat <<i>>:\n[% endfor %]",
    ),
    (
        "user.generateScript",
        "Script from beat sheet",
        "Write a screenplay for this scene following the beat sheet.\n\nScene:\n<<scene_text>>\n\nBeat sheet:\n<<beat_sheet>>\n",
    ),
    (
        "user.applyNotes",
        "Apply notes",
        "Revise the text below according to the notes. Return the full revised text.\n\nNotes:\n<<text_notes>>\n\nText:\n<<text_content>>\n",
    ),
    (
        "user.rewriteSegment",
        "Rewrite segment",
        "Rewrite only the passage below according to the instructions. Return only the rewritten passage.\n\nInstructions:\n<<instructions>>\n\nPassage:\n<<segment>>\n\nSurrounding text:\n<<text_content>>\n",
    ),
    (
        "user.suggestStoryTitle",
        "Suggest title",
        "Suggest one title for this story. Return the title only.\n\n<<text_content>>\n",
    ),
];

const SLOTS: &[(&str, &str, &str)] = &[
    (SLOT_GENERATE_STORY_FROM_SEED, "system.storyWriter", "user.generateStoryFromSeed"),
    (SLOT_GENERATE_SCENE_FROM_SEED, "system.storyWriter", "user.generateSceneFromSeed"),
    (SLOT_GENERATE_BEAT_SHEET, "system.screenwriter", "user.generateBeatSheet"),
    (SLOT_GENERATE_SCRIPT, "system.screenwriter", "user.generateScript"),
    (SLOT_APPLY_NOTES, "system.editor", "user.applyNotes"),
    (SLOT_REWRITE_SEGMENT, "system.editor", "user.rewriteSegment"),
    (SLOT_SUGGEST_STORY_TITLE, "system.editor", "user.suggestStoryTitle"),
];

/// Install built-in templates and slot bindings that are not already
/// present. Existing rows are left alone. Returns how many rows were written.
pub async fn seed_default_templates(store: &DocumentStore) -> StoryResult<usize> {
    let mut written = 0;
    for (reference_key, name, prompt_text) in TEMPLATES {
        let template = PromptTemplate {
            name: name.to_string(),
            reference_key: reference_key.to_string(),
            prompt_text: prompt_text.to_string(),
            owner: SYSTEM_OWNER.to_string(),
        };
        if store.insert_template_if_missing(&template).await? {
            written += 1;
        }
    }
    for (slot, system_role, user_prompt) in SLOTS {
        let binding = PromptSlot {
            system_role: system_role.to_string(),
            user_prompt: user_prompt.to_string(),
        };
        if store.set_prompt_slot_if_missing(slot, &binding).await? {
            written += 1;
        }
    }
    if written > 0 {
        info!("Seeded {} default prompt templates and slots", written);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::templates::{Template, render, vars};

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = test_store();
        let first = seed_default_templates(&store).await.unwrap();
        assert_eq!(first, TEMPLATES.len() + SLOTS.len());
        assert_eq!(seed_default_templates(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn every_slot_points_at_seeded_templates() {
        let store = test_store();
        seed_default_templates(&store).await.unwrap();
        for (slot, _, _) in SLOTS {
            let binding = store.get_prompt_slot(slot).await.unwrap().unwrap();
            assert!(store.get_template_by_key(&binding.system_role).await.unwrap().is_some());
            assert!(store.get_template_by_key(&binding.user_prompt).await.unwrap().is_some());
        }
    }

    #[test]
    fn every_default_template_parses() {
        for (key, _, text) in TEMPLATES {
            assert!(Template::parse(text).is_ok(), "{} failed to parse", key);
        }
    }

    #[test]
    fn beat_sheet_template_expands_its_loop() {
        let text = TEMPLATES
            .iter()
            .find(|(key, _, _)| *key == "user.generateBeatSheet")
            .map(|(_, _, text)| *text)
            .unwrap();
        let out = render(text, &vars([("beat_count", "2"), ("scene_text", "A door opens.")])).unwrap();
        assert!(out.ends_with("Beats:\n- Beat 0:\n- Beat 1:\n"));
    }
}
