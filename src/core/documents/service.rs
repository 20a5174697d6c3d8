use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use super::chain::VersionChain;
use super::types::{ChainScope, DocumentKind, DocumentVersion, VersionDraft, VersionType};
use crate::core::auth::{Authorizer, Caller};
use crate::core::error::{StoryError, StoryResult};
use crate::core::store::{DocumentStore, MemberRole, ProjectMember, ProjectRecord};
use crate::core::tasks::{AgentTask, DocumentType, PromptData, TaskService, TaskStatus};
use crate::core::templates::{
    PromptRenderer, SLOT_APPLY_NOTES, SLOT_GENERATE_BEAT_SHEET, SLOT_GENERATE_SCENE_FROM_SEED,
    SLOT_GENERATE_SCRIPT, SLOT_GENERATE_STORY_FROM_SEED, SLOT_REWRITE_SEGMENT,
    SLOT_SUGGEST_STORY_TITLE,
};

/// Shortest passage `rewrite_segment` accepts, in characters.
pub const MIN_SEGMENT_LENGTH: usize = 20;
/// Shortest story text a title can be suggested for, in characters.
pub const MIN_TITLE_SOURCE_LENGTH: usize = 100;
pub const SUGGESTED_TITLE_KEY: &str = "suggested_title";

const DEFAULT_BEAT_COUNT: usize = 8;

// Task metadata keys.
const META_CREATED_BY: &str = "created_by";
const META_SCENE_KEY: &str = "scene_key";
const META_RESULT_TYPE: &str = "result_version_type";
const META_SCENE_TEXT_ID: &str = "scene_text_id";
const META_SEGMENT: &str = "segment_enc";

/// Model settings for one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f64,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_input_tokens: 8000,
            max_output_tokens: 2000,
        }
    }
}

/// Projects, scenes, version chains and generation requests, behind the
/// membership checks.
#[derive(Clone)]
pub struct DocumentService {
    store: Arc<DocumentStore>,
    chain: VersionChain,
    tasks: TaskService,
    renderer: PromptRenderer,
    auth: Authorizer,
}

fn non_empty<'a>(value: Option<&'a str>, what: &str) -> StoryResult<&'a str> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(StoryError::Validation(format!("{} is empty", what))),
    }
}

fn scope_from_task(task: &AgentTask, kind: DocumentKind) -> ChainScope {
    ChainScope {
        kind,
        project_id: task.project_id.clone(),
        scene_key: task.meta(META_SCENE_KEY).map(str::to_string),
    }
}

impl DocumentService {
    pub fn new(
        store: Arc<DocumentStore>,
        chain: VersionChain,
        tasks: TaskService,
        renderer: PromptRenderer,
    ) -> Self {
        let auth = Authorizer::new(store.clone());
        Self {
            store,
            chain,
            tasks,
            renderer,
            auth,
        }
    }

    pub fn chain(&self) -> &VersionChain {
        &self.chain
    }

    pub fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    // ---- projects and scenes ----

    /// New project owned by the caller, with its story text chain started.
    pub async fn create_project(&self, caller: &Caller, title: &str) -> StoryResult<ProjectRecord> {
        if title.trim().is_empty() {
            return Err(StoryError::Validation("project title is empty".to_string()));
        }
        let project = self.store.insert_project(title.trim(), &caller.user_id).await?;
        self.chain
            .init(
                &ChainScope::story(&project.id),
                &caller.user_id,
                VersionDraft::default(),
            )
            .await?;
        info!("Project {} created by {}", project.id, caller.user_id);
        Ok(project)
    }

    pub async fn get_project(&self, caller: &Caller, project_id: &str) -> StoryResult<ProjectRecord> {
        self.auth.require_member(caller, project_id).await?;
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| StoryError::not_found("project", project_id))
    }

    pub async fn update_project_metadata(
        &self,
        caller: &Caller,
        project_id: &str,
        key: &str,
        value: &str,
    ) -> StoryResult<BTreeMap<String, String>> {
        self.auth.require_member(caller, project_id).await?;
        self.store.set_project_metadata(project_id, key, value).await
    }

    pub async fn add_member(
        &self,
        caller: &Caller,
        project_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoryResult<ProjectMember> {
        self.auth.require_owner(caller, project_id).await?;
        self.store.upsert_member(project_id, user_id, role).await
    }

    pub async fn remove_member(
        &self,
        caller: &Caller,
        project_id: &str,
        user_id: &str,
    ) -> StoryResult<bool> {
        self.auth.require_owner(caller, project_id).await?;
        let owners = self
            .store
            .list_members(project_id)
            .await?
            .into_iter()
            .filter(|m| m.role == MemberRole::Owner)
            .collect::<Vec<_>>();
        if owners.len() == 1 && owners[0].user_id == user_id {
            return Err(StoryError::Validation(
                "cannot remove the last owner of a project".to_string(),
            ));
        }
        self.store.remove_member(project_id, user_id).await
    }

    pub async fn list_members(
        &self,
        caller: &Caller,
        project_id: &str,
    ) -> StoryResult<Vec<ProjectMember>> {
        self.auth.require_member(caller, project_id).await?;
        self.store.list_members(project_id).await
    }

    /// Mint a scene key and start its scene text, beat sheet and script chains.
    pub async fn create_scene(&self, caller: &Caller, project_id: &str) -> StoryResult<String> {
        self.auth.require_member(caller, project_id).await?;
        let scene_key = uuid::Uuid::new_v4().to_string();
        let scene_text = self
            .chain
            .init(
                &ChainScope::scene(DocumentKind::SceneText, project_id, &scene_key),
                &caller.user_id,
                VersionDraft::default(),
            )
            .await?;
        for kind in [DocumentKind::BeatSheet, DocumentKind::ScriptText] {
            self.chain
                .init(
                    &ChainScope::scene(kind, project_id, &scene_key),
                    &caller.user_id,
                    VersionDraft {
                        scene_text_id: Some(scene_text.id.clone()),
                        ..VersionDraft::default()
                    },
                )
                .await?;
        }
        Ok(scene_key)
    }

    pub async fn list_scenes(&self, caller: &Caller, project_id: &str) -> StoryResult<Vec<String>> {
        self.auth.require_member(caller, project_id).await?;
        self.store.list_scene_keys(project_id).await
    }

    // ---- chain operations ----

    pub async fn list_versions(
        &self,
        caller: &Caller,
        scope: &ChainScope,
    ) -> StoryResult<Vec<DocumentVersion>> {
        self.auth.require_member(caller, &scope.project_id).await?;
        self.chain.list_versions(scope).await
    }

    pub async fn get_latest(&self, caller: &Caller, scope: &ChainScope) -> StoryResult<DocumentVersion> {
        self.auth.require_member(caller, &scope.project_id).await?;
        self.chain.get_latest(scope).await
    }

    /// Append an `edit` with the supplied fields on top of the latest version.
    pub async fn update(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        self.auth.require_member(caller, &scope.project_id).await?;
        self.chain.update(scope, &caller.user_id, draft).await
    }

    /// Append a `seed` version carrying a new seed text.
    pub async fn save_seed(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        text_seed: &str,
    ) -> StoryResult<DocumentVersion> {
        self.auth.require_member(caller, &scope.project_id).await?;
        let latest = self.chain.get_latest(scope).await?;
        self.chain
            .create_new_version(
                &latest,
                &caller.user_id,
                VersionType::Seed,
                VersionDraft {
                    text_seed: Some(text_seed.to_string()),
                    ..VersionDraft::default()
                },
            )
            .await
    }

    pub async fn rebase(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        target_number: i64,
    ) -> StoryResult<DocumentVersion> {
        self.auth.require_member(caller, &scope.project_id).await?;
        self.chain.rebase(scope, target_number).await
    }

    pub async fn update_version_label(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        version_number: i64,
        label: Option<&str>,
    ) -> StoryResult<DocumentVersion> {
        self.auth.require_member(caller, &scope.project_id).await?;
        self.chain
            .update_version_label(scope, version_number, label)
            .await
    }

    // ---- generation requests ----

    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        source: &DocumentVersion,
        slot: &str,
        vars: HashMap<String, String>,
        result_type: VersionType,
        document_type: DocumentType,
        mut metadata: BTreeMap<String, String>,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        let rendered = self.renderer.render_slot(slot, &vars).await?;
        let prompt = PromptData {
            model: opts.model.clone(),
            temperature: opts.temperature,
            max_input_tokens: opts.max_input_tokens,
            max_output_tokens: opts.max_output_tokens,
            system_role: rendered.system_role,
            prompt_text: rendered.prompt_text,
        };
        metadata.insert(META_CREATED_BY.to_string(), caller.user_id.clone());
        metadata.insert(META_RESULT_TYPE.to_string(), result_type.as_str().to_string());
        if let Some(scene_key) = &scope.scene_key {
            metadata.insert(META_SCENE_KEY.to_string(), scene_key.clone());
        }
        self.tasks
            .create(&scope.project_id, document_type, &source.id, &prompt, metadata)
            .await
    }

    /// Generate story or scene text from the latest seed.
    pub async fn generate_from_seed(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, &scope.project_id).await?;
        let slot = match scope.kind {
            DocumentKind::StoryText => SLOT_GENERATE_STORY_FROM_SEED,
            DocumentKind::SceneText => SLOT_GENERATE_SCENE_FROM_SEED,
            other => {
                return Err(StoryError::Validation(format!(
                    "{} is not generated from a seed",
                    other.as_str()
                )));
            }
        };
        let latest = self.chain.get_latest(scope).await?;
        let seed = non_empty(latest.text_seed.as_deref(), "text seed")?;
        let mut vars = HashMap::new();
        vars.insert("text_seed".to_string(), seed.to_string());
        if scope.kind == DocumentKind::SceneText {
            let story = self
                .chain
                .get_latest(&ChainScope::story(&scope.project_id))
                .await?;
            vars.insert(
                "story_text".to_string(),
                story.text_content.unwrap_or_default(),
            );
        }
        self.request(
            caller,
            scope,
            &latest,
            slot,
            vars,
            VersionType::Generated,
            scope.kind.into(),
            BTreeMap::new(),
            opts,
        )
        .await
    }

    /// Beat sheet from the scene's latest text.
    pub async fn generate_beat_sheet(
        &self,
        caller: &Caller,
        project_id: &str,
        scene_key: &str,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, project_id).await?;
        let scene = self
            .chain
            .get_latest(&ChainScope::scene(DocumentKind::SceneText, project_id, scene_key))
            .await?;
        let scene_text = non_empty(scene.text_content.as_deref(), "scene text")?;
        let scope = ChainScope::scene(DocumentKind::BeatSheet, project_id, scene_key);
        let source = self.chain.get_latest(&scope).await?;

        let mut vars = HashMap::new();
        vars.insert("scene_text".to_string(), scene_text.to_string());
        vars.insert("beat_count".to_string(), DEFAULT_BEAT_COUNT.to_string());
        let mut metadata = BTreeMap::new();
        metadata.insert(META_SCENE_TEXT_ID.to_string(), scene.id.clone());
        self.request(
            caller,
            &scope,
            &source,
            SLOT_GENERATE_BEAT_SHEET,
            vars,
            VersionType::Generated,
            DocumentType::BeatSheet,
            metadata,
            opts,
        )
        .await
    }

    /// Script from the scene's latest beat sheet.
    pub async fn generate_script(
        &self,
        caller: &Caller,
        project_id: &str,
        scene_key: &str,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, project_id).await?;
        let beats = self
            .chain
            .get_latest(&ChainScope::scene(DocumentKind::BeatSheet, project_id, scene_key))
            .await?;
        let beat_sheet = non_empty(beats.text_content.as_deref(), "beat sheet")?;
        let scene = self
            .chain
            .get_latest(&ChainScope::scene(DocumentKind::SceneText, project_id, scene_key))
            .await?;
        let scope = ChainScope::scene(DocumentKind::ScriptText, project_id, scene_key);
        let source = self.chain.get_latest(&scope).await?;

        let mut vars = HashMap::new();
        vars.insert("beat_sheet".to_string(), beat_sheet.to_string());
        vars.insert(
            "scene_text".to_string(),
            scene.text_content.clone().unwrap_or_default(),
        );
        let mut metadata = BTreeMap::new();
        metadata.insert(META_SCENE_TEXT_ID.to_string(), scene.id.clone());
        self.request(
            caller,
            &scope,
            &source,
            SLOT_GENERATE_SCRIPT,
            vars,
            VersionType::Generated,
            DocumentType::ScriptText,
            metadata,
            opts,
        )
        .await
    }

    /// Revise the latest text with the latest notes; lands as a `notes`
    /// version.
    pub async fn apply_notes(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, &scope.project_id).await?;
        let latest = self.chain.get_latest(scope).await?;
        let notes = non_empty(latest.text_notes.as_deref(), "notes")?;
        let content = non_empty(latest.text_content.as_deref(), "text")?;
        let mut vars = HashMap::new();
        vars.insert("text_notes".to_string(), notes.to_string());
        vars.insert("text_content".to_string(), content.to_string());
        self.request(
            caller,
            scope,
            &latest,
            SLOT_APPLY_NOTES,
            vars,
            VersionType::Notes,
            scope.kind.into(),
            BTreeMap::new(),
            opts,
        )
        .await
    }

    /// Rewrite one passage of the latest text. The result replaces the first
    /// occurrence of the passage.
    pub async fn rewrite_segment(
        &self,
        caller: &Caller,
        scope: &ChainScope,
        segment: &str,
        instructions: &str,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, &scope.project_id).await?;
        let length = segment.chars().count();
        if length < MIN_SEGMENT_LENGTH {
            return Err(StoryError::Validation(format!(
                "segment is {} characters, at least {} required",
                length, MIN_SEGMENT_LENGTH
            )));
        }
        let latest = self.chain.get_latest(scope).await?;
        let content = latest.text_content.as_deref().unwrap_or_default();
        if !content.contains(segment) {
            return Err(StoryError::Validation(
                "segment does not occur in the latest text".to_string(),
            ));
        }
        let mut vars = HashMap::new();
        vars.insert("segment".to_string(), segment.to_string());
        vars.insert("instructions".to_string(), instructions.to_string());
        vars.insert("text_content".to_string(), content.to_string());
        let mut metadata = BTreeMap::new();
        metadata.insert(
            META_SEGMENT.to_string(),
            self.store.cipher().encrypt(segment)?,
        );
        self.request(
            caller,
            scope,
            &latest,
            SLOT_REWRITE_SEGMENT,
            vars,
            VersionType::Generated,
            scope.kind.into(),
            metadata,
            opts,
        )
        .await
    }

    /// Ask for a title; the answer goes to project metadata.
    pub async fn suggest_story_title(
        &self,
        caller: &Caller,
        project_id: &str,
        opts: &GenerationOptions,
    ) -> StoryResult<AgentTask> {
        self.auth.require_member(caller, project_id).await?;
        let scope = ChainScope::story(project_id);
        let latest = self.chain.get_latest(&scope).await?;
        let content = latest.text_content.as_deref().unwrap_or_default();
        let length = content.chars().count();
        if length < MIN_TITLE_SOURCE_LENGTH {
            return Err(StoryError::Validation(format!(
                "story text is {} characters, at least {} required for a title",
                length, MIN_TITLE_SOURCE_LENGTH
            )));
        }
        let mut vars = HashMap::new();
        vars.insert("text_content".to_string(), content.to_string());
        self.request(
            caller,
            &scope,
            &latest,
            SLOT_SUGGEST_STORY_TITLE,
            vars,
            VersionType::Generated,
            DocumentType::SuggestedStoryTitle,
            BTreeMap::new(),
            opts,
        )
        .await
    }

    // ---- results ----

    /// Write generated text back into the task's document. Empty output
    /// writes nothing and yields `None`.
    pub async fn apply_result(
        &self,
        task: &AgentTask,
        result: &str,
    ) -> StoryResult<Option<DocumentVersion>> {
        if result.trim().is_empty() {
            warn!("Task {} produced no output; document left unchanged", task.id);
            return Ok(None);
        }
        let created_by = task.meta(META_CREATED_BY).unwrap_or("agent").to_string();

        let Some(kind) = task.document_type.chain_kind() else {
            self.store
                .set_project_metadata(&task.project_id, SUGGESTED_TITLE_KEY, result.trim())
                .await?;
            info!("Stored suggested title for project {}", task.project_id);
            return Ok(None);
        };

        let scope = scope_from_task(task, kind);
        let source = self.chain.resolve_source(&scope, &task.document_id).await?;
        let version_type = task
            .meta(META_RESULT_TYPE)
            .and_then(VersionType::from_name)
            .unwrap_or(VersionType::Generated);

        let text_content = match task.meta(META_SEGMENT) {
            Some(encrypted) => {
                let segment = self.store.cipher().decrypt(encrypted)?;
                let current = source.text_content.as_deref().unwrap_or_default();
                if !current.contains(&segment) {
                    return Err(StoryError::Validation(format!(
                        "segment for task {} no longer occurs in version {}",
                        task.id, source.id
                    )));
                }
                current.replacen(&segment, result, 1)
            }
            None => result.to_string(),
        };

        let draft = VersionDraft {
            text_content: Some(text_content),
            llm_model: Some(task.llm_model.clone()),
            scene_text_id: task.meta(META_SCENE_TEXT_ID).map(str::to_string),
            ..VersionDraft::default()
        };
        let version = self
            .chain
            .create_new_version(&source, &created_by, version_type, draft)
            .await?;
        Ok(Some(version))
    }

    /// Re-apply the stored result of a completed task.
    pub async fn apply_task_result(&self, task_id: &str) -> StoryResult<Option<DocumentVersion>> {
        let task = self.tasks.get(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(StoryError::Validation(format!(
                "task {} is {}, not completed",
                task_id, task.status
            )));
        }
        let result = task.agent_results.clone().unwrap_or_default();
        self.apply_result(&task, &result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::app::StoryApp;
    use crate::core::cipher::FieldCipher;
    use crate::core::tasks::TaskUsage;

    async fn service() -> DocumentService {
        StoryApp::in_memory(FieldCipher::from_key(&[3u8; 32]))
            .await
            .unwrap()
            .documents
    }

    #[tokio::test]
    async fn members_and_metadata() {
        let docs = service().await;
        let alice = Caller::user("alice");
        let bob = Caller::user("bob");
        let project = docs.create_project(&alice, "  Tides  ").await.unwrap();
        assert_eq!(project.title, "Tides");
        assert!(matches!(
            docs.create_project(&alice, " ").await,
            Err(StoryError::Validation(_))
        ));

        docs.add_member(&alice, &project.id, "bob", MemberRole::Member)
            .await
            .unwrap();
        let meta = docs
            .update_project_metadata(&bob, &project.id, "genre", "noir")
            .await
            .unwrap();
        assert_eq!(meta.get("genre").map(String::as_str), Some("noir"));
        assert!(docs.add_member(&bob, &project.id, "carol", MemberRole::Member).await.is_err());
        assert_eq!(docs.list_members(&bob, &project.id).await.unwrap().len(), 2);
        assert!(docs.remove_member(&alice, &project.id, "bob").await.unwrap());
        assert!(docs.get_project(&bob, &project.id).await.is_err());
    }

    #[tokio::test]
    async fn apply_notes_needs_notes_and_text() {
        let docs = service().await;
        let alice = Caller::user("alice");
        let project = docs.create_project(&alice, "Notes").await.unwrap();
        let scope = ChainScope::story(&project.id);
        let opts = GenerationOptions::default();
        assert!(matches!(
            docs.apply_notes(&alice, &scope, &opts).await,
            Err(StoryError::Validation(_))
        ));

        docs.update(
            &alice,
            &scope,
            VersionDraft {
                text_content: Some("The rain fell.".to_string()),
                text_notes: Some("More thunder".to_string()),
                ..VersionDraft::default()
            },
        )
        .await
        .unwrap();
        let task = docs.apply_notes(&alice, &scope, &opts).await.unwrap();
        assert_eq!(task.meta(META_RESULT_TYPE), Some("notes"));
        assert_eq!(task.meta(META_CREATED_BY), Some("alice"));
        assert!(task.prompt_text.contains("More thunder"));
    }

    #[tokio::test]
    async fn stored_result_can_be_applied_again() {
        let docs = service().await;
        let alice = Caller::user("alice");
        let project = docs.create_project(&alice, "Replay").await.unwrap();
        let scope = ChainScope::story(&project.id);
        docs.save_seed(&alice, &scope, "a seed").await.unwrap();
        let task = docs
            .generate_from_seed(&alice, &scope, &GenerationOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            docs.apply_task_result(&task.id).await,
            Err(StoryError::Validation(_))
        ));

        docs.tasks().begin_processing(&task.id).await.unwrap();
        docs.tasks()
            .complete(
                &task.id,
                &TaskUsage {
                    agent_results: "Grown from a seed.".to_string(),
                    ..TaskUsage::default()
                },
            )
            .await
            .unwrap();
        let version = docs.apply_task_result(&task.id).await.unwrap().unwrap();
        assert_eq!(version.version_type, VersionType::Generated);
        assert_eq!(version.text_content.as_deref(), Some("Grown from a seed."));
        assert_eq!(version.created_by, "alice");
    }
}
