use serde::{Deserialize, Serialize};

use crate::core::error::{StoryError, StoryResult};

/// The four text document families that keep a version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    StoryText,
    SceneText,
    BeatSheet,
    ScriptText,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::StoryText,
        DocumentKind::SceneText,
        DocumentKind::BeatSheet,
        DocumentKind::ScriptText,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::StoryText => "story_text",
            DocumentKind::SceneText => "scene_text",
            DocumentKind::BeatSheet => "beat_sheet",
            DocumentKind::ScriptText => "script_text",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "story_text" => Some(DocumentKind::StoryText),
            "scene_text" => Some(DocumentKind::SceneText),
            "beat_sheet" => Some(DocumentKind::BeatSheet),
            "script_text" => Some(DocumentKind::ScriptText),
            _ => None,
        }
    }

    /// Story text has one chain per project; the rest are keyed by scene.
    pub fn is_scene_scoped(self) -> bool {
        !matches!(self, DocumentKind::StoryText)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Base,
    Seed,
    Edit,
    Notes,
    Generated,
}

impl VersionType {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionType::Base => "base",
            VersionType::Seed => "seed",
            VersionType::Edit => "edit",
            VersionType::Notes => "notes",
            VersionType::Generated => "generated",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "base" => Some(VersionType::Base),
            "seed" => Some(VersionType::Seed),
            "edit" => Some(VersionType::Edit),
            "notes" => Some(VersionType::Notes),
            "generated" => Some(VersionType::Generated),
            _ => None,
        }
    }
}

/// Identifies one version chain: a document kind within a project, and for
/// scene-level kinds the scene key shared by every version of that scene.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainScope {
    pub kind: DocumentKind,
    pub project_id: String,
    pub scene_key: Option<String>,
}

impl ChainScope {
    pub fn story(project_id: &str) -> Self {
        Self {
            kind: DocumentKind::StoryText,
            project_id: project_id.to_string(),
            scene_key: None,
        }
    }

    pub fn scene(kind: DocumentKind, project_id: &str, scene_key: &str) -> Self {
        Self {
            kind,
            project_id: project_id.to_string(),
            scene_key: Some(scene_key.to_string()),
        }
    }

    pub fn validate(&self) -> StoryResult<()> {
        match (self.kind.is_scene_scoped(), self.scene_key.as_deref()) {
            (true, None) | (true, Some("")) => Err(StoryError::Validation(format!(
                "{} requires a scene key",
                self.kind.as_str()
            ))),
            (false, Some(_)) => Err(StoryError::Validation(format!(
                "{} is project scoped and takes no scene key",
                self.kind.as_str()
            ))),
            _ => Ok(()),
        }
    }

    /// Storage form of the scene key; story text uses the empty string.
    pub fn scene_key_column(&self) -> &str {
        self.scene_key.as_deref().unwrap_or("")
    }

    pub fn cache_tag(&self) -> String {
        format!(
            "chain:{}:{}:{}",
            self.kind.as_str(),
            self.project_id,
            self.scene_key_column()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: String,
    pub kind: DocumentKind,
    pub project_id: String,
    pub scene_key: Option<String>,
    pub scene_text_id: Option<String>,
    pub version_number: i64,
    pub version_type: VersionType,
    pub version_label: Option<String>,
    pub llm_model: Option<String>,
    pub text_seed: Option<String>,
    pub text_notes: Option<String>,
    pub text_content: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

impl DocumentVersion {
    pub fn scope(&self) -> ChainScope {
        ChainScope {
            kind: self.kind,
            project_id: self.project_id.clone(),
            scene_key: self.scene_key.clone(),
        }
    }
}

/// Field overrides for a new version. `None` means "copy from the source".
#[derive(Debug, Clone, Default)]
pub struct VersionDraft {
    pub text_seed: Option<String>,
    pub text_notes: Option<String>,
    pub text_content: Option<String>,
    pub version_label: Option<String>,
    pub llm_model: Option<String>,
    pub scene_text_id: Option<String>,
}

impl VersionDraft {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text_content: Some(text.into()),
            ..Self::default()
        }
    }
}
