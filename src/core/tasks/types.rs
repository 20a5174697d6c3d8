use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::documents::DocumentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task generates. The first four write back into a version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    StoryText,
    SceneText,
    BeatSheet,
    ScriptText,
    SuggestedStoryTitle,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::StoryText => "story_text",
            DocumentType::SceneText => "scene_text",
            DocumentType::BeatSheet => "beat_sheet",
            DocumentType::ScriptText => "script_text",
            DocumentType::SuggestedStoryTitle => "suggested_story_title",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "story_text" => Some(DocumentType::StoryText),
            "scene_text" => Some(DocumentType::SceneText),
            "beat_sheet" => Some(DocumentType::BeatSheet),
            "script_text" => Some(DocumentType::ScriptText),
            "suggested_story_title" => Some(DocumentType::SuggestedStoryTitle),
            _ => None,
        }
    }

    pub fn chain_kind(self) -> Option<DocumentKind> {
        match self {
            DocumentType::StoryText => Some(DocumentKind::StoryText),
            DocumentType::SceneText => Some(DocumentKind::SceneText),
            DocumentType::BeatSheet => Some(DocumentKind::BeatSheet),
            DocumentType::ScriptText => Some(DocumentKind::ScriptText),
            DocumentType::SuggestedStoryTitle => None,
        }
    }
}

impl From<DocumentKind> for DocumentType {
    fn from(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::StoryText => DocumentType::StoryText,
            DocumentKind::SceneText => DocumentType::SceneText,
            DocumentKind::BeatSheet => DocumentType::BeatSheet,
            DocumentKind::ScriptText => DocumentType::ScriptText,
        }
    }
}

/// Model settings and rendered prompt text handed to a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptData {
    pub model: String,
    pub temperature: f64,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
    pub system_role: String,
    pub prompt_text: String,
}

/// One LLM generation request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub project_id: String,
    pub document_type: DocumentType,
    pub document_id: String,
    pub llm_model: String,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
    pub temperature: f64,
    pub system_role: String,
    pub prompt_text: String,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub input_tokens_used: Option<i64>,
    pub output_tokens_used: Option<i64>,
    pub process_time_ms: Option<i64>,
    pub agent_results: Option<String>,
    pub agent_id: Option<String>,
    pub errors: Option<String>,
    pub processing_at: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentTask {
    pub fn prompt_data(&self) -> PromptData {
        PromptData {
            model: self.llm_model.clone(),
            temperature: self.temperature,
            max_input_tokens: self.max_input_tokens,
            max_output_tokens: self.max_output_tokens,
            system_role: self.system_role.clone(),
            prompt_text: self.prompt_text.clone(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }
}

/// Accounting recorded when a task completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUsage {
    pub input_tokens_used: i64,
    pub output_tokens_used: i64,
    pub process_time_ms: i64,
    pub agent_results: String,
    pub agent_id: String,
}

/// Queue message body. Only the id travels; the task is fetched by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
}
