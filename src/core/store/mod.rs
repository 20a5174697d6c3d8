mod api_keys;
mod projects;
mod tasks;
mod templates;
pub mod types;
mod versions;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::cipher::FieldCipher;
use crate::core::error::StoryResult;

pub use api_keys::API_KEY_PREFIX;
pub use tasks::TaskFilter;
pub use types::{ApiKeyRecord, MemberRole, ProjectMember, ProjectRecord, PromptSlot, PromptTemplate};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_by TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS project_members (
        project_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (project_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS document_versions (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        project_id TEXT NOT NULL,
        scene_key TEXT NOT NULL DEFAULT '',
        scene_text_id TEXT,
        version_number INTEGER NOT NULL,
        version_type TEXT NOT NULL,
        version_label TEXT,
        llm_model TEXT,
        text_seed TEXT,
        text_notes TEXT,
        text_content TEXT,
        created_by TEXT NOT NULL,
        created_at DATETIME DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_document_versions_scope_number
        ON document_versions(kind, project_id, scene_key, version_number)",
    "CREATE TABLE IF NOT EXISTS agent_tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        document_type TEXT NOT NULL,
        document_id TEXT NOT NULL,
        llm_model TEXT NOT NULL,
        max_input_tokens INTEGER NOT NULL,
        max_output_tokens INTEGER NOT NULL,
        temperature REAL NOT NULL,
        system_role TEXT NOT NULL,
        prompt_text TEXT NOT NULL,
        status TEXT NOT NULL,
        status_message TEXT,
        input_tokens_used INTEGER,
        output_tokens_used INTEGER,
        process_time_ms INTEGER,
        agent_results TEXT,
        agent_id TEXT,
        errors TEXT,
        processing_at DATETIME,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at DATETIME DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
        updated_at DATETIME DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_agent_tasks_status_created ON agent_tasks(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_agent_tasks_project ON agent_tasks(project_id)",
    "CREATE TABLE IF NOT EXISTS prompt_templates (
        reference_key TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        prompt_text TEXT NOT NULL,
        owner TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS platform_settings (
        key TEXT PRIMARY KEY,
        value_json TEXT NOT NULL,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        key_hash TEXT NOT NULL UNIQUE,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
];

/// SQLite-backed document store: projects, version chains, agent tasks,
/// prompt templates and API keys. Version text and task prompt/result
/// fields pass through the [`FieldCipher`] on every write and read.
pub struct DocumentStore {
    db: Arc<Mutex<Connection>>,
    cipher: FieldCipher,
}

impl DocumentStore {
    pub async fn open<P: AsRef<Path>>(path: P, cipher: FieldCipher) -> StoryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path)?;
        info!("Document store opened at {}", path.display());
        Self::from_connection(db, cipher)
    }

    pub fn in_memory(cipher: FieldCipher) -> StoryResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, cipher)
    }

    fn from_connection(db: Connection, cipher: FieldCipher) -> StoryResult<Self> {
        db.execute_batch("PRAGMA foreign_keys = ON;")?;
        for statement in SCHEMA {
            db.execute(statement, [])?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            cipher,
        })
    }

    /// Shared handle for components that keep their tables in the same
    /// database file, such as the task queue.
    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }
}

/// In-memory store with a fixed key for tests.
#[cfg(test)]
pub fn test_store() -> DocumentStore {
    DocumentStore::in_memory(FieldCipher::from_key(&[42u8; 32])).expect("open test store")
}
