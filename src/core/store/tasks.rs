use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, Row, params};

use super::DocumentStore;
use crate::core::error::{StoryError, StoryResult};
use crate::core::tasks::{AgentTask, DocumentType, PromptData, TaskStatus, TaskUsage};

const TASK_COLUMNS: &str = "id, project_id, document_type, document_id, llm_model, max_input_tokens, \
     max_output_tokens, temperature, system_role, prompt_text, status, status_message, input_tokens_used, \
     output_tokens_used, process_time_ms, agent_results, agent_id, errors, processing_at, metadata_json, \
     created_at, updated_at";

const NOW: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

struct StoredTask {
    id: String,
    project_id: String,
    document_type: String,
    document_id: String,
    llm_model: String,
    max_input_tokens: i64,
    max_output_tokens: i64,
    temperature: f64,
    system_role: String,
    prompt_text: String,
    status: String,
    status_message: Option<String>,
    input_tokens_used: Option<i64>,
    output_tokens_used: Option<i64>,
    process_time_ms: Option<i64>,
    agent_results: Option<String>,
    agent_id: Option<String>,
    errors: Option<String>,
    processing_at: Option<String>,
    metadata_json: String,
    created_at: String,
    updated_at: String,
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredTask> {
    Ok(StoredTask {
        id: row.get(0)?,
        project_id: row.get(1)?,
        document_type: row.get(2)?,
        document_id: row.get(3)?,
        llm_model: row.get(4)?,
        max_input_tokens: row.get(5)?,
        max_output_tokens: row.get(6)?,
        temperature: row.get(7)?,
        system_role: row.get(8)?,
        prompt_text: row.get(9)?,
        status: row.get(10)?,
        status_message: row.get(11)?,
        input_tokens_used: row.get(12)?,
        output_tokens_used: row.get(13)?,
        process_time_ms: row.get(14)?,
        agent_results: row.get(15)?,
        agent_id: row.get(16)?,
        errors: row.get(17)?,
        processing_at: row.get(18)?,
        metadata_json: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

/// Optional filters for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<String>,
    pub limit: Option<usize>,
}

impl DocumentStore {
    fn decode_task(&self, stored: StoredTask) -> StoryResult<AgentTask> {
        let document_type = DocumentType::from_name(&stored.document_type).ok_or_else(|| {
            StoryError::Validation(format!("unknown document type in store: {}", stored.document_type))
        })?;
        let status = TaskStatus::from_status(&stored.status).ok_or_else(|| {
            StoryError::Validation(format!("unknown task status in store: {}", stored.status))
        })?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&stored.metadata_json)?;
        Ok(AgentTask {
            id: stored.id,
            project_id: stored.project_id,
            document_type,
            document_id: stored.document_id,
            llm_model: stored.llm_model,
            max_input_tokens: stored.max_input_tokens,
            max_output_tokens: stored.max_output_tokens,
            temperature: stored.temperature,
            system_role: self.cipher.decrypt(&stored.system_role)?,
            prompt_text: self.cipher.decrypt(&stored.prompt_text)?,
            status,
            status_message: stored.status_message,
            input_tokens_used: stored.input_tokens_used,
            output_tokens_used: stored.output_tokens_used,
            process_time_ms: stored.process_time_ms,
            agent_results: self.cipher.decrypt_opt(stored.agent_results)?,
            agent_id: stored.agent_id,
            errors: stored.errors,
            processing_at: stored.processing_at,
            metadata,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }

    pub async fn insert_task(
        &self,
        project_id: &str,
        document_type: DocumentType,
        document_id: &str,
        prompt: &PromptData,
        metadata: &BTreeMap<String, String>,
    ) -> StoryResult<AgentTask> {
        let id = uuid::Uuid::new_v4().to_string();
        let system_role = self.cipher.encrypt(&prompt.system_role)?;
        let prompt_text = self.cipher.encrypt(&prompt.prompt_text)?;
        let metadata_json = serde_json::to_string(metadata)?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_tasks
             (id, project_id, document_type, document_id, llm_model, max_input_tokens, max_output_tokens,
              temperature, system_role, prompt_text, status, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11)",
            params![
                id,
                project_id,
                document_type.as_str(),
                document_id,
                prompt.model,
                prompt.max_input_tokens,
                prompt.max_output_tokens,
                prompt.temperature,
                system_role,
                prompt_text,
                metadata_json
            ],
        )?;
        let stored = db.query_row(
            &format!("SELECT {} FROM agent_tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            stored_from_row,
        )?;
        drop(db);
        self.decode_task(stored)
    }

    pub async fn get_task(&self, id: &str) -> StoryResult<Option<AgentTask>> {
        let db = self.db.lock().await;
        let stored = db
            .query_row(
                &format!("SELECT {} FROM agent_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                stored_from_row,
            )
            .optional()?;
        drop(db);
        stored.map(|s| self.decode_task(s)).transpose()
    }

    /// `status|updated_at` of a task row, read without decrypting anything.
    /// Every status write bumps it, whichever process made the write.
    pub async fn task_stamp(&self, id: &str) -> StoryResult<Option<String>> {
        let db = self.db.lock().await;
        let stamp = db
            .query_row(
                "SELECT status || '|' || updated_at FROM agent_tasks WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(stamp)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> StoryResult<Vec<AgentTask>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agent_tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR project_id = ?2)
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            TASK_COLUMNS
        ))?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![filter.status.map(|s| s.as_str()), filter.project_id, limit],
            stored_from_row,
        )?;
        let mut stored = Vec::new();
        for row in rows {
            stored.push(row?);
        }
        drop(stmt);
        drop(db);
        stored.into_iter().map(|s| self.decode_task(s)).collect()
    }

    /// Compare-and-set status change. Entering `processing` stamps
    /// `processing_at`. Returns false when the task is missing or no longer
    /// in `from`.
    pub async fn transition_task(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        status_message: Option<&str>,
    ) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = if to == TaskStatus::Processing {
            db.execute(
                &format!(
                    "UPDATE agent_tasks
                     SET status = ?1, status_message = ?2, processing_at = {now}, updated_at = {now}
                     WHERE id = ?3 AND status = ?4",
                    now = NOW
                ),
                params![to.as_str(), status_message, id, from.as_str()],
            )?
        } else {
            db.execute(
                &format!(
                    "UPDATE agent_tasks SET status = ?1, status_message = ?2, updated_at = {}
                     WHERE id = ?3 AND status = ?4",
                    NOW
                ),
                params![to.as_str(), status_message, id, from.as_str()],
            )?
        };
        Ok(rows > 0)
    }

    /// Record accounting and move `from` -> `completed`. The only write path
    /// for the usage columns.
    pub async fn complete_task(
        &self,
        id: &str,
        from: TaskStatus,
        status_message: &str,
        usage: &TaskUsage,
    ) -> StoryResult<bool> {
        let agent_results = self.cipher.encrypt(&usage.agent_results)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE agent_tasks
                 SET status = 'completed', status_message = ?1, input_tokens_used = ?2,
                     output_tokens_used = ?3, process_time_ms = ?4, agent_results = ?5,
                     agent_id = ?6, updated_at = {}
                 WHERE id = ?7 AND status = ?8",
                NOW
            ),
            params![
                status_message,
                usage.input_tokens_used,
                usage.output_tokens_used,
                usage.process_time_ms,
                agent_results,
                usage.agent_id,
                id,
                from.as_str()
            ],
        )?;
        Ok(rows > 0)
    }

    /// Move `from` -> `failed` with captured error text. `processing_at` is
    /// left untouched.
    pub async fn fail_task(
        &self,
        id: &str,
        from: TaskStatus,
        status_message: &str,
        errors: &str,
    ) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE agent_tasks
                 SET status = 'failed', status_message = ?1, errors = ?2, updated_at = {}
                 WHERE id = ?3 AND status = ?4",
                NOW
            ),
            params![status_message, errors, id, from.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Clear every result field and return the task to `pending`, whatever
    /// its current state.
    pub async fn reset_task(&self, id: &str) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE agent_tasks
                 SET status = 'pending', status_message = NULL, input_tokens_used = NULL,
                     output_tokens_used = NULL, process_time_ms = NULL, agent_results = NULL,
                     agent_id = NULL, errors = NULL, processing_at = NULL, updated_at = {}
                 WHERE id = ?1",
                NOW
            ),
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub async fn delete_task(&self, id: &str) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM agent_tasks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    fn prompt() -> PromptData {
        PromptData {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_input_tokens: 1000,
            max_output_tokens: 500,
            system_role: "You are a novelist.".to_string(),
            prompt_text: "Write chapter one.".to_string(),
        }
    }

    async fn insert(store: &DocumentStore) -> AgentTask {
        let mut metadata = BTreeMap::new();
        metadata.insert("created_by".to_string(), "alice".to_string());
        store
            .insert_task("p1", DocumentType::StoryText, "doc-1", &prompt(), &metadata)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_starts_pending_with_prompt_fields() {
        let store = test_store();
        let task = insert(&store).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.system_role, "You are a novelist.");
        assert_eq!(task.prompt_text, "Write chapter one.");
        assert_eq!(task.meta("created_by"), Some("alice"));
        assert!(task.input_tokens_used.is_none());
        assert!(task.processing_at.is_none());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = test_store();
        let task = insert(&store).await;
        assert!(
            store
                .transition_task(&task.id, TaskStatus::Pending, TaskStatus::Processing, Some("go"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_task(&task.id, TaskStatus::Pending, TaskStatus::Processing, Some("go"))
                .await
                .unwrap()
        );
        let got = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Processing);
        assert!(got.processing_at.is_some());
    }

    #[tokio::test]
    async fn complete_then_reset_clears_accounting() {
        let store = test_store();
        let task = insert(&store).await;
        store
            .transition_task(&task.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .await
            .unwrap();
        let usage = TaskUsage {
            input_tokens_used: 12,
            output_tokens_used: 34,
            process_time_ms: 56,
            agent_results: "Chapter one.".to_string(),
            agent_id: "worker-1".to_string(),
        };
        assert!(
            store
                .complete_task(&task.id, TaskStatus::Processing, "Completed request", &usage)
                .await
                .unwrap()
        );
        let done = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.output_tokens_used, Some(34));
        assert_eq!(done.agent_results.as_deref(), Some("Chapter one."));

        assert!(store.reset_task(&task.id).await.unwrap());
        let reset = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert!(reset.agent_results.is_none());
        assert!(reset.processing_at.is_none());
        assert!(reset.process_time_ms.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_project() {
        let store = test_store();
        let a = insert(&store).await;
        insert(&store).await;
        store
            .transition_task(&a.id, TaskStatus::Pending, TaskStatus::Processing, None)
            .await
            .unwrap();
        let pending = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let other_project = store
            .list_tasks(&TaskFilter {
                project_id: Some("p2".to_string()),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert!(other_project.is_empty());
        let limited = store
            .list_tasks(&TaskFilter {
                limit: Some(1),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_missing() {
        let store = test_store();
        let task = insert(&store).await;
        assert!(store.delete_task(&task.id).await.unwrap());
        assert!(!store.delete_task(&task.id).await.unwrap());
        assert!(store.get_task(&task.id).await.unwrap().is_none());
    }
}
