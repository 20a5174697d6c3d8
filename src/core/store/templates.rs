use rusqlite::{OptionalExtension, params};

use super::DocumentStore;
use super::types::{PromptSlot, PromptTemplate};
use crate::core::error::{StoryError, StoryResult};

impl DocumentStore {
    /// Insert or replace the template registered under `reference_key`.
    pub async fn upsert_template(&self, template: &PromptTemplate) -> StoryResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO prompt_templates (reference_key, name, prompt_text, owner) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(reference_key) DO UPDATE SET
                name = excluded.name,
                prompt_text = excluded.prompt_text,
                owner = excluded.owner,
                updated_at = CURRENT_TIMESTAMP",
            params![
                template.reference_key,
                template.name,
                template.prompt_text,
                template.owner
            ],
        )?;
        Ok(())
    }

    /// Insert only when the key is free. Returns whether a row was written.
    pub async fn insert_template_if_missing(&self, template: &PromptTemplate) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO prompt_templates (reference_key, name, prompt_text, owner)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                template.reference_key,
                template.name,
                template.prompt_text,
                template.owner
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_template_by_key(&self, reference_key: &str) -> StoryResult<Option<PromptTemplate>> {
        let db = self.db.lock().await;
        let template = db
            .query_row(
                "SELECT name, reference_key, prompt_text, owner FROM prompt_templates WHERE reference_key = ?1",
                params![reference_key],
                |row| {
                    Ok(PromptTemplate {
                        name: row.get(0)?,
                        reference_key: row.get(1)?,
                        prompt_text: row.get(2)?,
                        owner: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    pub async fn list_templates(&self) -> StoryResult<Vec<PromptTemplate>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT name, reference_key, prompt_text, owner FROM prompt_templates ORDER BY reference_key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PromptTemplate {
                name: row.get(0)?,
                reference_key: row.get(1)?,
                prompt_text: row.get(2)?,
                owner: row.get(3)?,
            })
        })?;
        let mut templates = Vec::new();
        for row in rows {
            templates.push(row?);
        }
        Ok(templates)
    }

    pub async fn delete_template(&self, reference_key: &str) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM prompt_templates WHERE reference_key = ?1",
            params![reference_key],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_prompt_slot(&self, slot: &str) -> StoryResult<Option<PromptSlot>> {
        let db = self.db.lock().await;
        let value: Option<String> = db
            .query_row(
                "SELECT value_json FROM platform_settings WHERE key = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()?;
        drop(db);
        value
            .map(|json| serde_json::from_str::<PromptSlot>(&json).map_err(StoryError::from))
            .transpose()
    }

    pub async fn set_prompt_slot(&self, slot: &str, value: &PromptSlot) -> StoryResult<()> {
        let json = serde_json::to_string(value)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO platform_settings (key, value_json) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = CURRENT_TIMESTAMP",
            params![slot, json],
        )?;
        Ok(())
    }

    pub async fn set_prompt_slot_if_missing(&self, slot: &str, value: &PromptSlot) -> StoryResult<bool> {
        let json = serde_json::to_string(value)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO platform_settings (key, value_json) VALUES (?1, ?2)",
            params![slot, json],
        )?;
        Ok(rows > 0)
    }
}
