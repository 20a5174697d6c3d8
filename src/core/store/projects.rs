use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, params};

use super::DocumentStore;
use super::types::{MemberRole, ProjectMember, ProjectRecord};
use crate::core::error::{StoryError, StoryResult};

impl DocumentStore {
    /// Insert a project and its owner membership in one transaction.
    pub async fn insert_project(&self, title: &str, owner: &str) -> StoryResult<ProjectRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO projects (id, title, created_by) VALUES (?1, ?2, ?3)",
            params![id, title, owner],
        )?;
        tx.execute(
            "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![id, owner, MemberRole::Owner.as_str()],
        )?;
        tx.commit()?;
        drop(db);

        self.get_project(&id)
            .await?
            .ok_or_else(|| StoryError::not_found("project", &id))
    }

    pub async fn get_project(&self, id: &str) -> StoryResult<Option<ProjectRecord>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT id, title, metadata_json, created_by, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, title, metadata_json, created_by, created_at)) => Ok(Some(ProjectRecord {
                id,
                title,
                metadata: serde_json::from_str(&metadata_json)?,
                created_by,
                created_at,
            })),
            None => Ok(None),
        }
    }

    /// Set one metadata key. Read-modify-write runs under the connection
    /// lock so concurrent writers do not lose keys.
    pub async fn set_project_metadata(
        &self,
        project_id: &str,
        key: &str,
        value: &str,
    ) -> StoryResult<BTreeMap<String, String>> {
        let db = self.db.lock().await;
        let metadata_json: Option<String> = db
            .query_row(
                "SELECT metadata_json FROM projects WHERE id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        let metadata_json =
            metadata_json.ok_or_else(|| StoryError::not_found("project", project_id))?;

        let mut metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)?;
        metadata.insert(key.to_string(), value.to_string());
        db.execute(
            "UPDATE projects SET metadata_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, project_id],
        )?;
        Ok(metadata)
    }

    pub async fn upsert_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoryResult<ProjectMember> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role",
            params![project_id, user_id, role.as_str()],
        )?;
        Ok(ProjectMember {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            role,
        })
    }

    pub async fn remove_member(&self, project_id: &str, user_id: &str) -> StoryResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
            params![project_id, user_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn list_members(&self, project_id: &str) -> StoryResult<Vec<ProjectMember>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT project_id, user_id, role FROM project_members
             WHERE project_id = ?1 ORDER BY created_at ASC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut members = Vec::new();
        for row in rows {
            let (project_id, user_id, role) = row?;
            let role = MemberRole::from_name(&role)
                .ok_or_else(|| StoryError::Validation(format!("unknown member role: {}", role)))?;
            members.push(ProjectMember {
                project_id,
                user_id,
                role,
            });
        }
        Ok(members)
    }

    pub async fn member_role(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> StoryResult<Option<MemberRole>> {
        let db = self.db.lock().await;
        let role: Option<String> = db
            .query_row(
                "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role.as_deref().and_then(MemberRole::from_name))
    }
}
