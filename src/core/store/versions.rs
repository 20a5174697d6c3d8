use rusqlite::{OptionalExtension, Row, params};

use super::DocumentStore;
use crate::core::documents::{ChainScope, DocumentKind, DocumentVersion, VersionDraft, VersionType};
use crate::core::error::{StoryError, StoryResult};

const VERSION_COLUMNS: &str = "id, kind, project_id, scene_key, scene_text_id, version_number, \
     version_type, version_label, llm_model, text_seed, text_notes, text_content, created_by, created_at";

const SCOPE_FILTER: &str = "kind = ?1 AND project_id = ?2 AND scene_key = ?3";

// Latest-first ordering; ties on number fall back to creation time, then insert order.
const LATEST_ORDER: &str = "version_number DESC, created_at DESC, rowid DESC";

/// A row as stored, with text fields still encrypted.
struct StoredVersion {
    id: String,
    kind: String,
    project_id: String,
    scene_key: String,
    scene_text_id: Option<String>,
    version_number: i64,
    version_type: String,
    version_label: Option<String>,
    llm_model: Option<String>,
    text_seed: Option<String>,
    text_notes: Option<String>,
    text_content: Option<String>,
    created_by: String,
    created_at: String,
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredVersion> {
    Ok(StoredVersion {
        id: row.get(0)?,
        kind: row.get(1)?,
        project_id: row.get(2)?,
        scene_key: row.get(3)?,
        scene_text_id: row.get(4)?,
        version_number: row.get(5)?,
        version_type: row.get(6)?,
        version_label: row.get(7)?,
        llm_model: row.get(8)?,
        text_seed: row.get(9)?,
        text_notes: row.get(10)?,
        text_content: row.get(11)?,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
    })
}

impl DocumentStore {
    fn decode_version(&self, stored: StoredVersion) -> StoryResult<DocumentVersion> {
        let kind = DocumentKind::from_name(&stored.kind).ok_or_else(|| {
            StoryError::Validation(format!("unknown document kind in store: {}", stored.kind))
        })?;
        let version_type = VersionType::from_name(&stored.version_type).ok_or_else(|| {
            StoryError::Validation(format!("unknown version type in store: {}", stored.version_type))
        })?;
        Ok(DocumentVersion {
            id: stored.id,
            kind,
            project_id: stored.project_id,
            scene_key: if stored.scene_key.is_empty() {
                None
            } else {
                Some(stored.scene_key)
            },
            scene_text_id: stored.scene_text_id,
            version_number: stored.version_number,
            version_type,
            version_label: stored.version_label,
            llm_model: stored.llm_model,
            text_seed: self.cipher.decrypt_opt(stored.text_seed)?,
            text_notes: self.cipher.decrypt_opt(stored.text_notes)?,
            text_content: self.cipher.decrypt_opt(stored.text_content)?,
            created_by: stored.created_by,
            created_at: stored.created_at,
        })
    }

    /// Create version 1 (`base`) of an empty chain.
    pub async fn init_chain(
        &self,
        scope: &ChainScope,
        user: &str,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        scope.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let text_seed = self.cipher.encrypt_opt(draft.text_seed.as_deref())?;
        let text_notes = self.cipher.encrypt_opt(draft.text_notes.as_deref())?;
        let text_content = self.cipher.encrypt_opt(draft.text_content.as_deref())?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let existing: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM document_versions WHERE {}", SCOPE_FILTER),
            params![scope.kind.as_str(), scope.project_id, scope.scene_key_column()],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(StoryError::Validation(format!(
                "{} chain already initialized",
                scope.cache_tag()
            )));
        }
        tx.execute(
            "INSERT INTO document_versions
             (id, kind, project_id, scene_key, scene_text_id, version_number, version_type,
              version_label, llm_model, text_seed, text_notes, text_content, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 'base', ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                scope.kind.as_str(),
                scope.project_id,
                scope.scene_key_column(),
                draft.scene_text_id,
                draft.version_label,
                draft.llm_model,
                text_seed,
                text_notes,
                text_content,
                user
            ],
        )?;
        let stored = tx.query_row(
            &format!("SELECT {} FROM document_versions WHERE id = ?1", VERSION_COLUMNS),
            params![id],
            stored_from_row,
        )?;
        tx.commit()?;
        drop(db);
        self.decode_version(stored)
    }

    /// Append a version after `source`, numbered one past the scope maximum.
    /// The number is computed and inserted inside one transaction under the
    /// connection lock, so concurrent appends never share a number.
    pub async fn append_version(
        &self,
        source: &DocumentVersion,
        user: &str,
        version_type: VersionType,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        let scope = source.scope();
        let id = uuid::Uuid::new_v4().to_string();
        let text_seed = draft.text_seed.or_else(|| source.text_seed.clone());
        let text_notes = draft.text_notes.or_else(|| source.text_notes.clone());
        let text_content = draft.text_content.or_else(|| source.text_content.clone());
        let scene_text_id = draft.scene_text_id.or_else(|| source.scene_text_id.clone());
        let text_seed = self.cipher.encrypt_opt(text_seed.as_deref())?;
        let text_notes = self.cipher.encrypt_opt(text_notes.as_deref())?;
        let text_content = self.cipher.encrypt_opt(text_content.as_deref())?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let source_exists: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM document_versions WHERE id = ?4 AND {}",
                SCOPE_FILTER
            ),
            params![
                scope.kind.as_str(),
                scope.project_id,
                scope.scene_key_column(),
                source.id
            ],
            |row| row.get(0),
        )?;
        if source_exists == 0 {
            return Err(StoryError::not_found("document version", source.id.clone()));
        }
        let next: i64 = tx.query_row(
            &format!(
                "SELECT COALESCE(MAX(version_number), 0) + 1 FROM document_versions WHERE {}",
                SCOPE_FILTER
            ),
            params![scope.kind.as_str(), scope.project_id, scope.scene_key_column()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO document_versions
             (id, kind, project_id, scene_key, scene_text_id, version_number, version_type,
              version_label, llm_model, text_seed, text_notes, text_content, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                scope.kind.as_str(),
                scope.project_id,
                scope.scene_key_column(),
                scene_text_id,
                next,
                version_type.as_str(),
                draft.version_label,
                draft.llm_model,
                text_seed,
                text_notes,
                text_content,
                user
            ],
        )?;
        let stored = tx.query_row(
            &format!("SELECT {} FROM document_versions WHERE id = ?1", VERSION_COLUMNS),
            params![id],
            stored_from_row,
        )?;
        tx.commit()?;
        drop(db);
        self.decode_version(stored)
    }

    pub async fn get_version(&self, id: &str) -> StoryResult<Option<DocumentVersion>> {
        let db = self.db.lock().await;
        let stored = db
            .query_row(
                &format!("SELECT {} FROM document_versions WHERE id = ?1", VERSION_COLUMNS),
                params![id],
                stored_from_row,
            )
            .optional()?;
        drop(db);
        stored.map(|s| self.decode_version(s)).transpose()
    }

    pub async fn get_version_by_number(
        &self,
        scope: &ChainScope,
        version_number: i64,
    ) -> StoryResult<Option<DocumentVersion>> {
        let db = self.db.lock().await;
        let stored = db
            .query_row(
                &format!(
                    "SELECT {} FROM document_versions WHERE {} AND version_number = ?4
                     ORDER BY {} LIMIT 1",
                    VERSION_COLUMNS, SCOPE_FILTER, LATEST_ORDER
                ),
                params![
                    scope.kind.as_str(),
                    scope.project_id,
                    scope.scene_key_column(),
                    version_number
                ],
                stored_from_row,
            )
            .optional()?;
        drop(db);
        stored.map(|s| self.decode_version(s)).transpose()
    }

    /// All versions of a chain, `version_number` ascending.
    pub async fn list_versions(&self, scope: &ChainScope) -> StoryResult<Vec<DocumentVersion>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM document_versions WHERE {}
             ORDER BY version_number ASC, created_at ASC, rowid ASC",
            VERSION_COLUMNS, SCOPE_FILTER
        ))?;
        let rows = stmt.query_map(
            params![scope.kind.as_str(), scope.project_id, scope.scene_key_column()],
            stored_from_row,
        )?;
        let mut stored = Vec::new();
        for row in rows {
            stored.push(row?);
        }
        drop(stmt);
        drop(db);
        stored.into_iter().map(|s| self.decode_version(s)).collect()
    }

    /// Fingerprint of a chain's rows (ids, numbers and labels) that changes
    /// on every append, rebase and label edit. Reads no encrypted text.
    pub async fn scope_stamp(&self, scope: &ChainScope) -> StoryResult<String> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT id, version_number, COALESCE(version_label, '') FROM document_versions
             WHERE {} ORDER BY version_number ASC, rowid ASC",
            SCOPE_FILTER
        ))?;
        let rows = stmt.query_map(
            params![scope.kind.as_str(), scope.project_id, scope.scene_key_column()],
            |row| {
                Ok(format!(
                    "{}:{}:{}",
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?
                ))
            },
        )?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(row?);
        }
        Ok(parts.join(","))
    }

    pub async fn latest_version(&self, scope: &ChainScope) -> StoryResult<Option<DocumentVersion>> {
        let db = self.db.lock().await;
        let stored = db
            .query_row(
                &format!(
                    "SELECT {} FROM document_versions WHERE {} ORDER BY {} LIMIT 1",
                    VERSION_COLUMNS, SCOPE_FILTER, LATEST_ORDER
                ),
                params![scope.kind.as_str(), scope.project_id, scope.scene_key_column()],
                stored_from_row,
            )
            .optional()?;
        drop(db);
        stored.map(|s| self.decode_version(s)).transpose()
    }

    /// Delete every version except `target_number`, then renumber the target
    /// to 1 and retype it `base`. Irreversible.
    pub async fn rebase_chain(
        &self,
        scope: &ChainScope,
        target_number: i64,
    ) -> StoryResult<(DocumentVersion, usize)> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let target_id: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT id FROM document_versions WHERE {} AND version_number = ?4
                     ORDER BY {} LIMIT 1",
                    SCOPE_FILTER, LATEST_ORDER
                ),
                params![
                    scope.kind.as_str(),
                    scope.project_id,
                    scope.scene_key_column(),
                    target_number
                ],
                |row| row.get(0),
            )
            .optional()?;
        let Some(target_id) = target_id else {
            return Err(StoryError::not_found(
                "document version",
                format!("{} #{}", scope.cache_tag(), target_number),
            ));
        };
        let removed = tx.execute(
            &format!("DELETE FROM document_versions WHERE {} AND id != ?4", SCOPE_FILTER),
            params![
                scope.kind.as_str(),
                scope.project_id,
                scope.scene_key_column(),
                target_id
            ],
        )?;
        tx.execute(
            "UPDATE document_versions SET version_number = 1, version_type = 'base' WHERE id = ?1",
            params![target_id],
        )?;
        let stored = tx.query_row(
            &format!("SELECT {} FROM document_versions WHERE id = ?1", VERSION_COLUMNS),
            params![target_id],
            stored_from_row,
        )?;
        tx.commit()?;
        drop(db);
        Ok((self.decode_version(stored)?, removed))
    }

    /// In-place label edit; the only mutation that does not append.
    pub async fn set_version_label(
        &self,
        scope: &ChainScope,
        version_number: i64,
        label: Option<&str>,
    ) -> StoryResult<DocumentVersion> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE document_versions SET version_label = ?5 WHERE {} AND version_number = ?4",
                SCOPE_FILTER
            ),
            params![
                scope.kind.as_str(),
                scope.project_id,
                scope.scene_key_column(),
                version_number,
                label
            ],
        )?;
        drop(db);
        if rows == 0 {
            return Err(StoryError::not_found(
                "document version",
                format!("{} #{}", scope.cache_tag(), version_number),
            ));
        }
        self.get_version_by_number(scope, version_number)
            .await?
            .ok_or_else(|| {
                StoryError::not_found(
                    "document version",
                    format!("{} #{}", scope.cache_tag(), version_number),
                )
            })
    }

    /// Distinct scene keys that have a scene text chain in the project.
    pub async fn list_scene_keys(&self, project_id: &str) -> StoryResult<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT scene_key FROM document_versions
             WHERE project_id = ?1 AND kind = 'scene_text'
             GROUP BY scene_key ORDER BY MIN(rowid) ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    fn story(project: &str) -> ChainScope {
        ChainScope::story(project)
    }

    #[tokio::test]
    async fn init_creates_base_version_one() {
        let store = test_store();
        let v1 = store
            .init_chain(&story("p1"), "alice", VersionDraft::content("draft"))
            .await
            .unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v1.version_type, VersionType::Base);
        assert_eq!(v1.text_content.as_deref(), Some("draft"));
        assert_eq!(v1.scene_key, None);
    }

    #[tokio::test]
    async fn init_twice_is_rejected() {
        let store = test_store();
        store
            .init_chain(&story("p1"), "alice", VersionDraft::default())
            .await
            .unwrap();
        let err = store
            .init_chain(&story("p1"), "alice", VersionDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::Validation(_)));
    }

    #[tokio::test]
    async fn text_is_encrypted_at_rest() {
        let store = test_store();
        let v1 = store
            .init_chain(&story("p1"), "alice", VersionDraft::content("the secret plot"))
            .await
            .unwrap();
        let db = store.get_db();
        let raw: String = db
            .lock()
            .await
            .query_row(
                "SELECT text_content FROM document_versions WHERE id = ?1",
                params![v1.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("secret"));
    }

    #[tokio::test]
    async fn append_copies_unspecified_fields() {
        let store = test_store();
        let v1 = store
            .init_chain(
                &story("p1"),
                "alice",
                VersionDraft {
                    text_seed: Some("a heist".into()),
                    text_content: Some("v1 text".into()),
                    ..VersionDraft::default()
                },
            )
            .await
            .unwrap();
        let v2 = store
            .append_version(
                &v1,
                "bob",
                VersionType::Notes,
                VersionDraft {
                    text_notes: Some("more tension".into()),
                    ..VersionDraft::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(v2.version_number, 2);
        assert_eq!(v2.version_type, VersionType::Notes);
        assert_eq!(v2.text_seed.as_deref(), Some("a heist"));
        assert_eq!(v2.text_content.as_deref(), Some("v1 text"));
        assert_eq!(v2.text_notes.as_deref(), Some("more tension"));
        assert_eq!(v2.created_by, "bob");
    }

    #[tokio::test]
    async fn scopes_number_independently() {
        let store = test_store();
        let scene_a = ChainScope::scene(DocumentKind::SceneText, "p1", "scene-a");
        let scene_b = ChainScope::scene(DocumentKind::SceneText, "p1", "scene-b");
        let a1 = store
            .init_chain(&scene_a, "u", VersionDraft::default())
            .await
            .unwrap();
        store
            .init_chain(&scene_b, "u", VersionDraft::default())
            .await
            .unwrap();
        store
            .append_version(&a1, "u", VersionType::Edit, VersionDraft::default())
            .await
            .unwrap();
        let b_latest = store.latest_version(&scene_b).await.unwrap().unwrap();
        assert_eq!(b_latest.version_number, 1);
        let a_latest = store.latest_version(&scene_a).await.unwrap().unwrap();
        assert_eq!(a_latest.version_number, 2);
        assert_eq!(
            store.list_scene_keys("p1").await.unwrap(),
            vec!["scene-a".to_string(), "scene-b".to_string()]
        );
    }

    #[tokio::test]
    async fn rebase_keeps_only_target_as_base_one() {
        let store = test_store();
        let mut latest = store
            .init_chain(&story("p1"), "u", VersionDraft::content("v1"))
            .await
            .unwrap();
        for i in 2..=5 {
            latest = store
                .append_version(
                    &latest,
                    "u",
                    VersionType::Edit,
                    VersionDraft::content(format!("v{}", i)),
                )
                .await
                .unwrap();
        }
        let (base, removed) = store.rebase_chain(&story("p1"), 3).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(base.version_number, 1);
        assert_eq!(base.version_type, VersionType::Base);
        assert_eq!(base.text_content.as_deref(), Some("v3"));
        let all = store.list_versions(&story("p1")).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn rebase_missing_target_is_not_found_and_harmless() {
        let store = test_store();
        store
            .init_chain(&story("p1"), "u", VersionDraft::default())
            .await
            .unwrap();
        let err = store.rebase_chain(&story("p1"), 9).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.list_versions(&story("p1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_from_rebased_away_source_fails() {
        let store = test_store();
        let v1 = store
            .init_chain(&story("p1"), "u", VersionDraft::default())
            .await
            .unwrap();
        let v2 = store
            .append_version(&v1, "u", VersionType::Edit, VersionDraft::default())
            .await
            .unwrap();
        store.rebase_chain(&story("p1"), 2).await.unwrap();
        let err = store
            .append_version(&v1, "u", VersionType::Edit, VersionDraft::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let survivor = store.get_version(&v2.id).await.unwrap().unwrap();
        assert_eq!(survivor.version_number, 1);
    }

    #[tokio::test]
    async fn label_edit_is_in_place() {
        let store = test_store();
        store
            .init_chain(&story("p1"), "u", VersionDraft::default())
            .await
            .unwrap();
        let labelled = store
            .set_version_label(&story("p1"), 1, Some("first draft"))
            .await
            .unwrap();
        assert_eq!(labelled.version_label.as_deref(), Some("first draft"));
        assert_eq!(store.list_versions(&story("p1")).await.unwrap().len(), 1);
        assert!(
            store
                .set_version_label(&story("p1"), 7, Some("nope"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
