use std::sync::Arc;

use tracing::info;

use super::types::{ChainScope, DocumentVersion, VersionDraft, VersionType};
use crate::core::cache::{self, Cache};
use crate::core::error::{StoryError, StoryResult};
use crate::core::events::{DomainEvent, EventSink};
use crate::core::store::DocumentStore;

/// Append-only version history for one document kind per scope.
#[derive(Clone)]
pub struct VersionChain {
    store: Arc<DocumentStore>,
    cache: Arc<dyn Cache>,
    events: Arc<dyn EventSink>,
}

impl VersionChain {
    pub fn new(store: Arc<DocumentStore>, cache: Arc<dyn Cache>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            cache,
            events,
        }
    }

    fn invalidate(&self, scope: &ChainScope) {
        self.cache
            .invalidate_tags(&[scope.cache_tag(), cache::project_tag(&scope.project_id)]);
    }

    fn created(&self, version: &DocumentVersion) {
        self.invalidate(&version.scope());
        self.events.emit(DomainEvent::VersionCreated {
            project_id: version.project_id.clone(),
            kind: version.kind,
            scene_key: version.scene_key.clone(),
            version_id: version.id.clone(),
            version_number: version.version_number,
        });
    }

    /// Version 1, typed `base`. Called once when the owning project or scene
    /// is created.
    pub async fn init(
        &self,
        scope: &ChainScope,
        user: &str,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        let version = self.store.init_chain(scope, user, draft).await?;
        self.created(&version);
        Ok(version)
    }

    /// The single mutation primitive: copy `source`, override what the draft
    /// supplies, number it one past the scope maximum.
    pub async fn create_new_version(
        &self,
        source: &DocumentVersion,
        user: &str,
        version_type: VersionType,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        if version_type == VersionType::Base {
            return Err(StoryError::Validation(
                "base versions only come from init or rebase".to_string(),
            ));
        }
        let version = self
            .store
            .append_version(source, user, version_type, draft)
            .await?;
        self.created(&version);
        Ok(version)
    }

    /// "Update" is an `edit` appended on top of the latest version.
    pub async fn update(
        &self,
        scope: &ChainScope,
        user: &str,
        draft: VersionDraft,
    ) -> StoryResult<DocumentVersion> {
        let latest = self.get_latest(scope).await?;
        self.create_new_version(&latest, user, VersionType::Edit, draft)
            .await
    }

    pub async fn list_versions(&self, scope: &ChainScope) -> StoryResult<Vec<DocumentVersion>> {
        scope.validate()?;
        let key = format!("versions:{}", scope.cache_tag());
        let stamp = self.store.scope_stamp(scope).await?;
        if let Some(versions) =
            cache::get_stamped::<Vec<DocumentVersion>>(self.cache.as_ref(), &key, &stamp)
        {
            return Ok(versions);
        }
        let versions = self.store.list_versions(scope).await?;
        cache::set_stamped(
            self.cache.as_ref(),
            &key,
            &stamp,
            &versions,
            &[scope.cache_tag(), cache::project_tag(&scope.project_id)],
        );
        Ok(versions)
    }

    pub async fn get_latest(&self, scope: &ChainScope) -> StoryResult<DocumentVersion> {
        scope.validate()?;
        self.store
            .latest_version(scope)
            .await?
            .ok_or_else(|| StoryError::not_found("document chain", scope.cache_tag()))
    }

    pub async fn get_version(
        &self,
        scope: &ChainScope,
        version_number: i64,
    ) -> StoryResult<DocumentVersion> {
        scope.validate()?;
        self.store
            .get_version_by_number(scope, version_number)
            .await?
            .ok_or_else(|| {
                StoryError::not_found(
                    "document version",
                    format!("{} #{}", scope.cache_tag(), version_number),
                )
            })
    }

    /// Collapse the chain onto `target_number`, which becomes version 1,
    /// typed `base`. Every other version is deleted.
    pub async fn rebase(&self, scope: &ChainScope, target_number: i64) -> StoryResult<DocumentVersion> {
        scope.validate()?;
        let (version, removed) = self.store.rebase_chain(scope, target_number).await?;
        info!(
            "Rebased {} onto former version {} ({} removed)",
            scope.cache_tag(),
            target_number,
            removed
        );
        self.invalidate(scope);
        self.events.emit(DomainEvent::ChainRebased {
            project_id: scope.project_id.clone(),
            kind: scope.kind,
            scene_key: scope.scene_key.clone(),
            version_id: version.id.clone(),
            removed,
        });
        Ok(version)
    }

    /// Change only the label, in place.
    pub async fn update_version_label(
        &self,
        scope: &ChainScope,
        version_number: i64,
        label: Option<&str>,
    ) -> StoryResult<DocumentVersion> {
        scope.validate()?;
        let version = self
            .store
            .set_version_label(scope, version_number, label)
            .await?;
        self.invalidate(scope);
        self.events.emit(DomainEvent::LabelUpdated {
            project_id: scope.project_id.clone(),
            kind: scope.kind,
            version_id: version.id.clone(),
        });
        Ok(version)
    }

    /// Source for a task result: the version the task was created against,
    /// or the latest one when that version has since been rebased away.
    pub async fn resolve_source(
        &self,
        scope: &ChainScope,
        version_id: &str,
    ) -> StoryResult<DocumentVersion> {
        if let Some(version) = self.store.get_version(version_id).await?
            && version.scope() == *scope
        {
            return Ok(version);
        }
        self.get_latest(scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{MemoryCache, NoCache};
    use crate::core::documents::DocumentKind;
    use crate::core::events::NullSink;
    use crate::core::store::test_store;

    fn chain() -> VersionChain {
        VersionChain::new(Arc::new(test_store()), Arc::new(MemoryCache::new()), Arc::new(NullSink))
    }

    #[tokio::test]
    async fn three_edits_then_rebase_to_three() {
        let chain = chain();
        let scope = ChainScope::story("p1");
        chain
            .init(&scope, "alice", VersionDraft::content("v1"))
            .await
            .unwrap();
        for text in ["v2", "v3", "v4"] {
            chain
                .update(&scope, "alice", VersionDraft::content(text))
                .await
                .unwrap();
        }
        let versions = chain.list_versions(&scope).await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(versions[1..].iter().all(|v| v.version_type == VersionType::Edit));

        let base = chain.rebase(&scope, 3).await.unwrap();
        assert_eq!(base.text_content.as_deref(), Some("v3"));
        let versions = chain.list_versions(&scope).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_number, 1);
        assert_eq!(versions[0].version_type, VersionType::Base);
    }

    #[tokio::test]
    async fn cached_list_is_invalidated_by_appends() {
        let chain = chain();
        let scope = ChainScope::scene(DocumentKind::SceneText, "p1", "s1");
        chain.init(&scope, "alice", VersionDraft::default()).await.unwrap();
        assert_eq!(chain.list_versions(&scope).await.unwrap().len(), 1);
        chain
            .update(&scope, "alice", VersionDraft::content("draft"))
            .await
            .unwrap();
        assert_eq!(chain.list_versions(&scope).await.unwrap().len(), 2);
        chain
            .update_version_label(&scope, 2, Some("first pass"))
            .await
            .unwrap();
        let listed = chain.list_versions(&scope).await.unwrap();
        assert_eq!(listed[1].version_label.as_deref(), Some("first pass"));
    }

    #[tokio::test]
    async fn base_type_cannot_be_appended() {
        let chain = chain();
        let scope = ChainScope::story("p1");
        let v1 = chain.init(&scope, "alice", VersionDraft::default()).await.unwrap();
        let err = chain
            .create_new_version(&v1, "alice", VersionType::Base, VersionDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::Validation(_)));
    }

    #[tokio::test]
    async fn scope_shape_is_validated() {
        let chain = chain();
        let bad = ChainScope {
            kind: DocumentKind::BeatSheet,
            project_id: "p1".to_string(),
            scene_key: None,
        };
        assert!(matches!(
            chain.list_versions(&bad).await,
            Err(StoryError::Validation(_))
        ));
        assert!(chain.get_latest(&ChainScope::story("p1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resolve_source_falls_back_to_latest_after_rebase() {
        let chain = VersionChain::new(Arc::new(test_store()), Arc::new(NoCache), Arc::new(NullSink));
        let scope = ChainScope::story("p1");
        let v1 = chain.init(&scope, "alice", VersionDraft::content("a")).await.unwrap();
        chain.update(&scope, "alice", VersionDraft::content("b")).await.unwrap();
        assert_eq!(chain.resolve_source(&scope, &v1.id).await.unwrap().id, v1.id);

        chain.rebase(&scope, 2).await.unwrap();
        let source = chain.resolve_source(&scope, &v1.id).await.unwrap();
        assert_eq!(source.text_content.as_deref(), Some("b"));
        assert_eq!(source.version_number, 1);
    }
}
