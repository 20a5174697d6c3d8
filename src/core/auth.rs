use std::sync::Arc;

use crate::core::error::{StoryError, StoryResult};
use crate::core::store::{DocumentStore, MemberRole};

/// Admin level at or above which a caller may manage any task or project.
pub const ADMIN_LEVEL: u8 = 2;

/// Identity handed in by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub admin_level: u8,
    pub api_key: Option<String>,
}

impl Caller {
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            admin_level: 0,
            api_key: None,
        }
    }

    pub fn admin(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            admin_level: ADMIN_LEVEL,
            api_key: None,
        }
    }

    /// Local operator running CLI commands.
    pub fn operator() -> Self {
        Self::admin("operator")
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.admin_level >= ADMIN_LEVEL
    }
}

#[derive(Clone)]
pub struct Authorizer {
    store: Arc<DocumentStore>,
}

impl Authorizer {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Task administration needs an admin level or a valid API key.
    pub async fn require_task_admin(&self, caller: &Caller) -> StoryResult<()> {
        if caller.is_admin() {
            return Ok(());
        }
        if let Some(key) = caller.api_key.as_deref()
            && self.store.validate_api_key(key).await?
        {
            return Ok(());
        }
        Err(StoryError::NotAuthorized(format!(
            "{} lacks admin level or API key",
            caller.user_id
        )))
    }

    /// Membership check. Admins pass as owners. A missing project is
    /// `NotFound`, not a denial.
    pub async fn require_member(&self, caller: &Caller, project_id: &str) -> StoryResult<MemberRole> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(StoryError::not_found("project", project_id));
        }
        if caller.is_admin() {
            return Ok(MemberRole::Owner);
        }
        self.store
            .member_role(project_id, &caller.user_id)
            .await?
            .ok_or_else(|| {
                StoryError::NotAuthorized(format!(
                    "{} is not a member of project {}",
                    caller.user_id, project_id
                ))
            })
    }

    pub async fn require_owner(&self, caller: &Caller, project_id: &str) -> StoryResult<()> {
        match self.require_member(caller, project_id).await? {
            MemberRole::Owner => Ok(()),
            MemberRole::Member => Err(StoryError::NotAuthorized(format!(
                "{} is not an owner of project {}",
                caller.user_id, project_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    #[tokio::test]
    async fn task_admin_accepts_admin_level_or_api_key() {
        let store = Arc::new(test_store());
        let auth = Authorizer::new(store.clone());
        assert!(auth.require_task_admin(&Caller::admin("root")).await.is_ok());

        let plain = Caller::user("alice");
        assert!(matches!(
            auth.require_task_admin(&plain).await,
            Err(StoryError::NotAuthorized(_))
        ));

        let (key, _) = store.create_api_key("ci").await.unwrap();
        assert!(auth.require_task_admin(&plain.clone().with_api_key(&key)).await.is_ok());
        assert!(
            auth.require_task_admin(&plain.with_api_key("sfk_forged"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn membership_gates_project_access() {
        let store = Arc::new(test_store());
        let auth = Authorizer::new(store.clone());
        let project = store.insert_project("Untitled", "alice").await.unwrap();
        store
            .upsert_member(&project.id, "bob", MemberRole::Member)
            .await
            .unwrap();

        assert_eq!(
            auth.require_member(&Caller::user("alice"), &project.id).await.unwrap(),
            MemberRole::Owner
        );
        assert!(auth.require_owner(&Caller::user("bob"), &project.id).await.is_err());
        assert!(matches!(
            auth.require_member(&Caller::user("mallory"), &project.id).await,
            Err(StoryError::NotAuthorized(_))
        ));
        assert!(
            auth.require_member(&Caller::user("alice"), "missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
