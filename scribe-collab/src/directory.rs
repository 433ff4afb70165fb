//! Authoritative document registry and permission records.
//!
//! Stands in for the REST document/permission endpoints: every document has
//! exactly one OWNER (its creator) plus at most one READ or WRITE grant per
//! other user. [`AccessService`] fronts the directory with bearer tokens and
//! implements [`PermissionSource`] for client gates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::AccountStore;
use crate::permission::{PermissionError, PermissionRecord, PermissionSource, Role};

/// Document metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: Uuid,
    pub title: String,
    pub owner: Uuid,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

#[derive(Debug, Clone)]
struct DocumentEntry {
    info: DocumentInfo,
    grants: HashMap<Uuid, Role>,
}

impl DocumentEntry {
    fn role_of(&self, user_id: Uuid) -> Role {
        if user_id == self.info.owner {
            Role::Owner
        } else {
            self.grants.get(&user_id).copied().unwrap_or(Role::None)
        }
    }
}

#[derive(Default)]
pub struct DocumentDirectory {
    documents: RwLock<HashMap<Uuid, DocumentEntry>>,
}

impl DocumentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document owned by `owner`.
    pub async fn create(&self, owner: Uuid, title: impl Into<String>) -> DocumentInfo {
        let info = DocumentInfo {
            id: Uuid::new_v4(),
            title: title.into(),
            owner,
            created_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.documents.write().await.insert(
            info.id,
            DocumentEntry {
                info: info.clone(),
                grants: HashMap::new(),
            },
        );
        log::info!("Created document {} ({:?})", info.id, info.title);
        info
    }

    pub async fn get(&self, document_id: Uuid) -> Option<DocumentInfo> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .map(|entry| entry.info.clone())
    }

    pub async fn exists(&self, document_id: Uuid) -> bool {
        self.documents.read().await.contains_key(&document_id)
    }

    /// Documents `user_id` can at least read, oldest first.
    pub async fn list_for(&self, user_id: Uuid) -> Vec<DocumentInfo> {
        let documents = self.documents.read().await;
        let mut visible: Vec<DocumentInfo> = documents
            .values()
            .filter(|entry| entry.role_of(user_id).can_read())
            .map(|entry| entry.info.clone())
            .collect();
        visible.sort_by_key(|info| (info.created_at, info.id));
        visible
    }

    /// Delete a document. Only its owner may do so.
    pub async fn delete(&self, caller: Uuid, document_id: Uuid) -> Result<DocumentInfo, PermissionError> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get(&document_id)
            .ok_or(PermissionError::NotFound(document_id))?;
        if !entry.role_of(caller).is_owner() {
            return Err(PermissionError::Forbidden(format!(
                "only the owner can delete document {document_id}"
            )));
        }
        let removed = documents
            .remove(&document_id)
            .ok_or(PermissionError::NotFound(document_id))?;
        log::info!("Deleted document {document_id}");
        Ok(removed.info)
    }

    /// Role of `user_id` on `document_id`. Unknown documents and absent
    /// records both resolve to `None`.
    pub async fn resolve(&self, document_id: Uuid, user_id: Uuid) -> Role {
        self.documents
            .read()
            .await
            .get(&document_id)
            .map_or(Role::None, |entry| entry.role_of(user_id))
    }

    /// Upsert a READ or WRITE grant.
    pub async fn grant(
        &self,
        caller: Uuid,
        document_id: Uuid,
        target: Uuid,
        role: Role,
    ) -> Result<(), PermissionError> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get_mut(&document_id)
            .ok_or(PermissionError::NotFound(document_id))?;
        if !entry.role_of(caller).is_owner() {
            return Err(PermissionError::Forbidden(format!(
                "only the owner can grant access to document {document_id}"
            )));
        }
        if !matches!(role, Role::Read | Role::Write) {
            return Err(PermissionError::InvalidRole(role));
        }
        if target == entry.info.owner {
            return Err(PermissionError::Forbidden(
                "the owner's role cannot be changed".to_string(),
            ));
        }

        if entry.grants.insert(target, role) != Some(role) {
            log::info!("Granted {role} on document {document_id} to {target}");
        }
        Ok(())
    }

    /// Remove a grant. Idempotent when there is nothing to remove.
    pub async fn revoke(
        &self,
        caller: Uuid,
        document_id: Uuid,
        target: Uuid,
    ) -> Result<(), PermissionError> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get_mut(&document_id)
            .ok_or(PermissionError::NotFound(document_id))?;
        if target == entry.info.owner {
            return Err(PermissionError::Forbidden(
                "the owner's access cannot be revoked".to_string(),
            ));
        }
        if !entry.role_of(caller).is_owner() {
            return Err(PermissionError::Forbidden(format!(
                "only the owner can revoke access to document {document_id}"
            )));
        }

        if let Some(previous) = entry.grants.remove(&target) {
            log::info!("Revoked {previous} on document {document_id} from {target}");
        }
        Ok(())
    }

    /// All records for a document, owner first. Caller needs READ.
    pub async fn permissions(
        &self,
        caller: Uuid,
        document_id: Uuid,
    ) -> Result<Vec<PermissionRecord>, PermissionError> {
        let documents = self.documents.read().await;
        let entry = documents
            .get(&document_id)
            .ok_or(PermissionError::NotFound(document_id))?;
        if !entry.role_of(caller).can_read() {
            return Err(PermissionError::Forbidden(format!(
                "no access to document {document_id}"
            )));
        }

        let mut records = vec![PermissionRecord {
            document_id,
            user_id: entry.info.owner,
            role: Role::Owner,
        }];
        let mut grants: Vec<PermissionRecord> = entry
            .grants
            .iter()
            .map(|(user_id, role)| PermissionRecord {
                document_id,
                user_id: *user_id,
                role: *role,
            })
            .collect();
        grants.sort_by_key(|record| (std::cmp::Reverse(record.role), record.user_id));
        records.extend(grants);
        Ok(records)
    }
}

/// Token-authenticated front for the directory.
pub struct AccessService {
    accounts: Arc<AccountStore>,
    directory: Arc<DocumentDirectory>,
}

impl AccessService {
    pub fn new(accounts: Arc<AccountStore>, directory: Arc<DocumentDirectory>) -> Self {
        Self {
            accounts,
            directory,
        }
    }

    async fn caller(&self, token: &str) -> Result<Uuid, PermissionError> {
        self.accounts
            .validate(token)
            .await
            .map(|identity| identity.user_id)
            .map_err(|_| PermissionError::Unauthenticated)
    }
}

impl PermissionSource for AccessService {
    fn resolve<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'a, Result<Role, PermissionError>> {
        Box::pin(async move {
            self.caller(token).await?;
            if !self.directory.exists(document_id).await {
                return Err(PermissionError::NotFound(document_id));
            }
            Ok(self.directory.resolve(document_id, user_id).await)
        })
    }

    fn grant<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        target: Uuid,
        role: Role,
    ) -> BoxFuture<'a, Result<(), PermissionError>> {
        Box::pin(async move {
            let caller = self.caller(token).await?;
            self.directory.grant(caller, document_id, target, role).await
        })
    }

    fn revoke<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
        target: Uuid,
    ) -> BoxFuture<'a, Result<(), PermissionError>> {
        Box::pin(async move {
            let caller = self.caller(token).await?;
            self.directory.revoke(caller, document_id, target).await
        })
    }

    fn list<'a>(
        &'a self,
        token: &'a str,
        document_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<PermissionRecord>, PermissionError>> {
        Box::pin(async move {
            let caller = self.caller(token).await?;
            self.directory.permissions(caller, document_id).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creator_is_owner() {
        let dir = DocumentDirectory::new();
        let owner = Uuid::new_v4();
        let doc = dir.create(owner, "Notes").await;

        assert_eq!(dir.resolve(doc.id, owner).await, Role::Owner);
        assert_eq!(dir.resolve(doc.id, Uuid::new_v4()).await, Role::None);
        assert_eq!(dir.resolve(Uuid::new_v4(), owner).await, Role::None);
        assert_eq!(dir.get(doc.id).await.unwrap().title, "Notes");
    }

    #[tokio::test]
    async fn test_grant_is_upsert() {
        let dir = DocumentDirectory::new();
        let owner = Uuid::new_v4();
        let user = Uuid::new_v4();
        let doc = dir.create(owner, "Doc").await.id;

        dir.grant(owner, doc, user, Role::Read).await.unwrap();
        dir.grant(owner, doc, user, Role::Read).await.unwrap();
        assert_eq!(dir.resolve(doc, user).await, Role::Read);

        dir.grant(owner, doc, user, Role::Write).await.unwrap();
        assert_eq!(dir.resolve(doc, user).await, Role::Write);
        assert_eq!(dir.permissions(owner, doc).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_grant_rules() {
        let dir = DocumentDirectory::new();
        let owner = Uuid::new_v4();
        let writer = Uuid::new_v4();
        let other = Uuid::new_v4();
        let doc = dir.create(owner, "Doc").await.id;
        dir.grant(owner, doc, writer, Role::Write).await.unwrap();

        assert!(matches!(
            dir.grant(writer, doc, other, Role::Read).await,
            Err(PermissionError::Forbidden(_))
        ));
        assert_eq!(
            dir.grant(owner, doc, other, Role::Owner).await,
            Err(PermissionError::InvalidRole(Role::Owner))
        );
        assert_eq!(
            dir.grant(owner, doc, other, Role::None).await,
            Err(PermissionError::InvalidRole(Role::None))
        );
        assert!(matches!(
            dir.grant(owner, doc, owner, Role::Read).await,
            Err(PermissionError::Forbidden(_))
        ));
        assert_eq!(
            dir.grant(owner, Uuid::nil(), other, Role::Read).await,
            Err(PermissionError::NotFound(Uuid::nil()))
        );
    }

    #[tokio::test]
    async fn test_revoke_rules() {
        let dir = DocumentDirectory::new();
        let owner = Uuid::new_v4();
        let writer = Uuid::new_v4();
        let doc = dir.create(owner, "Doc").await.id;
        dir.grant(owner, doc, writer, Role::Write).await.unwrap();

        assert!(matches!(
            dir.revoke(writer, doc, owner).await,
            Err(PermissionError::Forbidden(_))
        ));
        assert!(matches!(
            dir.revoke(owner, doc, owner).await,
            Err(PermissionError::Forbidden(_))
        ));
        assert!(matches!(
            dir.revoke(writer, doc, writer).await,
            Err(PermissionError::Forbidden(_))
        ));

        dir.revoke(owner, doc, writer).await.unwrap();
        dir.revoke(owner, doc, writer).await.unwrap();
        assert_eq!(dir.resolve(doc, writer).await, Role::None);
        assert_eq!(dir.resolve(doc, owner).await, Role::Owner);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = DocumentDirectory::new();
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let first = dir.create(owner, "First").await.id;
        let second = dir.create(owner, "Second").await.id;
        dir.grant(owner, second, reader, Role::Read).await.unwrap();

        assert_eq!(dir.list_for(owner).await.len(), 2);
        let visible = dir.list_for(reader).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, second);

        assert!(matches!(
            dir.delete(reader, second).await,
            Err(PermissionError::Forbidden(_))
        ));
        dir.delete(owner, first).await.unwrap();
        assert!(!dir.exists(first).await);
        assert_eq!(
            dir.delete(owner, first).await,
            Err(PermissionError::NotFound(first))
        );
    }
}
