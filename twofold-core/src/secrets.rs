//! Secret management on top of a [`SecretStore`].
//!
//! Single-item operations surface storage errors to the caller. Listing and
//! the code board go through the export snapshot, which skips unreadable
//! records.

use crate::backup::export_records;
use crate::ids::SnowflakeGenerator;
use crate::store::{SecretRecord, SecretStore};
use crate::totp::{self, generate, parse_otpauth_uri, validate_totp_key};
use crate::{Result, TwofoldError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A code as shown on the board. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthCodeView {
    pub id: String,
    pub name: String,
    pub issuer: String,
    pub code: String,
    pub order: i64,
}

/// Changes applied by [`SecretManager::edit`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct SecretUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub secret: Option<String>,
}

/// Secret manager
pub struct SecretManager {
    store: Arc<dyn SecretStore>,
    ids: SnowflakeGenerator,
}

impl SecretManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            ids: SnowflakeGenerator::with_random_worker(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Add a manually entered secret.
    pub async fn add(&self, secret: &str, title: &str, description: &str) -> Result<SecretRecord> {
        let secret = validate_totp_key(secret)?;
        self.insert(secret, title, description).await
    }

    /// Add a secret from an `otpauth://` URI.
    ///
    /// The issuer becomes the title and the account the description. Without
    /// an issuer the account is used as the title.
    pub async fn add_from_uri(&self, uri: &str) -> Result<SecretRecord> {
        let parsed = parse_otpauth_uri(uri)?;
        let secret = totp::normalize_secret(&parsed.secret_base32)?;
        let (title, description) = match parsed.issuer {
            Some(issuer) if !issuer.is_empty() => (issuer, parsed.account),
            _ => (parsed.account, String::new()),
        };
        self.insert(secret, &title, &description).await
    }

    async fn insert(&self, secret: String, title: &str, description: &str) -> Result<SecretRecord> {
        let title = title.trim();
        if title.is_empty() {
            return Err(TwofoldError::InvalidInput("Title cannot be empty".to_string()));
        }

        let existing = self.list().await?;
        let order = existing.iter().map(|r| r.order + 1).max().unwrap_or(0);

        let record = SecretRecord {
            id: self.ids.generate(),
            secret,
            title: title.to_string(),
            description: description.trim().to_string(),
            order,
        };
        self.store.put(&record.id, &record).await?;

        info!("Added secret {} ({})", record.id, record.title);
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<SecretRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TwofoldError::NotFound(format!("Secret {}", id)))
    }

    /// All records sorted by display order.
    pub async fn list(&self) -> Result<Vec<SecretRecord>> {
        export_records(self.store.as_ref()).await
    }

    pub async fn edit(&self, id: &str, update: SecretUpdate) -> Result<SecretRecord> {
        let mut record = self.get(id).await?;

        if let Some(title) = update.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(TwofoldError::InvalidInput("Title cannot be empty".to_string()));
            }
            record.title = title.to_string();
        }
        if let Some(description) = update.description {
            record.description = description.trim().to_string();
        }
        if let Some(secret) = update.secret {
            record.secret = validate_totp_key(&secret)?;
        }

        self.store.put(id, &record).await?;
        info!("Updated secret {}", id);
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.get(id).await?;
        self.store.delete(id).await?;
        info!("Deleted secret {}", id);
        Ok(())
    }

    /// Move the given ids to the front in the given order. Records not
    /// named keep their relative order after them.
    pub async fn reorder(&self, ids: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(TwofoldError::InvalidInput(format!("Duplicate id {}", id)));
            }
        }

        let mut front = Vec::with_capacity(ids.len());
        for id in ids {
            front.push(self.get(id).await?);
        }
        let rest = self
            .list()
            .await?
            .into_iter()
            .filter(|r| !seen.contains(r.id.as_str()));

        for (position, mut record) in front.into_iter().chain(rest).enumerate() {
            let position = position as i64;
            if record.order != position {
                record.order = position;
                self.store.put(&record.id, &record).await?;
            }
        }

        debug!("Reordered {} secrets", ids.len());
        Ok(())
    }

    /// Current code for every record at `now_ms`.
    pub async fn code_board(&self, now_ms: i64) -> Result<Vec<AuthCodeView>> {
        let records = self.list().await?;
        Ok(records
            .into_iter()
            .map(|record| AuthCodeView {
                code: generate(&record.secret, now_ms),
                id: record.id,
                name: record.title,
                issuer: record.description,
                order: record.order,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> SecretManager {
        SecretManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_add_and_board() {
        let manager = manager();
        let record = manager
            .add("AAAA AAAA AAAA AAAA", "GitHub", "admin@example.com")
            .await
            .unwrap();
        assert_eq!(record.secret, "AAAAAAAAAAAAAAAA");
        assert_eq!(record.order, 0);

        let board = manager.code_board(1_700_000_000_000).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].name, "GitHub");
        assert_eq!(board[0].issuer, "admin@example.com");
        assert_eq!(board[0].code, "501315");
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_input() {
        let manager = manager();
        assert!(matches!(
            manager.add("NOT-VALID-1", "x", "").await,
            Err(TwofoldError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.add("JBSWY3DPEHPK3PXP", "   ", "").await,
            Err(TwofoldError::InvalidInput(_))
        ));
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orders_are_appended() {
        let manager = manager();
        let a = manager.add("JBSWY3DPEHPK3PXP", "A", "").await.unwrap();
        let b = manager.add("JBSWY3DPEHPK3PXP", "B", "").await.unwrap();
        assert_eq!((a.order, b.order), (0, 1));

        let titles: Vec<_> = manager
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_add_from_uri() {
        let manager = manager();
        let record = manager
            .add_from_uri("otpauth://totp/GitHub:octocat?secret=JBSWY3DPEHPK3PXP&issuer=GitHub")
            .await
            .unwrap();
        assert_eq!(record.title, "GitHub");
        assert_eq!(record.description, "octocat");

        let bare = manager
            .add_from_uri("otpauth://totp/someone?secret=JBSWY3DPEHPK3PXP")
            .await
            .unwrap();
        assert_eq!(bare.title, "someone");
        assert_eq!(bare.description, "");

        assert!(matches!(
            manager.add_from_uri("otpauth://totp/NoSecret").await,
            Err(TwofoldError::Format(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_and_delete() {
        let manager = manager();
        let record = manager.add("JBSWY3DPEHPK3PXP", "Old", "").await.unwrap();

        let updated = manager
            .edit(
                &record.id,
                SecretUpdate {
                    title: Some("New".to_string()),
                    description: Some("desc".to_string()),
                    secret: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "New");
        assert_eq!(updated.secret, record.secret);
        assert_eq!(manager.get(&record.id).await.unwrap(), updated);

        manager.delete(&record.id).await.unwrap();
        assert!(matches!(
            manager.delete(&record.id).await,
            Err(TwofoldError::NotFound(_))
        ));
        assert!(matches!(
            manager.edit(&record.id, SecretUpdate::default()).await,
            Err(TwofoldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_item_storage_errors_surface() {
        let store = Arc::new(MemoryStore::new());
        let manager = SecretManager::new(store.clone());
        let record = manager.add("JBSWY3DPEHPK3PXP", "A", "").await.unwrap();

        store.fail_writes_for(&record.id);
        let result = manager
            .edit(
                &record.id,
                SecretUpdate {
                    title: Some("B".to_string()),
                    ..SecretUpdate::default()
                },
            )
            .await;
        assert!(matches!(result, Err(TwofoldError::Storage(_))));
    }

    #[tokio::test]
    async fn test_reorder() {
        let manager = manager();
        let a = manager.add("JBSWY3DPEHPK3PXP", "A", "").await.unwrap();
        let b = manager.add("JBSWY3DPEHPK3PXP", "B", "").await.unwrap();
        let c = manager.add("JBSWY3DPEHPK3PXP", "C", "").await.unwrap();

        manager.reorder(&[c.id.clone()]).await.unwrap();
        let titles: Vec<_> = manager
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["C", "A", "B"]);

        assert!(manager
            .reorder(&[a.id.clone(), a.id.clone()])
            .await
            .is_err());
        assert!(matches!(
            manager.reorder(&["missing".to_string(), b.id.clone()]).await,
            Err(TwofoldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_over_dyn_store() {
        let store: Arc<dyn SecretStore> = Arc::new(MemoryStore::new());
        let manager = SecretManager::new(store);
        manager.add("JBSWY3DPEHPK3PXP", "Dyn", "").await.unwrap();
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }
}
