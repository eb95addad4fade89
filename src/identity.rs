use crate::error::StoreError;
use crate::store::{Identity, StoreHandle};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const BOT_NAME: &str = "AI Assistant";
pub const BOT_MARKER: &str = "assistant@openai.local";

/// Resolves the synthetic assistant identity, creating it on first use.
pub struct BotIdentityResolver {
    store: StoreHandle,
    cached: OnceCell<Identity>,
}

impl BotIdentityResolver {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            cached: OnceCell::new(),
        }
    }

    pub async fn get_or_create(&self) -> Result<Identity, StoreError> {
        self.cached
            .get_or_try_init(|| self.lookup_or_create())
            .await
            .cloned()
    }

    async fn lookup_or_create(&self) -> Result<Identity, StoreError> {
        if let Some(identity) = self.store.find_identity_by_marker(BOT_MARKER).await? {
            return Ok(identity);
        }

        match self.store.create_identity(BOT_NAME, Some(BOT_MARKER)).await {
            Ok(identity) => {
                info!("Created bot identity {}", identity.id);
                Ok(identity)
            }
            // Lost the creation race; the winner's row is there now.
            Err(StoreError::UniqueViolation(_)) => {
                debug!("Bot identity created concurrently, looking it up again");
                self.store
                    .find_identity_by_marker(BOT_MARKER)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(BOT_MARKER.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolver_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();

        let first = BotIdentityResolver::new(store.clone())
            .get_or_create()
            .await
            .unwrap();
        let second = BotIdentityResolver::new(store.clone())
            .get_or_create()
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.marker.as_deref(), Some(BOT_MARKER));
    }

    #[tokio::test]
    async fn concurrent_resolvers_agree_on_one_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();

        let resolvers: Vec<_> = (0..4)
            .map(|_| Arc::new(BotIdentityResolver::new(store.clone())))
            .collect();
        let handles: Vec<_> = resolvers
            .iter()
            .cloned()
            .map(|r| tokio::spawn(async move { r.get_or_create().await }))
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn reuses_identity_created_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();
        let existing = store
            .create_identity(BOT_NAME, Some(BOT_MARKER))
            .await
            .unwrap();

        let resolver = BotIdentityResolver::new(store.clone());
        let resolved = resolver.lookup_or_create().await.unwrap();
        assert_eq!(resolved.id, existing.id);
    }
}
