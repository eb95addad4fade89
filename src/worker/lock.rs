use crate::error::StoreError;
use crate::store::StoreHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A held advisory lock. Release it explicitly. Dropping it unreleased, as
/// when its task is aborted, schedules the release on the current runtime.
pub struct AdvisoryLock {
    store: StoreHandle,
    key: i64,
    holder: String,
    released: bool,
}

impl AdvisoryLock {
    /// Polls every `poll` until the lock is taken or `timeout` elapses.
    /// `Ok(None)` means the wait timed out.
    pub async fn acquire(
        store: &StoreHandle,
        key: i64,
        holder: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Self>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if store.try_advisory_lock(key, holder).await? {
                debug!("Advisory lock {} taken by {}", key, holder);
                return Ok(Some(Self {
                    store: store.clone(),
                    key,
                    holder: holder.to_string(),
                    released: false,
                }));
            }
            if Instant::now() + poll > deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        unlock(&self.store, self.key, &self.holder).await;
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Advisory lock {} dropped outside a runtime, left to expire",
                self.key
            );
            return;
        };

        debug!("Advisory lock {} dropped unreleased, releasing", self.key);
        let store = self.store.clone();
        let key = self.key;
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move { unlock(&store, key, &holder).await });
    }
}

async fn unlock(store: &StoreHandle, key: i64, holder: &str) {
    if let Err(e) = store.advisory_unlock(key, holder).await {
        warn!(
            "Failed to release advisory lock {} held by {}: {}",
            key, holder, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    const POLL: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn second_holder_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();

        let first = AdvisoryLock::acquire(&store, 1, "a", Duration::from_millis(100), POLL)
            .await
            .unwrap()
            .expect("free lock is taken");
        let blocked = AdvisoryLock::acquire(&store, 1, "b", Duration::from_millis(100), POLL)
            .await
            .unwrap();
        assert!(blocked.is_none());

        let other_key = AdvisoryLock::acquire(&store, 2, "b", Duration::from_millis(100), POLL)
            .await
            .unwrap();
        assert!(other_key.is_some());

        first.release().await;
        let second = AdvisoryLock::acquire(&store, 1, "b", Duration::from_millis(100), POLL)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn waiter_gets_lock_released_during_poll() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();

        let first = AdvisoryLock::acquire(&store, 7, "a", Duration::from_secs(1), POLL)
            .await
            .unwrap()
            .unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                AdvisoryLock::acquire(&store, 7, "b", Duration::from_secs(2), POLL).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        first.release().await;
        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn aborted_holder_gives_the_lock_back() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();

        let (taken, acquired) = tokio::sync::oneshot::channel();
        let holder = {
            let store = store.clone();
            tokio::spawn(async move {
                let _lock = AdvisoryLock::acquire(&store, 5, "a", Duration::from_secs(1), POLL)
                    .await
                    .unwrap()
                    .unwrap();
                let _ = taken.send(());
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        acquired.await.unwrap();
        assert!(!store.try_advisory_lock(5, "b").await.unwrap());

        holder.abort();
        assert!(holder.await.unwrap_err().is_cancelled());

        let next = AdvisoryLock::acquire(&store, 5, "b", Duration::from_secs(2), POLL)
            .await
            .unwrap();
        assert!(next.is_some());
    }
}
