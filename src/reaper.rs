use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::FileStore;

/// One pass over the store: deletes every artifact whose age reached `ttl`.
/// Per-item failures are logged and do not stop the rest of the sweep.
/// Returns the number of artifacts removed.
pub async fn sweep(store: &FileStore, ttl: Duration) -> usize {
    let artifacts = match store.list().await {
        Ok(artifacts) => artifacts,
        Err(error) => {
            warn!("Retention sweep could not list the store: {}", error.message);
            return 0;
        }
    };

    let now = Utc::now();
    let mut removed = 0;

    for artifact in artifacts {
        let age = (now - artifact.modified_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < ttl {
            continue;
        }

        match store.delete(&artifact.name).await {
            Ok(()) => {
                debug!("Reaped expired file {:?} (age {age:?})", artifact.name);
                removed += 1;
            }
            Err(error) => {
                warn!("Could not reap {:?}: {}", artifact.name, error.message);
            }
        }
    }

    if removed > 0 {
        info!("Retention sweep removed {removed} expired file(s)");
    }

    removed
}

/// Background retention loop. Ticks every `interval` until the token is
/// cancelled; in production the token lives as long as the process.
pub fn spawn(
    store: FileStore,
    ttl: Duration,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so a
        // fresh store is not swept at startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&store, ttl).await;
                }
                _ = token.cancelled() => {
                    debug!("Retention reaper stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn store_with_file(name: &str) -> FileStore {
        let root = std::env::temp_dir().join(format!("vidvault-reaper-{}", Uuid::new_v4()));
        let store = FileStore::new(root).await.unwrap();
        let name = name.to_string();
        store
            .put(|dir| async move {
                tokio::fs::write(dir.join(name), b"payload").await.unwrap();
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn sweep_removes_expired_files() {
        let store = store_with_file("old.mp4").await;

        // With a zero TTL every file has already expired.
        assert_eq!(sweep(&store, Duration::ZERO).await, 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_files() {
        let store = store_with_file("fresh.mp4").await;

        assert_eq!(sweep(&store, Duration::from_secs(3600)).await, 0);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_on_empty_store_is_a_no_op() {
        let root = std::env::temp_dir().join(format!("vidvault-reaper-{}", Uuid::new_v4()));
        let store = FileStore::new(root).await.unwrap();

        assert_eq!(sweep(&store, Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn spawned_reaper_sweeps_and_stops_on_cancel() {
        let store = store_with_file("doomed.mp4").await;
        let token = CancellationToken::new();

        let handle = spawn(
            store.clone(),
            Duration::ZERO,
            Duration::from_millis(20),
            token.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !store.list().await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "reaper never swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        handle.await.unwrap();
    }
}
