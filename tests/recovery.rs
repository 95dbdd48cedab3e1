mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, factory_for, fast_config, init_logging, reading, Reading, Recorder};
use keyrouter::core::store::{JournalConfig, MemoryStoreConfig};
use keyrouter::{HandleOutcome, Handler, MemoryStore, Store, WorkManager};

const WAIT: Duration = Duration::from_secs(5);

/// Never lets an item go.
#[derive(Default)]
struct Bouncer {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler<Reading> for Bouncer {
    async fn handle(&self, item: Reading) -> anyhow::Result<HandleOutcome<Reading>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(HandleOutcome::Retry(item))
    }
}

async fn journaled(path: &Path) -> Arc<dyn Store<Reading>> {
    let store = MemoryStore::open(path, MemoryStoreConfig::default(), JournalConfig::default())
        .await
        .unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn queued_items_survive_a_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.journal");

    {
        let bouncer = Arc::new(Bouncer::default());
        let manager =
            WorkManager::new(journaled(&path).await, factory_for(Arc::clone(&bouncer)), fast_config())
                .unwrap();
        manager.start().await.unwrap();
        for seq in 0..3 {
            manager.post(reading("north", seq)).await.unwrap();
        }
        manager.post(reading("south", 0)).await.unwrap();
        manager.post(reading("south", 1)).await.unwrap();

        assert!(eventually(WAIT, || bouncer.calls.load(Ordering::SeqCst) >= 5).await);
        manager.stop().await.unwrap();
        assert_eq!(manager.buffered_count(), 5);
    }

    let recorder = Arc::new(Recorder::default());
    let manager =
        WorkManager::new(journaled(&path).await, factory_for(Arc::clone(&recorder)), fast_config())
            .unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.names(), vec!["north", "south"]);

    assert!(eventually(WAIT, || recorder.count() == 5).await);
    assert!(eventually(WAIT, || manager.buffered_count() == 0).await);
    let mut north = recorder.sequence_of("north");
    north.sort_unstable();
    assert_eq!(north, vec![0, 1, 2]);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn restart_without_items_recovers_empty_queues() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.journal");

    {
        let recorder = Arc::new(Recorder::default());
        let manager =
            WorkManager::new(journaled(&path).await, factory_for(Arc::clone(&recorder)), fast_config())
                .unwrap();
        manager.start().await.unwrap();
        manager.post(reading("east", 0)).await.unwrap();
        assert!(eventually(WAIT, || manager.buffered_count() == 0).await);
        manager.stop().await.unwrap();
    }

    let manager = WorkManager::new(
        journaled(&path).await,
        factory_for(Arc::new(Recorder::default())),
        fast_config(),
    )
    .unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.names(), vec!["east"]);
    assert_eq!(manager.buffered_count(), 0);
    manager.stop().await.unwrap();
}
