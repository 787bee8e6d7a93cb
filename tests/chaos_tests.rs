// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the replicator survives broken brokers, unreachable or
//! misbehaving peers and restarts without panics, lost rows or a reconciler
//! cursor that skips work.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{add_rows, container, in_sync_peer, multi_policy_config, node, ring, single_policy_config, Harness, MockPeer};
use container_replicator::broker::{Broker, MemoryBroker};
use container_replicator::config::SyncStoreConfig;
use container_replicator::peer::PeerResponse;
use container_replicator::sync_store::{SqliteSyncStore, SyncStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Two correctly placed rows, then one misplaced row in bucket 3600.
async fn one_misplaced(name: &str) -> Arc<MemoryBroker> {
    let broker = container(name, 100);
    add_rows(&broker, &[("a", 100, 0), ("b", 200, 0), ("m", 3_700, 1)]).await;
    broker
}

// =============================================================================
// Broker Failures
// =============================================================================

/// Test: a queue container refusing rows holds the cursor until it recovers
#[tokio::test]
async fn queue_merge_failure_holds_cursor_until_retry() {
    let h = Harness::new(multi_policy_config(), ring());

    let first = one_misplaced("first").await;
    h.base.add(first.clone(), vec![in_sync_peer(1, first.as_ref()).await], false);
    h.replicator.run_once().await.unwrap();
    assert_eq!(first.get_reconciler_sync_point().await.unwrap(), 3);

    let queues = h.queue_containers();
    assert_eq!(queues.len(), 1);
    queues[0].fail.merge_items.store(true, Ordering::SeqCst);

    let second = one_misplaced("second").await;
    h.base.add(second.clone(), vec![in_sync_peer(1, second.as_ref()).await], false);
    h.replicator.run_once().await.unwrap();

    assert_eq!(second.get_reconciler_sync_point().await.unwrap(), -1);
    assert_eq!(h.replicator.stats().reconciler_feeds_failed, 1);
    assert_eq!(queues[0].rows().await.len(), 1);

    // Recovered: the same rows go through on the next pass
    queues[0].fail.merge_items.store(false, Ordering::SeqCst);
    h.replicator.run_once().await.unwrap();

    assert_eq!(second.get_reconciler_sync_point().await.unwrap(), 3);
    let names: Vec<String> = queues[0].rows().await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["1:/AUTH_test/first/m", "1:/AUTH_test/second/m"]);
}

/// Test: an unreadable broker fails alone; its neighbours still replicate
#[tokio::test]
async fn misplaced_read_failure_is_isolated() {
    let h = Harness::new(multi_policy_config(), ring());

    let broken = one_misplaced("broken").await;
    broken.fail.get_misplaced.store(true, Ordering::SeqCst);
    let healthy = one_misplaced("healthy").await;
    h.base.add(broken.clone(), vec![in_sync_peer(1, broken.as_ref()).await], false);
    h.base.add(healthy.clone(), vec![in_sync_peer(1, healthy.as_ref()).await], false);

    let report = h.replicator.run_once().await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.failure, 1);
    assert_eq!(h.base.entries_with("error:").len(), 1);
    assert_eq!(broken.get_reconciler_sync_point().await.unwrap(), -1);
    assert_eq!(healthy.get_reconciler_sync_point().await.unwrap(), 3);
}

/// Test: a cursor write failure loses no queued rows and the fan-out still runs
#[tokio::test]
async fn sync_point_write_failure_keeps_queue_rows() {
    let h = Harness::new(multi_policy_config(), ring());

    let broker = one_misplaced("c").await;
    broker.fail.update_sync_point.store(true, Ordering::SeqCst);
    h.base.add(broker.clone(), vec![in_sync_peer(1, broker.as_ref()).await], false);

    let result = h.replicator.run_once().await;
    assert!(result.is_ok());

    assert_eq!(broker.get_reconciler_sync_point().await.unwrap(), -1);
    assert_eq!(h.replicator.stats().rows_enqueued, 1);
    assert_eq!(h.base.entries_with("replicate_object:").len(), 1);

    // Enqueueing again is harmless: queue rows merge by name
    broker.fail.update_sync_point.store(false, Ordering::SeqCst);
    h.replicator.run_once().await.unwrap();
    assert_eq!(broker.get_reconciler_sync_point().await.unwrap(), 3);
    assert_eq!(h.queue_containers()[0].rows().await.len(), 1);
}

// =============================================================================
// Peer Failures
// =============================================================================

/// Test: every peer unreachable degrades to a failed pass, nothing deleted
#[tokio::test]
async fn all_peers_down_no_panic() {
    let h = Harness::new(multi_policy_config(), ring());

    let broker = one_misplaced("c").await;
    let handoff = container("h", 100);
    h.factory.insert(handoff.clone());
    let down = || -> Vec<Arc<MockPeer>> { (1..=3).map(|id| Arc::new(MockPeer::down(node(id)))).collect() };
    h.base.add(broker.clone(), down(), false);
    h.base.add(handoff.clone(), down(), true);

    for _ in 0..3 {
        let report = h.replicator.run_once().await.unwrap();
        assert_eq!(report.failure, 2);
    }

    assert_eq!(broker.get_reconciler_sync_point().await.unwrap(), -1);
    assert!(h.base.entries_with("delete:").is_empty());
    assert!(h.factory.get("sd0/h.db").is_some());
}

/// Test: malformed or refused peer replies count as failures, never panics
#[tokio::test]
async fn garbage_peer_replies_no_panic() {
    let h = Harness::new(single_policy_config(), ring());

    let broker = container("c", 100);
    add_rows(&broker, &[("a", 1, 0)]).await;
    let info = broker.get_replication_info().await.unwrap();

    let garbage: Vec<Arc<MockPeer>> = vec![
        Arc::new(MockPeer::new(node(1)).reply("sync", PeerResponse::new(200, "not json"))),
        Arc::new(MockPeer::new(node(2)).reply("sync", PeerResponse::new(507, "insufficient storage"))),
        Arc::new(
            MockPeer::new(node(3))
                .reply("sync", PeerResponse::json_ok(&info).unwrap())
                .reply("get_shard_ranges", PeerResponse::new(200, "{\"broken\": ")),
        ),
    ];
    h.base.add(broker.clone(), garbage, false);

    let report = h.replicator.run_once().await.unwrap();

    assert_eq!(report.failure, 1);
    assert!(broker.get_shard_ranges(true, true).await.unwrap().is_empty());
}

/// Test: a slow peer does not stop shutdown from taking effect
#[tokio::test]
async fn shutdown_during_failures() {
    let mut config = single_policy_config();
    config.interval_sec = 1;
    let h = Arc::new(Harness::new(config, ring()));
    let broker = container("c", 100);
    h.base.add(broker.clone(), vec![Arc::new(MockPeer::down(node(1)))], false);

    let runner = {
        let h = h.clone();
        tokio::spawn(async move { h.replicator.run_forever().await })
    };

    let mut waited = 0;
    while h.replicator.stats().passes == 0 && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(h.replicator.stats().passes >= 1);
    h.replicator.shutdown();

    let joined = tokio::time::timeout(Duration::from_secs(5), runner).await;
    assert!(joined.is_ok(), "run_forever should stop after shutdown");
}

// =============================================================================
// Sync Store Persistence
// =============================================================================

/// Test: sync store entries survive a restart
#[tokio::test]
async fn sync_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let config = SyncStoreConfig {
        sqlite_path: dir.path().join("container_sync.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };

    let broker = container("c", 100);
    broker.set_container_sync_to(Some("//realm/cluster/AUTH_x/c".into())).await;

    {
        let store = SqliteSyncStore::open(&config).await.unwrap();
        store.update_sync_store(broker.as_ref()).await.unwrap();
        store.close().await;
    }

    let reopened = SqliteSyncStore::open(&config).await.unwrap();
    let entry = reopened.get("sd0/c.db").await.unwrap().unwrap();
    assert_eq!(entry.account, "AUTH_test");
    assert_eq!(entry.container, "c");
    assert_eq!(entry.sync_to, "//realm/cluster/AUTH_x/c");

    reopened.remove_synced_container(broker.as_ref()).await.unwrap();
    assert!(reopened.entries().await.unwrap().is_empty());
    reopened.close().await;
}

/// Test: a store pointed at an unusable path fails to open cleanly
#[tokio::test]
async fn sync_store_bad_path_is_an_error() {
    let dir = tempdir().unwrap();
    let config = SyncStoreConfig {
        sqlite_path: dir.path().join("missing").join("nested").join("sync.db").to_string_lossy().into_owned(),
        wal_mode: false,
    };
    assert!(SqliteSyncStore::open(&config).await.is_err());
}
