//! Scripted BaseReplicator for testing.
//!
//! Runs a minimal version of the generic per-broker loop (sync each peer,
//! post-replicate hook, reclaim of deleted databases, handoff cleanup) over a
//! fixed list of brokers, and records everything the driver asks of it.

use super::mock_peer::MockPeer;
use container_replicator::broker::{Broker, MemoryBrokerFactory, ReplicationInfo};
use container_replicator::coordinator::PassReport;
use container_replicator::driver::{BaseReplicator, HookFuture, ReplicationDriver, SyncExchange};
use container_replicator::error::Result;
use container_replicator::peer::PeerHandle;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One local broker the scripted pass replicates.
#[derive(Clone)]
pub struct ScriptedBroker {
    pub broker: Arc<dyn Broker>,
    pub peers: Vec<Arc<MockPeer>>,
    /// Replica sits on a handoff device: delete once every peer has it
    pub handoff: bool,
}

/// Base replicator driven by a script.
///
/// # Example
/// ```rust,ignore
/// let base = ScriptedBase::new([0, 1, 2]);
/// base.add(broker, vec![peer_a, peer_b], false);
///
/// // Run a pass through ContainerReplicator...
///
/// assert!(base.entries_with("push:").is_empty());
/// ```
pub struct ScriptedBase {
    local_device_ids: HashSet<u32>,
    brokers: Mutex<Vec<ScriptedBroker>>,
    /// Result of every object push
    push_result: AtomicBool,
    /// Deleted brokers are dropped from this factory when set
    factory: Option<Arc<MemoryBrokerFactory>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedBase {
    pub fn new(local_device_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            local_device_ids: local_device_ids.into_iter().collect(),
            brokers: Mutex::new(Vec::new()),
            push_result: AtomicBool::new(true),
            factory: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Builder: remove deleted brokers from `factory`.
    pub fn with_factory(mut self, factory: Arc<MemoryBrokerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn add(&self, broker: Arc<dyn Broker>, peers: Vec<Arc<MockPeer>>, handoff: bool) {
        self.brokers.lock().unwrap().push(ScriptedBroker {
            broker,
            peers,
            handoff,
        });
    }

    pub fn set_push_result(&self, ok: bool) {
        self.push_result.store(ok, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Log entries starting with `prefix`.
    pub fn entries_with(&self, prefix: &str) -> Vec<String> {
        self.log().into_iter().filter(|e| e.starts_with(prefix)).collect()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    async fn replicate_broker(&self, driver: &dyn ReplicationDriver, scripted: &ScriptedBroker) -> Result<bool> {
        let broker = &scripted.broker;
        if driver.is_locked(broker).await? {
            self.record(format!("locked:{}", broker.identity().db_file));
            return Ok(false);
        }

        let info = broker.get_replication_info().await?;
        let args = driver.gather_sync_args(&info).to_args();

        let mut responses = Vec::with_capacity(scripted.peers.len());
        for peer in &scripted.peers {
            let ok = match peer.replicate("sync", args.clone()).await {
                Ok(response) => {
                    let exchange = SyncExchange::new(broker, peer.as_ref(), &info);
                    match driver.handle_sync_response(&exchange, response).await {
                        Ok(ok) => ok,
                        Err(e) => {
                            self.record(format!("error:{}", e));
                            false
                        }
                    }
                }
                Err(_) => false,
            };
            responses.push(ok);
        }

        driver.post_replicate_hook(broker, &info, &responses).await?;

        // Deleted and empty: reclaim once the account layer has caught up
        let deleted = info.delete_timestamp > info.put_timestamp && info.object_count == 0;
        if deleted && driver.report_up_to_date(&info) {
            self.record(format!("reclaim:{}", broker.identity().db_file));
            driver.delete_broker(broker).await?;
            return Ok(true);
        }

        let success = responses.iter().all(|ok| *ok);
        if scripted.handoff && success {
            driver.cleanup_after_replicate(broker, &info, &responses).await?;
        }
        Ok(success)
    }
}

impl BaseReplicator for ScriptedBase {
    fn local_device_ids(&self) -> HashSet<u32> {
        self.local_device_ids.clone()
    }

    fn run_pass<'a>(&'a self, driver: &'a dyn ReplicationDriver) -> HookFuture<'a, PassReport> {
        Box::pin(async move {
            let scripted: Vec<ScriptedBroker> = self.brokers.lock().unwrap().clone();
            let mut report = PassReport::default();
            for entry in &scripted {
                report.attempted += 1;
                match self.replicate_broker(driver, entry).await {
                    Ok(true) => report.success += 1,
                    Ok(false) => report.failure += 1,
                    Err(e) => {
                        self.record(format!("error:{}", e));
                        report.failure += 1;
                    }
                }
            }
            Ok(report)
        })
    }

    fn replicate_object<'a>(
        &'a self,
        _driver: &'a dyn ReplicationDriver,
        partition: u32,
        broker: Arc<dyn Broker>,
        node_id: u32,
    ) -> HookFuture<'a, bool> {
        self.record(format!(
            "replicate_object:{}:{}:{}",
            broker.identity().db_file,
            partition,
            node_id
        ));
        Box::pin(async { Ok(true) })
    }

    fn choose_replication_mode<'a>(
        &'a self,
        exchange: &'a SyncExchange<'a>,
        remote: &'a ReplicationInfo,
        _local_sync: i64,
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            self.record(format!(
                "push:{}->{}",
                exchange.broker.identity().db_file,
                exchange.peer.node().address()
            ));
            let ok = self.push_result.load(Ordering::SeqCst);
            if ok {
                // Every row reached the peer
                exchange.broker.merge_syncs(&remote.id, exchange.local_info.max_row).await?;
            }
            Ok(ok)
        })
    }

    fn cleanup_after_replicate<'a>(
        &'a self,
        driver: &'a dyn ReplicationDriver,
        broker: &'a Arc<dyn Broker>,
        _info: &'a ReplicationInfo,
        responses: &'a [bool],
    ) -> HookFuture<'a, bool> {
        Box::pin(async move {
            self.record(format!("cleanup:{}", broker.identity().db_file));
            if responses.iter().all(|ok| *ok) {
                return driver.delete_broker(broker).await;
            }
            Ok(false)
        })
    }

    fn delete_broker<'a>(&'a self, broker: &'a Arc<dyn Broker>) -> HookFuture<'a, bool> {
        let db_file = broker.identity().db_file.clone();
        self.record(format!("delete:{}", db_file));
        if let Some(factory) = &self.factory {
            factory.remove(&db_file);
        }
        Box::pin(async { Ok(true) })
    }
}
