//! Process-wide cache of cursor engines, keyed by connection identity.
//!
//! The framework schedules at most one task per partition at a time and
//! keeps partitions sticky to workers across micro-batches, so entries are
//! created once and then hit for the lifetime of the worker. Nothing ever
//! evicts them; a rebuild only happens when the transport underneath an
//! engine is known dead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::evstream::client::pool::ClientConnectionPool;
use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::{is_reactor_dispatcher_closed, EventHubsError, Result};
use crate::evstream::event::EventData;
use crate::evstream::receiver::cursor::CursorEngine;
use crate::evstream::types::{NameAndPartition, SequenceNumber, TaskContext};

type EngineRef = Arc<AsyncMutex<CursorEngine>>;

static ENGINES: OnceLock<Mutex<HashMap<String, EngineRef>>> = OnceLock::new();

fn engines() -> &'static Mutex<HashMap<String, EngineRef>> {
    ENGINES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The public receive entry point for worker tasks.
pub struct ReceiverCache;

impl ReceiverCache {
    /// One live engine per (connection string, consumer group, partition).
    fn key(conf: &EventHubsConf, name_and_partition: &NameAndPartition) -> String {
        format!(
            "{}{}{}",
            conf.connection_string(),
            conf.consumer_group(),
            name_and_partition.partition_id()
        )
        .to_lowercase()
    }

    /// Receive the exact range `[request_seq_no, request_seq_no + batch_size)`
    /// from the cached engine for this connection identity, creating the
    /// engine on first use.
    pub async fn receive(
        conf: &EventHubsConf,
        name_and_partition: &NameAndPartition,
        ctx: &TaskContext,
        request_seq_no: SequenceNumber,
        batch_size: u32,
    ) -> Result<Vec<EventData>> {
        let key = Self::key(conf, name_and_partition);
        let engine = Self::lookup_or_create(&key, conf, name_and_partition, request_seq_no).await?;

        let result = {
            let mut guard = engine.lock().await;
            guard.receive(ctx, request_seq_no, batch_size).await
        };

        match result {
            Err(err) if is_reactor_dispatcher_closed(&err) => {
                log::warn!(
                    "{}: the reactor dispatcher closed underneath the cached receiver; \
                     rebuilding the connection and retrying once: {}",
                    name_and_partition,
                    err
                );
                ClientConnectionPool::force_close(conf).await;
                let fresh = Arc::new(AsyncMutex::new(
                    CursorEngine::new(conf, name_and_partition, request_seq_no).await?,
                ));
                engines().lock().unwrap().insert(key, fresh.clone());
                let mut guard = fresh.lock().await;
                guard.receive(ctx, request_seq_no, batch_size).await
            }
            Err(err @ EventHubsError::ReceiverDisconnected(_)) => {
                // Another exclusive receiver owns the partition. The driver
                // reschedules the task; the cached engine stays in place and
                // heals itself by recreating its receiver on the next call.
                log::error!(
                    "{}: another receiver took over the partition: {}",
                    name_and_partition,
                    err
                );
                Err(err)
            }
            other => other,
        }
    }

    async fn lookup_or_create(
        key: &str,
        conf: &EventHubsConf,
        name_and_partition: &NameAndPartition,
        request_seq_no: SequenceNumber,
    ) -> Result<EngineRef> {
        if let Some(engine) = engines().lock().unwrap().get(key) {
            return Ok(engine.clone());
        }
        // One task per partition runs at a time, so nobody else creates this
        // entry while the engine is being constructed.
        let engine = Arc::new(AsyncMutex::new(
            CursorEngine::new(conf, name_and_partition, request_seq_no).await?,
        ));
        engines()
            .lock()
            .unwrap()
            .insert(key.to_string(), engine.clone());
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evstream::client::simulated::SimulatedEventHubs;
    use crate::evstream::error::REACTOR_DISPATCHER_CLOSED;

    fn sim_conf(hub: &str) -> EventHubsConf {
        EventHubsConf::new(format!(
            "Endpoint=sb://sim.servicebus.windows.net/;SharedAccessKeyName=policy;\
             SharedAccessKey=secret;EntityPath={}",
            hub
        ))
        .set_use_simulated_client(true)
    }

    fn ctx() -> TaskContext {
        TaskContext::new("exec-1", 1, 0)
    }

    #[tokio::test]
    async fn test_same_engine_is_reused_across_calls() {
        let hubs = SimulatedEventHubs::create("cache-identity", 1);
        hubs.send(0, (0..20).map(|i| vec![i as u8]));
        let conf = sim_conf("cache-identity");
        let np = NameAndPartition::new("cache-identity", 0);
        let key = ReceiverCache::key(&conf, &np);

        ReceiverCache::receive(&conf, &np, &ctx(), 0, 5).await.unwrap();
        let first = engines().lock().unwrap().get(&key).cloned().unwrap();

        ReceiverCache::receive(&conf, &np, &ctx(), 5, 5).await.unwrap();
        let second = engines().lock().unwrap().get(&key).cloned().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_reactor_closed_swaps_in_a_fresh_engine() {
        let hubs = SimulatedEventHubs::create("cache-reactor", 1);
        hubs.send(0, (0..20).map(|i| vec![i as u8]));
        let conf = sim_conf("cache-reactor");
        let np = NameAndPartition::new("cache-reactor", 0);
        let key = ReceiverCache::key(&conf, &np);

        ReceiverCache::receive(&conf, &np, &ctx(), 0, 5).await.unwrap();
        let before = engines().lock().unwrap().get(&key).cloned().unwrap();

        hubs.inject_receive_failure(
            0,
            EventHubsError::Internal(format!("rejected execution: {}", REACTOR_DISPATCHER_CLOSED)),
        );
        let batch = ReceiverCache::receive(&conf, &np, &ctx(), 5, 5).await.unwrap();
        assert_eq!(batch.len(), 5);

        let after = engines().lock().unwrap().get(&key).cloned().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_receiver_disconnected_preserves_the_entry() {
        let hubs = SimulatedEventHubs::create("cache-stolen", 1);
        hubs.send(0, (0..20).map(|i| vec![i as u8]));
        let conf = sim_conf("cache-stolen");
        let np = NameAndPartition::new("cache-stolen", 0);
        let key = ReceiverCache::key(&conf, &np);

        ReceiverCache::receive(&conf, &np, &ctx(), 0, 5).await.unwrap();
        let before = engines().lock().unwrap().get(&key).cloned().unwrap();

        hubs.inject_receive_failure(
            0,
            EventHubsError::ReceiverDisconnected("epoch steal".to_string()),
        );
        let err = ReceiverCache::receive(&conf, &np, &ctx(), 5, 5).await.unwrap_err();
        assert!(matches!(err, EventHubsError::ReceiverDisconnected(_)));

        let after = engines().lock().unwrap().get(&key).cloned().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}
