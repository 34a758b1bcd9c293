//! End-to-end receive scenarios through the process-wide receiver cache,
//! driven against the simulated service.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evstream::evstream::client::simulated::SimulatedEventHubs;
use evstream::evstream::receiver::perf::register_driver_endpoint;
use evstream::{
    DriverEndpoint, EventHubsError, NameAndPartition, PartitionPerformanceMetric, ReceiverCache,
    TaskContext,
};
use evstream::evstream::error::REACTOR_DISPATCHER_CLOSED;
use evstream::EventHubsConf;

fn sim_conf(hub: &str) -> EventHubsConf {
    EventHubsConf::new(format!(
        "Endpoint=sb://sim.servicebus.windows.net/;SharedAccessKeyName=policy;\
         SharedAccessKey=secret;EntityPath={}",
        hub
    ))
    .set_use_simulated_client(true)
}

fn ctx() -> TaskContext {
    TaskContext::new("exec-1", 7, 0)
}

fn seed(hub: &str, count: i64) -> Arc<SimulatedEventHubs> {
    let hubs = SimulatedEventHubs::create(hub, 1);
    hubs.send(0, (0..count).map(|i| format!("event-{}", i).into_bytes()));
    hubs
}

fn sequence_numbers(events: &[evstream::EventData]) -> Vec<i64> {
    events.iter().map(|e| e.sequence_number()).collect()
}

#[tokio::test]
async fn test_happy_path_reuses_the_receiver_across_batches() {
    let hubs = seed("e2e-happy", 100);
    let conf = sim_conf("e2e-happy");
    let np = NameAndPartition::new("e2e-happy", 0);

    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    assert_eq!(sequence_numbers(&batch), (0..10).collect::<Vec<_>>());

    // The next adjacent batch rides the same receiver: no recreate.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 10, 5).await.unwrap();
    assert_eq!(sequence_numbers(&batch), (10..15).collect::<Vec<_>>());
    assert_eq!(hubs.receivers_created(0), 1);
}

#[tokio::test]
async fn test_reexecuted_batch_is_served_from_the_memo_without_io() {
    let hubs = seed("e2e-memo", 100);
    let conf = sim_conf("e2e-memo");
    let np = NameAndPartition::new("e2e-memo", 0);

    let first = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    let calls_after_first = hubs.receive_calls(0);

    let second = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(hubs.receive_calls(0), calls_after_first);
    assert_eq!(hubs.receivers_created(0), 1);
}

#[tokio::test]
async fn test_drifted_cursor_heals_with_exactly_one_recreate() {
    let hubs = seed("e2e-drift", 100);
    let conf = sim_conf("e2e-drift");
    let np = NameAndPartition::new("e2e-drift", 0);

    ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    let created_before = hubs.receivers_created(0);

    // Jump ahead of the cursor: one recreate, then the exact range.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 20, 3).await.unwrap();
    assert_eq!(sequence_numbers(&batch), vec![20, 21, 22]);
    assert_eq!(hubs.receivers_created(0) - created_before, 1);
}

#[tokio::test]
async fn test_expired_range_advances_to_the_earliest_retained_event() {
    let hubs = seed("e2e-expired", 100);
    hubs.trim(0, 50);
    let conf = sim_conf("e2e-expired");
    let np = NameAndPartition::new("e2e-expired", 0);

    // 30 + 20 <= 50: everything requested is gone; the batch is empty.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 30, 20).await.unwrap();
    assert!(batch.is_empty());

    // 30 + 40 > 50: delivery resumes at the begin sequence number and the
    // batch shrinks to the surviving tail of the range.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 30, 40).await.unwrap();
    assert_eq!(sequence_numbers(&batch), (50..70).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_reactor_dispatcher_closed_rebuilds_and_retries_once() {
    let hubs = seed("e2e-reactor", 100);
    let conf = sim_conf("e2e-reactor");
    let np = NameAndPartition::new("e2e-reactor", 0);

    hubs.inject_receive_failure(
        0,
        EventHubsError::Internal(format!(
            "task rejected from scheduler: {}",
            REACTOR_DISPATCHER_CLOSED
        )),
    );

    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    assert_eq!(sequence_numbers(&batch), (0..10).collect::<Vec<_>>());
    // The whole connection was rebuilt for the retry.
    assert_eq!(hubs.clients_created(), 2);
}

#[tokio::test]
async fn test_stolen_receiver_propagates_and_the_next_call_heals() {
    let hubs = seed("e2e-stolen", 100);
    let conf = sim_conf("e2e-stolen");
    let np = NameAndPartition::new("e2e-stolen", 0);

    hubs.inject_receive_failure(
        0,
        EventHubsError::ReceiverDisconnected("another epoch receiver owns the link".to_string()),
    );

    let err = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap_err();
    assert!(matches!(err, EventHubsError::ReceiverDisconnected(_)));
    // The connection survives; only the link is dead.
    assert_eq!(hubs.clients_created(), 1);

    // The rescheduled task finds the dead link and recreates it.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    assert_eq!(sequence_numbers(&batch), (0..10).collect::<Vec<_>>());
    assert_eq!(hubs.receivers_created(0), 2);
}

#[tokio::test]
async fn test_exclusive_mode_never_closes_the_old_receiver() {
    let hubs = seed("e2e-exclusive", 100);
    let conf = sim_conf("e2e-exclusive").set_use_exclusive_receiver(true);
    let np = NameAndPartition::new("e2e-exclusive", 0);

    ReceiverCache::receive(&conf, &np, &ctx(), 0, 5).await.unwrap();
    // Drift forces a rebuild; in epoch mode the service evicts the old
    // receiver, so the reader must not close it.
    let batch = ReceiverCache::receive(&conf, &np, &ctx(), 20, 3).await.unwrap();
    assert_eq!(sequence_numbers(&batch), vec![20, 21, 22]);
    assert_eq!(hubs.closes(0), 0);
    assert_eq!(hubs.receivers_created(0), 2);
}

#[tokio::test]
async fn test_non_exclusive_rebuild_closes_the_old_receiver() {
    let hubs = seed("e2e-nonexclusive", 100);
    let conf = sim_conf("e2e-nonexclusive");
    let np = NameAndPartition::new("e2e-nonexclusive", 0);

    ReceiverCache::receive(&conf, &np, &ctx(), 0, 5).await.unwrap();
    ReceiverCache::receive(&conf, &np, &ctx(), 20, 3).await.unwrap();
    assert_eq!(hubs.closes(0), 1);
}

/// Records every metric it sees and then fails the send, so one endpoint
/// covers both reporting properties: one metric per successful batch, and
/// emission failures never failing the batch.
struct RecordingEndpoint {
    seen: Mutex<Vec<PartitionPerformanceMetric>>,
}

#[async_trait]
impl DriverEndpoint for RecordingEndpoint {
    async fn send(&self, metric: PartitionPerformanceMetric) -> evstream::Result<()> {
        self.seen.lock().unwrap().push(metric);
        Err(EventHubsError::Internal("driver endpoint unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_slow_partition_adjustment_reports_once_per_batch() {
    let _hubs = seed("e2e-perf", 100);
    let conf = sim_conf("e2e-perf").set_slow_partition_adjustment(true);
    let np = NameAndPartition::new("e2e-perf", 0);

    let endpoint = Arc::new(RecordingEndpoint {
        seen: Mutex::new(Vec::new()),
    });
    register_driver_endpoint(
        evstream::PARTITION_PERFORMANCE_RECEIVER,
        endpoint.clone(),
    );

    ReceiverCache::receive(&conf, &np, &ctx(), 0, 10).await.unwrap();
    ReceiverCache::receive(&conf, &np, &ctx(), 10, 5).await.unwrap();

    // Delivery is fire-and-forget; give the spawned sends a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut metrics: Vec<_> = endpoint
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.partition == np)
        .cloned()
        .collect();
    metrics.sort_by_key(|m| m.batch_start_seq_no);
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].batch_start_seq_no, 0);
    assert_eq!(metrics[0].batch_count, 10);
    assert_eq!(metrics[1].batch_start_seq_no, 10);
    assert_eq!(metrics[1].batch_count, 5);
}

#[tokio::test]
async fn test_every_batch_is_the_exact_contiguous_range() {
    let _hubs = seed("e2e-ranges", 100);
    let conf = sim_conf("e2e-ranges");
    let np = NameAndPartition::new("e2e-ranges", 0);

    for (start, size) in [(0i64, 10u32), (10, 5), (15, 1), (16, 84)] {
        let batch = ReceiverCache::receive(&conf, &np, &ctx(), start, size).await.unwrap();
        let expected: Vec<i64> = (start..start + i64::from(size)).collect();
        assert_eq!(sequence_numbers(&batch), expected, "range [{}, {})", start, start + i64::from(size));
    }
}
