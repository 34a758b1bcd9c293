//! Best-effort partition performance reporting to the driver.
//!
//! When slow-partition adjustment is enabled, every successful batch sends
//! one `PartitionPerformanceMetric` to the driver-side endpoint registered
//! under [`PARTITION_PERFORMANCE_RECEIVER`]. The send is fire-and-forget:
//! the batch never blocks on it and a failed send is only logged.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::evstream::error::Result;
use crate::evstream::types::{NameAndPartition, TaskContext};

/// Well-known name of the driver-side endpoint.
pub const PARTITION_PERFORMANCE_RECEIVER: &str = "PartitionPerformanceReceiver";

/// One-way message describing how one batch went, enough for the driver to
/// build an adaptive rate plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPerformanceMetric {
    pub partition: NameAndPartition,
    pub task: TaskContext,
    pub batch_start_seq_no: i64,
    pub batch_count: u32,
    pub elapsed_ms: u64,
}

/// One-way driver RPC handle, supplied by the host framework.
#[async_trait]
pub trait DriverEndpoint: Send + Sync {
    async fn send(&self, metric: PartitionPerformanceMetric) -> Result<()>;
}

static ENDPOINTS: OnceLock<Mutex<HashMap<String, Arc<dyn DriverEndpoint>>>> = OnceLock::new();

fn endpoints() -> &'static Mutex<HashMap<String, Arc<dyn DriverEndpoint>>> {
    ENDPOINTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a driver endpoint; the host runtime does this at process init.
pub fn register_driver_endpoint(name: &str, endpoint: Arc<dyn DriverEndpoint>) {
    endpoints().lock().unwrap().insert(name.to_string(), endpoint);
}

pub fn driver_endpoint(name: &str) -> Option<Arc<dyn DriverEndpoint>> {
    endpoints().lock().unwrap().get(name).cloned()
}

/// Fire-and-forget notifier bound to one endpoint name.
#[derive(Clone)]
pub struct PerfReporter {
    endpoint_name: String,
}

impl PerfReporter {
    pub fn new() -> Self {
        Self {
            endpoint_name: PARTITION_PERFORMANCE_RECEIVER.to_string(),
        }
    }

    pub fn report(&self, metric: PartitionPerformanceMetric) {
        let Some(endpoint) = driver_endpoint(&self.endpoint_name) else {
            log::debug!(
                "no '{}' endpoint registered; dropping the performance metric for {}",
                self.endpoint_name,
                metric.partition
            );
            return;
        };
        tokio::spawn(async move {
            let partition = metric.partition.clone();
            if let Err(err) = endpoint.send(metric).await {
                log::error!(
                    "failed to report partition performance for {}: {}",
                    partition,
                    err
                );
            }
        });
    }
}

impl Default for PerfReporter {
    fn default() -> Self {
        Self::new()
    }
}
