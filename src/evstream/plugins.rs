//! Pluggable observers and auth callbacks, resolved by name.
//!
//! Configuration carries plugin *names* (the `metricPlugin`,
//! `throttlingStatusPlugin` and `aadAuthCallback` options); whatever bundles
//! the plugins registers a factory for each name at process init. This keeps
//! the configuration surface stable while avoiding by-class-name reflection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::evstream::error::Result;
use crate::evstream::receiver::perf::PartitionPerformanceMetric;
use crate::evstream::types::NameAndPartition;

/// Observer of per-batch receive metrics on the worker.
pub trait MetricPlugin: Send + Sync {
    fn on_receive_metric(
        &self,
        partition: &NameAndPartition,
        batch_count: usize,
        batch_bytes: u64,
        elapsed: Duration,
    );
}

/// Observer of the driver-side partition performance status.
pub trait ThrottlingStatusPlugin: Send + Sync {
    fn on_partition_performance(&self, metrics: &[PartitionPerformanceMetric]);
}

/// Token provider for the AAD authentication path.
#[async_trait]
pub trait AadAuthenticationCallback: Send + Sync {
    async fn acquire_token(
        &self,
        audience: &str,
        authority: &str,
        params: &serde_json::Value,
    ) -> Result<String>;
}

pub type MetricPluginFactory = Arc<dyn Fn() -> Arc<dyn MetricPlugin> + Send + Sync>;
pub type ThrottlingStatusPluginFactory =
    Arc<dyn Fn() -> Arc<dyn ThrottlingStatusPlugin> + Send + Sync>;
pub type AadAuthenticationCallbackFactory =
    Arc<dyn Fn() -> Arc<dyn AadAuthenticationCallback> + Send + Sync>;

static METRIC_PLUGINS: OnceLock<Mutex<HashMap<String, MetricPluginFactory>>> = OnceLock::new();
static THROTTLING_PLUGINS: OnceLock<Mutex<HashMap<String, ThrottlingStatusPluginFactory>>> =
    OnceLock::new();
static AAD_CALLBACKS: OnceLock<Mutex<HashMap<String, AadAuthenticationCallbackFactory>>> =
    OnceLock::new();

fn metric_registry() -> &'static Mutex<HashMap<String, MetricPluginFactory>> {
    METRIC_PLUGINS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn throttling_registry() -> &'static Mutex<HashMap<String, ThrottlingStatusPluginFactory>> {
    THROTTLING_PLUGINS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn aad_registry() -> &'static Mutex<HashMap<String, AadAuthenticationCallbackFactory>> {
    AAD_CALLBACKS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_metric_plugin(name: &str, factory: MetricPluginFactory) {
    metric_registry()
        .lock()
        .unwrap()
        .insert(name.to_string(), factory);
}

pub fn register_throttling_status_plugin(name: &str, factory: ThrottlingStatusPluginFactory) {
    throttling_registry()
        .lock()
        .unwrap()
        .insert(name.to_string(), factory);
}

pub fn register_aad_authentication_callback(
    name: &str,
    factory: AadAuthenticationCallbackFactory,
) {
    aad_registry()
        .lock()
        .unwrap()
        .insert(name.to_string(), factory);
}

/// Instantiate the metric plugin registered under `name`, if any.
pub fn metric_plugin(name: &str) -> Option<Arc<dyn MetricPlugin>> {
    metric_registry().lock().unwrap().get(name).map(|f| f())
}

pub fn throttling_status_plugin(name: &str) -> Option<Arc<dyn ThrottlingStatusPlugin>> {
    throttling_registry().lock().unwrap().get(name).map(|f| f())
}

pub fn aad_authentication_callback(name: &str) -> Option<Arc<dyn AadAuthenticationCallback>> {
    aad_registry().lock().unwrap().get(name).map(|f| f())
}
