//! Event Hubs connection configuration.
//!
//! `EventHubsConf` is a case-insensitive string property bag with typed
//! accessors, mirroring the option names the surrounding framework passes
//! through. Everything that can be rejected is rejected by [`EventHubsConf::validate`]
//! up front; the receive path never raises configuration errors mid-batch.

use std::collections::HashMap;
use std::time::Duration;

use crate::evstream::error::{EventHubsError, Result};
use crate::evstream::plugins;

// Recognized option keys. Keys are lowercased on insert, so lookups use
// these canonical forms.
pub const CONNECTION_STRING_KEY: &str = "connectionstring";
pub const CONSUMER_GROUP_KEY: &str = "consumergroup";
pub const RECEIVER_TIMEOUT_KEY: &str = "receivertimeout";
pub const OPERATION_TIMEOUT_KEY: &str = "operationtimeout";
pub const MAX_SILENT_TIME_KEY: &str = "maxsilenttime";
pub const PREFETCH_COUNT_KEY: &str = "prefetchcount";
pub const THREAD_POOL_SIZE_KEY: &str = "threadpoolsize";
pub const USE_EXCLUSIVE_RECEIVER_KEY: &str = "useexclusivereceiver";
pub const SLOW_PARTITION_ADJUSTMENT_KEY: &str = "slowpartitionadjustment";
pub const MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY: &str = "maxacceptablebatchreceivetime";
pub const USE_AAD_AUTH_KEY: &str = "useaadauth";
pub const AAD_AUTH_CALLBACK_KEY: &str = "aadauthcallback";
pub const AAD_AUTH_CALLBACK_PARAMS_KEY: &str = "aadauthcallbackparams";
pub const METRIC_PLUGIN_KEY: &str = "metricplugin";
pub const THROTTLING_STATUS_PLUGIN_KEY: &str = "throttlingstatusplugin";
pub const DYNAMIC_PARTITION_DISCOVERY_KEY: &str = "dynamicpartitiondiscovery";
pub const USE_SIMULATED_CLIENT_KEY: &str = "usesimulatedclient";

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";
pub const DEFAULT_RECEIVER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SILENT_TIME: Duration = Duration::from_secs(600);
pub const MIN_SILENT_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_PREFETCH_COUNT: u32 = 500;
pub const PREFETCH_COUNT_MIN: u32 = 10;
pub const PREFETCH_COUNT_MAX: u32 = 999;
pub const DEFAULT_MAX_ACCEPTABLE_BATCH_RECEIVE_TIME: Duration = Duration::from_secs(30);

/// Parsed Event Hubs connection string.
///
/// Format: `Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=<policy>;SharedAccessKey=<key>;EntityPath=<hub>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: String,
    pub entity_path: Option<String>,
    pub key_name: Option<String>,
    pub key: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(EventHubsError::Configuration(
                "connection string is empty".to_string(),
            ));
        }

        let mut endpoint = None;
        let mut entity_path = None;
        let mut key_name = None;
        let mut key = None;

        for part in raw.split(';') {
            if let Some((k, v)) = part.split_once('=') {
                match k.trim() {
                    "Endpoint" => {
                        let host = v
                            .trim()
                            .strip_prefix("sb://")
                            .ok_or_else(|| {
                                EventHubsError::Configuration(
                                    "connection string Endpoint must start with 'sb://'"
                                        .to_string(),
                                )
                            })?
                            .trim_end_matches('/');
                        if host.is_empty() {
                            return Err(EventHubsError::Configuration(
                                "connection string Endpoint host is empty".to_string(),
                            ));
                        }
                        endpoint = Some(host.to_string());
                    }
                    "EntityPath" if !v.trim().is_empty() => {
                        entity_path = Some(v.trim().to_string());
                    }
                    "SharedAccessKeyName" if !v.trim().is_empty() => {
                        key_name = Some(v.trim().to_string());
                    }
                    "SharedAccessKey" if !v.trim().is_empty() => {
                        key = Some(v.trim().to_string());
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            endpoint: endpoint.ok_or_else(|| {
                EventHubsError::Configuration(
                    "connection string is missing Endpoint=sb://...".to_string(),
                )
            })?,
            entity_path,
            key_name,
            key,
        })
    }
}

/// Connection and receiver options for one event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHubsConf {
    settings: HashMap<String, String>,
}

impl EventHubsConf {
    pub fn new(connection_string: impl Into<String>) -> Self {
        let mut conf = Self {
            settings: HashMap::new(),
        };
        conf.set(CONNECTION_STRING_KEY, connection_string);
        conf
    }

    /// Insert a raw option. Keys are matched case-insensitively.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.settings.insert(key.to_lowercase(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(&key.to_lowercase()).map(String::as_str)
    }

    // Typed setters, chainable for construction in the callers and tests.

    pub fn set_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.set(CONSUMER_GROUP_KEY, consumer_group);
        self
    }

    pub fn set_receiver_timeout(mut self, timeout: Duration) -> Self {
        self.set(RECEIVER_TIMEOUT_KEY, timeout.as_millis().to_string());
        self
    }

    pub fn set_operation_timeout(mut self, timeout: Duration) -> Self {
        self.set(OPERATION_TIMEOUT_KEY, timeout.as_millis().to_string());
        self
    }

    pub fn set_max_silent_time(mut self, max_silent_time: Duration) -> Self {
        self.set(MAX_SILENT_TIME_KEY, max_silent_time.as_millis().to_string());
        self
    }

    pub fn set_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.set(PREFETCH_COUNT_KEY, prefetch_count.to_string());
        self
    }

    pub fn set_thread_pool_size(mut self, size: usize) -> Self {
        self.set(THREAD_POOL_SIZE_KEY, size.to_string());
        self
    }

    pub fn set_use_exclusive_receiver(mut self, exclusive: bool) -> Self {
        self.set(USE_EXCLUSIVE_RECEIVER_KEY, exclusive.to_string());
        self
    }

    pub fn set_slow_partition_adjustment(mut self, enabled: bool) -> Self {
        self.set(SLOW_PARTITION_ADJUSTMENT_KEY, enabled.to_string());
        self
    }

    pub fn set_max_acceptable_batch_receive_time(mut self, threshold: Duration) -> Self {
        self.set(
            MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY,
            threshold.as_millis().to_string(),
        );
        self
    }

    pub fn set_use_aad_auth(mut self, enabled: bool) -> Self {
        self.set(USE_AAD_AUTH_KEY, enabled.to_string());
        self
    }

    pub fn set_aad_auth_callback(mut self, callback_name: impl Into<String>) -> Self {
        self.set(AAD_AUTH_CALLBACK_KEY, callback_name);
        self
    }

    pub fn set_aad_auth_callback_params(mut self, params_json: impl Into<String>) -> Self {
        self.set(AAD_AUTH_CALLBACK_PARAMS_KEY, params_json);
        self
    }

    pub fn set_metric_plugin(mut self, plugin_name: impl Into<String>) -> Self {
        self.set(METRIC_PLUGIN_KEY, plugin_name);
        self
    }

    pub fn set_throttling_status_plugin(mut self, plugin_name: impl Into<String>) -> Self {
        self.set(THROTTLING_STATUS_PLUGIN_KEY, plugin_name);
        self
    }

    pub fn set_dynamic_partition_discovery(mut self, enabled: bool) -> Self {
        self.set(DYNAMIC_PARTITION_DISCOVERY_KEY, enabled.to_string());
        self
    }

    pub fn set_use_simulated_client(mut self, enabled: bool) -> Self {
        self.set(USE_SIMULATED_CLIENT_KEY, enabled.to_string());
        self
    }

    // Typed accessors.

    pub fn connection_string(&self) -> String {
        self.get(CONNECTION_STRING_KEY).unwrap_or("").to_string()
    }

    /// The event hub name, taken from the connection string's `EntityPath`.
    pub fn name(&self) -> Result<String> {
        ConnectionString::parse(&self.connection_string())?
            .entity_path
            .ok_or_else(|| {
                EventHubsError::Configuration(
                    "connection string must contain EntityPath=<event hub name>".to_string(),
                )
            })
    }

    pub fn consumer_group(&self) -> String {
        self.get(CONSUMER_GROUP_KEY)
            .unwrap_or(DEFAULT_CONSUMER_GROUP)
            .to_string()
    }

    pub fn receiver_timeout(&self) -> Duration {
        self.duration_or(RECEIVER_TIMEOUT_KEY, DEFAULT_RECEIVER_TIMEOUT)
    }

    pub fn operation_timeout(&self) -> Duration {
        self.duration_or(OPERATION_TIMEOUT_KEY, DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn max_silent_time(&self) -> Duration {
        self.duration_or(MAX_SILENT_TIME_KEY, DEFAULT_MAX_SILENT_TIME)
    }

    pub fn prefetch_count(&self) -> u32 {
        self.u32_or(PREFETCH_COUNT_KEY, DEFAULT_PREFETCH_COUNT)
    }

    pub fn thread_pool_size(&self) -> Option<usize> {
        self.get(THREAD_POOL_SIZE_KEY)
            .and_then(|v| match v.parse::<usize>() {
                Ok(size) => Some(size),
                Err(_) => {
                    log::warn!(
                        "Invalid value '{}' for {}, ignoring",
                        v,
                        THREAD_POOL_SIZE_KEY
                    );
                    None
                }
            })
    }

    pub fn use_exclusive_receiver(&self) -> bool {
        self.bool_or(USE_EXCLUSIVE_RECEIVER_KEY, false)
    }

    pub fn slow_partition_adjustment(&self) -> bool {
        self.bool_or(SLOW_PARTITION_ADJUSTMENT_KEY, false)
    }

    pub fn max_acceptable_batch_receive_time(&self) -> Duration {
        self.duration_or(
            MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY,
            DEFAULT_MAX_ACCEPTABLE_BATCH_RECEIVE_TIME,
        )
    }

    pub fn use_aad_auth(&self) -> bool {
        self.bool_or(USE_AAD_AUTH_KEY, false)
    }

    /// The AAD callback instance, resolved through the plugin registry.
    pub fn aad_auth_callback(&self) -> Result<Option<std::sync::Arc<dyn plugins::AadAuthenticationCallback>>> {
        match self.get(AAD_AUTH_CALLBACK_KEY) {
            None => Ok(None),
            Some(name) => plugins::aad_authentication_callback(name)
                .map(Some)
                .ok_or_else(|| {
                    EventHubsError::Configuration(format!(
                        "no AAD authentication callback registered under '{}'",
                        name
                    ))
                }),
        }
    }

    pub fn aad_auth_callback_params(&self) -> Result<serde_json::Value> {
        match self.get(AAD_AUTH_CALLBACK_PARAMS_KEY) {
            None => Ok(serde_json::Value::Null),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                EventHubsError::Configuration(format!(
                    "{} is not valid JSON: {}",
                    AAD_AUTH_CALLBACK_PARAMS_KEY, e
                ))
            }),
        }
    }

    pub fn metric_plugin(&self) -> Result<Option<std::sync::Arc<dyn plugins::MetricPlugin>>> {
        match self.get(METRIC_PLUGIN_KEY) {
            None => Ok(None),
            Some(name) => plugins::metric_plugin(name).map(Some).ok_or_else(|| {
                EventHubsError::Configuration(format!(
                    "no metric plugin registered under '{}'",
                    name
                ))
            }),
        }
    }

    pub fn throttling_status_plugin(
        &self,
    ) -> Result<Option<std::sync::Arc<dyn plugins::ThrottlingStatusPlugin>>> {
        match self.get(THROTTLING_STATUS_PLUGIN_KEY) {
            None => Ok(None),
            Some(name) => plugins::throttling_status_plugin(name)
                .map(Some)
                .ok_or_else(|| {
                    EventHubsError::Configuration(format!(
                        "no throttling status plugin registered under '{}'",
                        name
                    ))
                }),
        }
    }

    pub fn dynamic_partition_discovery(&self) -> bool {
        self.bool_or(DYNAMIC_PARTITION_DISCOVERY_KEY, false)
    }

    pub fn use_simulated_client(&self) -> bool {
        self.bool_or(USE_SIMULATED_CLIENT_KEY, false)
    }

    /// Reject every invalid combination up front.
    pub fn validate(&self) -> Result<()> {
        // Also checks the connection string shape and EntityPath presence.
        self.name()?;

        let prefetch = self.prefetch_count();
        if !(PREFETCH_COUNT_MIN..=PREFETCH_COUNT_MAX).contains(&prefetch) {
            return Err(EventHubsError::Configuration(format!(
                "{} must be within [{}, {}], got {}",
                PREFETCH_COUNT_KEY, PREFETCH_COUNT_MIN, PREFETCH_COUNT_MAX, prefetch
            )));
        }

        if self.receiver_timeout() > self.operation_timeout() {
            return Err(EventHubsError::Configuration(format!(
                "{} ({:?}) must not exceed {} ({:?})",
                RECEIVER_TIMEOUT_KEY,
                self.receiver_timeout(),
                OPERATION_TIMEOUT_KEY,
                self.operation_timeout()
            )));
        }

        if self.max_silent_time() < MIN_SILENT_TIME {
            return Err(EventHubsError::Configuration(format!(
                "{} must be at least {:?}, got {:?}",
                MAX_SILENT_TIME_KEY,
                MIN_SILENT_TIME,
                self.max_silent_time()
            )));
        }

        if self.use_aad_auth() {
            if self.get(AAD_AUTH_CALLBACK_KEY).is_none() {
                return Err(EventHubsError::Configuration(format!(
                    "{} requires {} to be set",
                    USE_AAD_AUTH_KEY, AAD_AUTH_CALLBACK_KEY
                )));
            }
            self.aad_auth_callback()?;
            self.aad_auth_callback_params()?;
        }

        self.metric_plugin()?;
        self.throttling_status_plugin()?;

        Ok(())
    }

    fn duration_or(&self, key: &str, default: Duration) -> Duration {
        match self.get(key) {
            None => default,
            Some(v) => match v.parse::<u64>() {
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    log::warn!("Invalid value '{}' for {}, using default", v, key);
                    default
                }
            },
        }
    }

    fn u32_or(&self, key: &str, default: u32) -> u32 {
        match self.get(key) {
            None => default,
            Some(v) => match v.parse::<u32>() {
                Ok(n) => n,
                Err(_) => {
                    log::warn!("Invalid value '{}' for {}, using default", v, key);
                    default
                }
            },
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => match v.parse::<bool>() {
                Ok(b) => b,
                Err(_) => {
                    log::warn!("Invalid value '{}' for {}, using default", v, key);
                    default
                }
            },
        }
    }
}
