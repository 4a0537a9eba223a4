//! Named plugin factories.
//!
//! Configuration refers to plugins by name ([`crate::config::METRIC_PLUGIN_KEY`]
//! and friends); whatever bundles the plugins registers a factory under that
//! name at process init. Plugins are instantiated once per configuration use.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_types::NameAndPartition;
use parking_lot::Mutex;

use crate::core::EventHubsError;
use crate::reporter::PartitionPerformanceMetric;

/// Observer of per-batch receive statistics on the worker.
pub trait MetricPlugin: Send + Sync + Debug {
    /// Called once per successful batch.
    fn on_receive_metric(
        &self,
        name_and_partition: &NameAndPartition,
        batch_count: usize,
        batch_size_bytes: usize,
        elapsed: Duration,
    );
}

/// Observer of partition performance on the driver's rate planner.
pub trait ThrottlingStatusPlugin: Send + Sync + Debug {
    /// Called by the driver for every reported metric.
    fn on_partition_performance(&self, metric: &PartitionPerformanceMetric);
}

/// Token source used when `useAadAuth` is configured.
#[async_trait]
pub trait AadAuthenticationCallback: Send + Sync + Debug {
    /// Acquire a bearer token for the given audience and authority.
    async fn acquire_token(
        &self,
        audience: &str,
        authority: &str,
    ) -> Result<String, EventHubsError>;
}

pub type MetricPluginFactory = Arc<dyn Fn() -> Arc<dyn MetricPlugin> + Send + Sync>;
pub type ThrottlingStatusPluginFactory =
    Arc<dyn Fn() -> Arc<dyn ThrottlingStatusPlugin> + Send + Sync>;
/// AAD callback factories receive the JSON parameters configured under
/// `aadAuthCallbackParams`.
pub type AadAuthenticationCallbackFactory =
    Arc<dyn Fn(&serde_json::Value) -> Arc<dyn AadAuthenticationCallback> + Send + Sync>;

static METRIC_PLUGINS: Mutex<BTreeMap<String, MetricPluginFactory>> =
    Mutex::new(BTreeMap::new());
static THROTTLING_PLUGINS: Mutex<BTreeMap<String, ThrottlingStatusPluginFactory>> =
    Mutex::new(BTreeMap::new());
static AAD_CALLBACKS: Mutex<BTreeMap<String, AadAuthenticationCallbackFactory>> =
    Mutex::new(BTreeMap::new());

/// Register a metric plugin factory under `name`.
pub fn register_metric_plugin(name: impl Into<String>, factory: MetricPluginFactory) {
    METRIC_PLUGINS.lock().insert(name.into(), factory);
}

/// Register a throttling status plugin factory under `name`.
pub fn register_throttling_status_plugin(
    name: impl Into<String>,
    factory: ThrottlingStatusPluginFactory,
) {
    THROTTLING_PLUGINS.lock().insert(name.into(), factory);
}

/// Register an AAD authentication callback factory under `name`.
pub fn register_aad_auth_callback(
    name: impl Into<String>,
    factory: AadAuthenticationCallbackFactory,
) {
    AAD_CALLBACKS.lock().insert(name.into(), factory);
}

/// Instantiate the metric plugin registered under `name`.
pub fn metric_plugin(name: &str) -> Option<Arc<dyn MetricPlugin>> {
    METRIC_PLUGINS.lock().get(name).map(|f| f())
}

/// Instantiate the throttling status plugin registered under `name`.
pub fn throttling_status_plugin(name: &str) -> Option<Arc<dyn ThrottlingStatusPlugin>> {
    THROTTLING_PLUGINS.lock().get(name).map(|f| f())
}

/// Instantiate the AAD callback registered under `name` with `params`.
pub fn aad_auth_callback(
    name: &str,
    params: &serde_json::Value,
) -> Option<Arc<dyn AadAuthenticationCallback>> {
    AAD_CALLBACKS.lock().get(name).map(|f| f(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Debug, Default)]
    struct CountingMetricPlugin {
        batches: PlMutex<Vec<usize>>,
    }

    impl MetricPlugin for CountingMetricPlugin {
        fn on_receive_metric(
            &self,
            _name_and_partition: &NameAndPartition,
            batch_count: usize,
            _batch_size_bytes: usize,
            _elapsed: Duration,
        ) {
            self.batches.lock().push(batch_count);
        }
    }

    #[derive(Debug)]
    struct StaticToken(String);

    #[async_trait]
    impl AadAuthenticationCallback for StaticToken {
        async fn acquire_token(
            &self,
            _audience: &str,
            _authority: &str,
        ) -> Result<String, EventHubsError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn unknown_names_resolve_to_none() {
        assert!(metric_plugin("tests.registry.not-registered").is_none());
        assert!(throttling_status_plugin("tests.registry.not-registered").is_none());
    }

    #[test]
    fn factories_produce_fresh_instances() {
        register_metric_plugin("tests.registry.counting", {
            Arc::new(|| Arc::new(CountingMetricPlugin::default()) as _)
        });

        let a = metric_plugin("tests.registry.counting").unwrap();
        let b = metric_plugin("tests.registry.counting").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn aad_callbacks_receive_their_params() {
        register_aad_auth_callback("tests.registry.static-token", {
            Arc::new(|params: &serde_json::Value| {
                let token = params["token"].as_str().unwrap_or("none").to_string();
                Arc::new(StaticToken(token)) as _
            })
        });

        let params = serde_json::json!({ "token": "tok-123" });
        let callback = aad_auth_callback("tests.registry.static-token", &params).unwrap();
        let token = callback
            .acquire_token("https://eventhubs.azure.net/", "contoso")
            .await
            .unwrap();
        assert_eq!(token, "tok-123");
    }
}
