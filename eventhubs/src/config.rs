//! Connector configuration.
//!
//! [`EventHubsConf`] is a case-insensitive string bag: the compute framework
//! assembles it on the driver, ships it to workers as JSON, and every worker
//! reads it through the typed accessors here. Unknown keys are carried along
//! untouched so old workers tolerate options they do not understand.
//!
//! All validation happens in [`EventHubsConf::validate`], at configuration
//! time. The receive path assumes a validated bag and never re-checks.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Option keys, lowercased. The public surface accepts any casing.
pub const CONNECTION_STRING_KEY: &str = "eventhubs.connectionstring";
pub const CONSUMER_GROUP_KEY: &str = "eventhubs.consumergroup";
pub const RECEIVER_TIMEOUT_KEY: &str = "eventhubs.receivertimeout";
pub const OPERATION_TIMEOUT_KEY: &str = "eventhubs.operationtimeout";
pub const MAX_SILENT_TIME_KEY: &str = "eventhubs.maxsilenttime";
pub const PREFETCH_COUNT_KEY: &str = "eventhubs.prefetchcount";
pub const THREAD_POOL_SIZE_KEY: &str = "eventhubs.threadpoolsize";
pub const USE_EXCLUSIVE_RECEIVER_KEY: &str = "eventhubs.useexclusivereceiver";
pub const SLOW_PARTITION_ADJUSTMENT_KEY: &str = "eventhubs.slowpartitionadjustment";
pub const MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY: &str = "eventhubs.maxacceptablebatchreceivetime";
pub const USE_AAD_AUTH_KEY: &str = "eventhubs.useaadauth";
pub const AAD_AUTH_CALLBACK_KEY: &str = "eventhubs.aadauthcallback";
pub const AAD_AUTH_CALLBACK_PARAMS_KEY: &str = "eventhubs.aadauthcallbackparams";
pub const METRIC_PLUGIN_KEY: &str = "eventhubs.metricplugin";
pub const THROTTLING_STATUS_PLUGIN_KEY: &str = "eventhubs.throttlingstatusplugin";
pub const DYNAMIC_PARTITION_DISCOVERY_KEY: &str = "eventhubs.dynamicpartitiondiscovery";
pub const USE_SIMULATED_CLIENT_KEY: &str = "eventhubs.usesimulatedclient";

/// Consumer group used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Default per-event wait.
pub const DEFAULT_RECEIVER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for a single SDK operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default threshold after which an idle reader is recreated.
pub const DEFAULT_MAX_SILENT_TIME: Duration = Duration::from_secs(300);

/// Lower bound on the idle-recreate threshold.
pub const MIN_SILENT_TIME: Duration = Duration::from_secs(30);

/// Default SDK prefetch advisory.
pub const DEFAULT_PREFETCH_COUNT: u32 = 500;

/// Bounds on the prefetch advisory accepted by the service.
pub const PREFETCH_COUNT_MIN: u32 = 10;
pub const PREFETCH_COUNT_MAX: u32 = 999;

/// Default driver-side threshold for flagging a slow partition.
pub const DEFAULT_MAX_ACCEPTABLE_BATCH_RECEIVE_TIME: Duration = Duration::from_secs(30);

/// Configuration error, raised by [`EventHubsConf::validate`] and never
/// mid-batch.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[snafu(display("connection string does not contain an EntityPath"))]
    MissingEntityPath,

    #[snafu(display("option '{key}' has unparseable value '{value}'"))]
    InvalidOption { key: String, value: String },

    #[snafu(display(
        "prefetch count {count} outside [{PREFETCH_COUNT_MIN}, {PREFETCH_COUNT_MAX}]"
    ))]
    PrefetchOutOfRange { count: u32 },

    #[snafu(display(
        "receiver timeout {receiver:?} exceeds operation timeout {operation:?}"
    ))]
    ReceiverTimeoutTooLarge {
        receiver: Duration,
        operation: Duration,
    },

    #[snafu(display("max silent time {value:?} below minimum {MIN_SILENT_TIME:?}"))]
    SilentTimeTooSmall { value: Duration },
}

/// Configuration bag for one Event Hubs stream.
///
/// Keys are lowercased on insertion so lookups are case-insensitive, the way
/// the framework's own option handling behaves.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHubsConf {
    settings: HashMap<String, String>,
}

impl Debug for EventHubsConf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the connection string embeds credentials
        let mut redacted: Vec<(&str, &str)> = self
            .settings
            .iter()
            .map(|(k, v)| {
                if k == CONNECTION_STRING_KEY {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        redacted.sort_unstable();
        f.debug_map().entries(redacted).finish()
    }
}

impl EventHubsConf {
    /// Create a configuration for the given connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        let mut conf = Self::default();
        conf.set(CONNECTION_STRING_KEY, connection_string.into());
        conf
    }

    /// Set an option. The key is lowercased.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) -> &mut Self {
        self.settings
            .insert(key.as_ref().to_lowercase(), value.to_string());
        self
    }

    /// Look up an option by (case-insensitive) key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(&key.to_lowercase()).map(String::as_str)
    }

    /// The raw AMQP connection string.
    pub fn connection_string(&self) -> &str {
        self.get(CONNECTION_STRING_KEY).unwrap_or_default()
    }

    /// The event hub name, extracted from the connection string's
    /// `EntityPath`.
    pub fn event_hub_name(&self) -> Option<&str> {
        connection_string_entity_path(self.connection_string())
    }

    /// Consumer group; independent cursors per group.
    pub fn consumer_group(&self) -> &str {
        self.get(CONSUMER_GROUP_KEY).unwrap_or(DEFAULT_CONSUMER_GROUP)
    }

    /// Per-event wait before the SDK reports an empty delivery.
    pub fn receiver_timeout(&self) -> Duration {
        self.duration_setting(RECEIVER_TIMEOUT_KEY)
            .unwrap_or(DEFAULT_RECEIVER_TIMEOUT)
    }

    /// Wall-clock budget for a single SDK operation.
    pub fn operation_timeout(&self) -> Duration {
        self.duration_setting(OPERATION_TIMEOUT_KEY)
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT)
    }

    /// Idle threshold after which a reader is recreated rather than trusted.
    pub fn max_silent_time(&self) -> Duration {
        self.duration_setting(MAX_SILENT_TIME_KEY)
            .unwrap_or(DEFAULT_MAX_SILENT_TIME)
    }

    /// SDK prefetch advisory.
    pub fn prefetch_count(&self) -> u32 {
        self.get(PREFETCH_COUNT_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PREFETCH_COUNT)
    }

    /// Requested SDK executor size, when the transport exposes one.
    pub fn thread_pool_size(&self) -> Option<usize> {
        self.get(THREAD_POOL_SIZE_KEY).and_then(|v| v.parse().ok())
    }

    /// Open epoch (exclusive) receivers, evicting any other receiver on the
    /// same partition and consumer group.
    pub fn use_exclusive_receiver(&self) -> bool {
        self.bool_setting(USE_EXCLUSIVE_RECEIVER_KEY)
    }

    /// Emit per-batch performance metrics to the driver.
    pub fn slow_partition_adjustment(&self) -> bool {
        self.bool_setting(SLOW_PARTITION_ADJUSTMENT_KEY)
    }

    /// Driver-side threshold for flagging a slow partition.
    pub fn max_acceptable_batch_receive_time(&self) -> Duration {
        self.duration_setting(MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY)
            .unwrap_or(DEFAULT_MAX_ACCEPTABLE_BATCH_RECEIVE_TIME)
    }

    /// Authenticate through an AAD callback instead of the shared key.
    pub fn use_aad_auth(&self) -> bool {
        self.bool_setting(USE_AAD_AUTH_KEY)
    }

    /// Registered name of the AAD authentication callback.
    pub fn aad_auth_callback(&self) -> Option<&str> {
        self.get(AAD_AUTH_CALLBACK_KEY)
    }

    /// JSON-serialized parameters handed to the AAD callback factory.
    pub fn aad_auth_callback_params(&self) -> Option<&str> {
        self.get(AAD_AUTH_CALLBACK_PARAMS_KEY)
    }

    /// Registered name of the metric plugin.
    pub fn metric_plugin(&self) -> Option<&str> {
        self.get(METRIC_PLUGIN_KEY)
    }

    /// Registered name of the throttling status plugin.
    pub fn throttling_status_plugin(&self) -> Option<&str> {
        self.get(THROTTLING_STATUS_PLUGIN_KEY)
    }

    /// Informational: the framework re-lists partitions between batches.
    pub fn dynamic_partition_discovery(&self) -> bool {
        self.bool_setting(DYNAMIC_PARTITION_DISCOVERY_KEY)
    }

    /// Use the in-memory simulated service instead of a live connection.
    pub fn use_simulated_client(&self) -> bool {
        self.bool_setting(USE_SIMULATED_CLIENT_KEY)
    }

    // chainable setters for the options the receive path reads

    pub fn set_consumer_group(&mut self, group: impl Into<String>) -> &mut Self {
        self.set(CONSUMER_GROUP_KEY, group.into())
    }

    pub fn set_receiver_timeout(&mut self, d: Duration) -> &mut Self {
        self.set(RECEIVER_TIMEOUT_KEY, d.as_secs())
    }

    pub fn set_operation_timeout(&mut self, d: Duration) -> &mut Self {
        self.set(OPERATION_TIMEOUT_KEY, d.as_secs())
    }

    pub fn set_max_silent_time(&mut self, d: Duration) -> &mut Self {
        self.set(MAX_SILENT_TIME_KEY, d.as_secs())
    }

    pub fn set_prefetch_count(&mut self, count: u32) -> &mut Self {
        self.set(PREFETCH_COUNT_KEY, count)
    }

    pub fn set_use_exclusive_receiver(&mut self, on: bool) -> &mut Self {
        self.set(USE_EXCLUSIVE_RECEIVER_KEY, on)
    }

    pub fn set_slow_partition_adjustment(&mut self, on: bool) -> &mut Self {
        self.set(SLOW_PARTITION_ADJUSTMENT_KEY, on)
    }

    pub fn set_use_simulated_client(&mut self, on: bool) -> &mut Self {
        self.set(USE_SIMULATED_CLIENT_KEY, on)
    }

    pub fn set_metric_plugin(&mut self, name: impl Into<String>) -> &mut Self {
        self.set(METRIC_PLUGIN_KEY, name.into())
    }

    /// Check every recognized option.
    ///
    /// Strict counterpart of the lenient accessors above: a value that would
    /// silently fall back to its default here becomes an error instead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_hub_name().is_none() {
            return Err(ConfigError::MissingEntityPath);
        }

        for key in [
            RECEIVER_TIMEOUT_KEY,
            OPERATION_TIMEOUT_KEY,
            MAX_SILENT_TIME_KEY,
            MAX_ACCEPTABLE_BATCH_RECEIVE_TIME_KEY,
        ] {
            self.strict_parse::<u64>(key)?;
        }
        self.strict_parse::<u32>(PREFETCH_COUNT_KEY)?;
        self.strict_parse::<usize>(THREAD_POOL_SIZE_KEY)?;
        for key in [
            USE_EXCLUSIVE_RECEIVER_KEY,
            SLOW_PARTITION_ADJUSTMENT_KEY,
            USE_AAD_AUTH_KEY,
            DYNAMIC_PARTITION_DISCOVERY_KEY,
            USE_SIMULATED_CLIENT_KEY,
        ] {
            self.strict_parse::<bool>(key)?;
        }

        let prefetch = self.prefetch_count();
        if !(PREFETCH_COUNT_MIN..=PREFETCH_COUNT_MAX).contains(&prefetch) {
            return Err(ConfigError::PrefetchOutOfRange { count: prefetch });
        }

        let receiver = self.receiver_timeout();
        let operation = self.operation_timeout();
        if receiver > operation {
            return Err(ConfigError::ReceiverTimeoutTooLarge { receiver, operation });
        }

        let silent = self.max_silent_time();
        if silent < MIN_SILENT_TIME {
            return Err(ConfigError::SilentTimeTooSmall { value: silent });
        }

        if let Some(params) = self.aad_auth_callback_params() {
            if serde_json::from_str::<serde_json::Value>(params).is_err() {
                return Err(ConfigError::InvalidOption {
                    key: AAD_AUTH_CALLBACK_PARAMS_KEY.to_string(),
                    value: params.to_string(),
                });
            }
        }

        Ok(())
    }

    fn duration_setting(&self, key: &str) -> Option<Duration> {
        self.get(key)?.parse::<u64>().ok().map(Duration::from_secs)
    }

    fn bool_setting(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn strict_parse<T: std::str::FromStr>(&self, key: &str) -> Result<(), ConfigError> {
        match self.get(key) {
            Some(v) if v.parse::<T>().is_err() => Err(ConfigError::InvalidOption {
                key: key.to_string(),
                value: v.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Extract the `EntityPath` component of a `key=value;` connection string.
pub(crate) fn connection_string_entity_path(s: &str) -> Option<&str> {
    s.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim().eq_ignore_ascii_case("EntityPath") && !v.is_empty()).then_some(v.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str =
        "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v;EntityPath=sensors";

    #[test]
    fn defaults() {
        let conf = EventHubsConf::new(CONN);
        assert_eq!(conf.event_hub_name(), Some("sensors"));
        assert_eq!(conf.consumer_group(), DEFAULT_CONSUMER_GROUP);
        assert_eq!(conf.receiver_timeout(), DEFAULT_RECEIVER_TIMEOUT);
        assert_eq!(conf.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(conf.prefetch_count(), DEFAULT_PREFETCH_COUNT);
        assert!(!conf.use_exclusive_receiver());
        assert!(!conf.slow_partition_adjustment());
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set("EventHubs.ConsumerGroup", "telemetry");
        assert_eq!(conf.consumer_group(), "telemetry");
        assert_eq!(conf.get("eventhubs.CONSUMERGROUP"), Some("telemetry"));
    }

    #[test]
    fn missing_entity_path_is_rejected() {
        let conf = EventHubsConf::new("Endpoint=sb://ns.servicebus.windows.net/");
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::MissingEntityPath)
        ));
    }

    #[test]
    fn prefetch_bounds_are_enforced() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set_prefetch_count(5);
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::PrefetchOutOfRange { count: 5 })
        ));

        conf.set_prefetch_count(1_000);
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::PrefetchOutOfRange { count: 1_000 })
        ));

        conf.set_prefetch_count(999);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn receiver_timeout_must_not_exceed_operation_timeout() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set_receiver_timeout(Duration::from_secs(120));
        conf.set_operation_timeout(Duration::from_secs(60));
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::ReceiverTimeoutTooLarge { .. })
        ));
    }

    #[test]
    fn silent_time_has_a_floor() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set_max_silent_time(Duration::from_secs(5));
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::SilentTimeTooSmall { .. })
        ));
    }

    #[test]
    fn unparseable_values_fail_validation_not_access() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set(PREFETCH_COUNT_KEY, "lots");
        // lenient accessor falls back
        assert_eq!(conf.prefetch_count(), DEFAULT_PREFETCH_COUNT);
        // strict validation reports the typo
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::InvalidOption { .. })
        ));
    }

    #[test]
    fn aad_params_must_be_json() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set(AAD_AUTH_CALLBACK_PARAMS_KEY, "{not json");
        assert!(matches!(
            conf.validate(),
            Err(ConfigError::InvalidOption { .. })
        ));

        conf.set(AAD_AUTH_CALLBACK_PARAMS_KEY, r#"{"tenant": "contoso"}"#);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn serde_roundtrip_preserves_settings() {
        let mut conf = EventHubsConf::new(CONN);
        conf.set_consumer_group("telemetry")
            .set_prefetch_count(300)
            .set_use_exclusive_receiver(true);

        let json = serde_json::to_string(&conf).unwrap();
        let back: EventHubsConf = serde_json::from_str(&json).unwrap();
        assert_eq!(conf, back);
        assert_eq!(back.consumer_group(), "telemetry");
        assert_eq!(back.prefetch_count(), 300);
        assert!(back.use_exclusive_receiver());
    }

    #[test]
    fn debug_redacts_credentials() {
        let conf = EventHubsConf::new(CONN);
        let printed = format!("{conf:?}");
        assert!(!printed.contains("SharedAccessKey"));
        assert!(printed.contains("<redacted>"));
    }
}
