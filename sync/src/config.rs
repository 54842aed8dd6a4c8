//! Sync configuration.
//!
//! [`SyncConfig`] is the plain-data part and deserializes from camelCase
//! JSON. [`SyncOptions`] adds the adapters and error hooks.

use crate::{
    adapter::{LocalAdapter, RemoteAdapter},
    error::SyncError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{FieldMap, QueryByModified, UnmappedKeys};

/// Serialize a [`Duration`] as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Constant,
    Exponential,
}

/// Retry policy for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub times: u32,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub backoff: Backoff,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            times: 3,
            delay: Duration::from_millis(500),
            backoff: Backoff::Constant,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// The same policy with exponential backoff.
    pub fn incremental(self) -> Self {
        Self {
            backoff: Backoff::Exponential,
            ..self
        }
    }
}

/// What happens to local edits made while the remote is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OfflineRepr", into = "OfflineRepr")]
pub enum OfflineBehavior {
    /// Unsaved edits live only in the local table
    #[default]
    Off,
    /// Unsaved edits are recorded in metadata and resent on next start
    Retry,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OfflineRepr {
    Flag(bool),
    Mode(String),
}

impl TryFrom<OfflineRepr> for OfflineBehavior {
    type Error = String;

    fn try_from(repr: OfflineRepr) -> Result<Self, Self::Error> {
        match repr {
            OfflineRepr::Flag(false) => Ok(OfflineBehavior::Off),
            OfflineRepr::Flag(true) => Ok(OfflineBehavior::Retry),
            OfflineRepr::Mode(mode) if mode == "retry" => Ok(OfflineBehavior::Retry),
            OfflineRepr::Mode(mode) => Err(format!("unknown offline behavior `{mode}`")),
        }
    }
}

impl From<OfflineBehavior> for OfflineRepr {
    fn from(behavior: OfflineBehavior) -> Self {
        match behavior {
            OfflineBehavior::Off => OfflineRepr::Flag(false),
            OfflineBehavior::Retry => OfflineRepr::Mode("retry".into()),
        }
    }
}

/// Plain-data sync settings for one root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Local table name; no local persistence when unset
    pub local: Option<String>,
    /// Debounce window for outgoing saves
    #[serde(with = "duration_ms")]
    pub change_timeout: Duration,
    pub retry: RetryConfig,
    pub offline_behavior: OfflineBehavior,
    pub query_by_modified: QueryByModified,
    /// Save even though the remote listen is failing
    pub allow_set_if_error: bool,
    /// Upper bound for one remote write
    pub max_batch_bytes: usize,
    /// Key renaming from the in-memory to the stored shape
    pub field_transforms: Option<FieldMap>,
    pub unmapped_keys: UnmappedKeys,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local: None,
            change_timeout: Duration::from_millis(300),
            retry: RetryConfig::default(),
            offline_behavior: OfflineBehavior::Off,
            query_by_modified: QueryByModified::Disabled,
            allow_set_if_error: false,
            max_batch_bytes: 1024 * 1024,
            field_transforms: None,
            unmapped_keys: UnmappedKeys::PassThrough,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Error callback.
pub type ErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Callbacks invoked when sync work fails.
#[derive(Clone, Default)]
pub struct SyncHooks {
    /// Local or remote load failed
    pub on_get_error: Option<ErrorHook>,
    /// A save failed after exhausting retries
    pub on_set_error: Option<ErrorHook>,
    /// Any other failure, such as a broken listen stream
    pub on_error: Option<ErrorHook>,
}

impl SyncHooks {
    pub(crate) fn get_error(&self, err: &SyncError) {
        Self::call(self.on_get_error.as_ref().or(self.on_error.as_ref()), err);
    }

    pub(crate) fn set_error(&self, err: &SyncError) {
        Self::call(self.on_set_error.as_ref().or(self.on_error.as_ref()), err);
    }

    pub(crate) fn error(&self, err: &SyncError) {
        Self::call(self.on_error.as_ref(), err);
    }

    fn call(hook: Option<&ErrorHook>, err: &SyncError) {
        if let Some(hook) = hook {
            hook(err);
        }
    }
}

impl std::fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHooks")
            .field("on_get_error", &self.on_get_error.is_some())
            .field("on_set_error", &self.on_set_error.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Everything needed to sync one root.
#[derive(Clone, Default)]
pub struct SyncOptions {
    pub config: SyncConfig,
    /// Overrides the engine's default local adapter
    pub local: Option<Arc<dyn LocalAdapter>>,
    pub remote: Option<Arc<dyn RemoteAdapter>>,
    pub hooks: SyncHooks,
}

impl SyncOptions {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Persist locally under `table`.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.config.local = Some(table.into());
        self
    }

    pub fn local_adapter(mut self, adapter: Arc<dyn LocalAdapter>) -> Self {
        self.local = Some(adapter);
        self
    }

    pub fn remote(mut self, adapter: Arc<dyn RemoteAdapter>) -> Self {
        self.remote = Some(adapter);
        self
    }

    pub fn change_timeout(mut self, timeout: Duration) -> Self {
        self.config.change_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn offline_behavior(mut self, behavior: OfflineBehavior) -> Self {
        self.config.offline_behavior = behavior;
        self
    }

    pub fn query_by_modified(mut self, query: QueryByModified) -> Self {
        self.config.query_by_modified = query;
        self
    }

    pub fn field_transforms(mut self, map: FieldMap) -> Self {
        self.config.field_transforms = Some(map);
        self
    }

    pub fn allow_set_if_error(mut self, allow: bool) -> Self {
        self.config.allow_set_if_error = allow;
        self
    }

    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    pub fn on_get_error(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.hooks.on_get_error = Some(Arc::new(hook));
        self
    }

    pub fn on_set_error(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.hooks.on_set_error = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("config", &self.config)
            .field("local", &self.local.is_some())
            .field("remote", &self.remote.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.change_timeout, Duration::from_millis(300));
        assert_eq!(config.retry.times, 3);
        assert_eq!(config.retry.delay, Duration::from_millis(500));
        assert_eq!(config.offline_behavior, OfflineBehavior::Off);
        assert!(!config.query_by_modified.is_enabled());
    }

    #[test]
    fn deserialize_camel_case() {
        let config = SyncConfig::from_json(
            r#"{
                "local": "todos",
                "changeTimeout": 50,
                "retry": {"times": 5, "delay": 100, "backoff": "exponential"},
                "offlineBehavior": "retry",
                "queryByModified": {"todos": true},
                "allowSetIfError": true,
                "fieldTransforms": {"text": "t"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.local.as_deref(), Some("todos"));
        assert_eq!(config.change_timeout, Duration::from_millis(50));
        assert_eq!(config.retry.times, 5);
        assert_eq!(config.retry.backoff, Backoff::Exponential);
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.offline_behavior, OfflineBehavior::Retry);
        assert!(config.allow_set_if_error);
        assert!(config.field_transforms.is_some());
        assert_eq!(config.max_batch_bytes, 1024 * 1024);
    }

    #[test]
    fn offline_behavior_forms() {
        let off: OfflineBehavior = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(off, OfflineBehavior::Off);
        let retry: OfflineBehavior = serde_json::from_value(json!("retry")).unwrap();
        assert_eq!(retry, OfflineBehavior::Retry);
        assert!(serde_json::from_value::<OfflineBehavior>(json!("sometimes")).is_err());
        assert_eq!(serde_json::to_value(OfflineBehavior::Retry).unwrap(), json!("retry"));
    }

    #[test]
    fn retry_delays() {
        let constant = RetryConfig::default();
        assert_eq!(constant.delay_for(1), Duration::from_millis(500));
        assert_eq!(constant.delay_for(4), Duration::from_millis(500));

        let exponential = RetryConfig {
            max_delay: Duration::from_secs(2),
            ..RetryConfig::default()
        }
        .incremental();
        assert_eq!(exponential.delay_for(1), Duration::from_millis(500));
        assert_eq!(exponential.delay_for(2), Duration::from_millis(1000));
        assert_eq!(exponential.delay_for(3), Duration::from_millis(2000));
        assert_eq!(exponential.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn builder_sets_fields() {
        let options = SyncOptions::default()
            .table("notes")
            .change_timeout(Duration::from_millis(10))
            .allow_set_if_error(true)
            .on_set_error(|_| {});
        assert_eq!(options.config.local.as_deref(), Some("notes"));
        assert!(options.hooks.on_set_error.is_some());
        assert!(options.config.allow_set_if_error);
    }
}
