//! Top-level engine configuration (spec §9 ambient stack): namespace
//! binding, ingestion tuning, retention, and backup/restore policy in one
//! deserializable value, with `with_*` builders for programmatic wiring.

use crate::backup::RetentionPolicy;
use crate::ingestion::IngestionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide configuration. Rejects unknown keys so a typo in a config
/// file surfaces at load time rather than being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraphKitConfig {
    /// Tenant/namespace name bound at process start (see [`crate::namespace::NamespaceScope`]).
    pub namespace: String,
    pub ingestion: IngestionConfig,
    pub backup: BackupSettings,
    pub history: HistorySettings,
}

impl Default for GraphKitConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            ingestion: IngestionConfig::default(),
            backup: BackupSettings::default(),
            history: HistorySettings::default(),
        }
    }
}

impl GraphKitConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Default::default() }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_ingestion(mut self, ingestion: IngestionConfig) -> Self {
        self.ingestion = ingestion;
        self
    }

    #[must_use]
    pub fn with_backup(mut self, backup: BackupSettings) -> Self {
        self.backup = backup;
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: HistorySettings) -> Self {
        self.history = history;
        self
    }

    /// Reject combinations that `Default` never produces but a hand-edited
    /// config file might.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        if self.history.checkpoint_max_hops == 0 {
            return Err("history.checkpoint_max_hops must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Backup/restore policy (spec §4.9), serializable independently of the
/// runtime [`crate::backup::BackupCoordinator`] it configures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackupSettings {
    pub require_second_approval: bool,
    #[serde(with = "duration_secs")]
    pub restore_token_ttl: Duration,
    pub max_age_days: Option<i64>,
    pub max_entries: Option<usize>,
    pub max_total_size_bytes: Option<u64>,
    pub delete_artifacts_on_expiry: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            require_second_approval: false,
            restore_token_ttl: Duration::from_secs(15 * 60),
            max_age_days: Some(90),
            max_entries: Some(50),
            max_total_size_bytes: None,
            delete_artifacts_on_expiry: true,
        }
    }
}

impl BackupSettings {
    #[must_use]
    pub fn with_require_second_approval(mut self, required: bool) -> Self {
        self.require_second_approval = required;
        self
    }

    #[must_use]
    pub fn with_retention_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: self.max_age_days,
            max_entries: self.max_entries,
            max_total_size_bytes: self.max_total_size_bytes,
            delete_artifacts: self.delete_artifacts_on_expiry,
        }
    }
}

/// Temporal-engine policy (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HistorySettings {
    pub checkpoint_max_hops: u32,
    pub prune_inactive_after_days: i64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            checkpoint_max_hops: crate::history::MAX_CHECKPOINT_HOPS,
            prune_inactive_after_days: 180,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GraphKitConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let config = GraphKitConfig::new("   ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = GraphKitConfig::default().with_namespace("acme");
        let json = serde_json::to_string(&config).unwrap();
        let back: GraphKitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.namespace, "acme");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let json = serde_json::json!({ "namespace": "acme", "bogus": true }).to_string();
        assert!(serde_json::from_str::<GraphKitConfig>(&json).is_err());
    }

    #[test]
    fn backup_settings_builder_sets_retention() {
        let settings = BackupSettings::default().with_retention_max_entries(5);
        assert_eq!(settings.retention_policy().max_entries, Some(5));
    }
}
