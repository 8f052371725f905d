//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use wt_core::AggregationConfig;
use wt_db::MaintenanceConfig;
use wt_db::store::DEFAULT_BATCH_SIZE;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
    pub aggregation: AggregationSettings,
    pub maintenance: MaintenanceConfig,
}

/// Read-path tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub runtime_cap_factor: f64,
    /// Keys per `IN (...)` query when a report is scoped to items or users.
    pub batch_size: usize,
    /// Leave live TV out of reports unless `--include-live-tv` is given.
    pub exclude_live_tv: bool,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            runtime_cap_factor: AggregationConfig::default().runtime_cap_factor,
            batch_size: DEFAULT_BATCH_SIZE,
            exclude_live_tv: true,
        }
    }
}

impl AggregationSettings {
    pub const fn aggregation_config(&self) -> AggregationConfig {
        AggregationConfig {
            runtime_cap_factor: self.runtime_cap_factor,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("aggregation", &self.aggregation)
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("wt.db"),
            busy_timeout_ms: 5_000,
            aggregation: AggregationSettings::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // WT_AGGREGATION__RUNTIME_CAP_FACTOR -> aggregation.runtime_cap_factor
        figment = figment.merge(Env::prefixed("WT_").split("__"));

        figment.extract()
    }

    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Returns the platform-specific config directory for wt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("wt"))
}

/// Returns the platform-specific data directory for wt.
///
/// On Linux: `~/.local/share/wt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("wt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_dirs_data_path_ends_with_wt() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "wt");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("wt.db"));
    }

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::default();
        assert_eq!(config.busy_timeout(), wt_db::DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config.maintenance.fallback_slack_seconds, 120);
        assert_eq!(config.maintenance.unit_threshold_seconds, 86_400);
        assert_eq!(config.aggregation.batch_size, 500);
        assert!(config.aggregation.exclude_live_tv);
        assert!((config.aggregation.runtime_cap_factor - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_file_overrides_nested_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
database_path = "/tmp/ledger.db"

[aggregation]
runtime_cap_factor = 2.0

[maintenance]
fallback_slack_seconds = 30
"#
        )
        .unwrap();

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/ledger.db"));
        assert!((config.aggregation.runtime_cap_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.aggregation.batch_size, 500);
        assert_eq!(config.maintenance.fallback_slack_seconds, 30);
        assert_eq!(config.maintenance.unit_threshold_seconds, 86_400);
    }
}
