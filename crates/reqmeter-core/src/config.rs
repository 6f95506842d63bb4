//! `reqmeter.toml` configuration.
//!
//! ```toml
//! service_name = "checkout"
//! write_to_file = true
//! file_path = "/var/run/checkout/metrics.prom"
//! interval_secs = 15
//! exclude_routes = ["/healthz", "/metrics"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{DEFAULT_EXPORT_INTERVAL, StartOptions};
use crate::error::MetricsResult;
use crate::filter::RouteFilter;

/// Environment variable overriding `service_name`.
pub const SERVICE_NAME_ENV: &str = "FACILITY_NAME";
/// Environment variable overriding `instance_id`.
pub const INSTANCE_ID_ENV: &str = "FACILITY_ID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub service_name: String,
    pub instance_id: String,
    pub enabled: bool,
    pub write_to_file: bool,
    pub file_path: Option<PathBuf>,
    pub interval_secs: u64,
    pub include_routes: Option<Vec<String>>,
    pub exclude_routes: Option<Vec<String>>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            instance_id: String::new(),
            enabled: true,
            write_to_file: false,
            file_path: None,
            interval_secs: DEFAULT_EXPORT_INTERVAL.as_secs(),
            include_routes: None,
            exclude_routes: None,
        }
    }
}

impl MetricsConfig {
    pub fn from_file(path: &Path) -> MetricsResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> MetricsResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `FACILITY_NAME` / `FACILITY_ID` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Empty values are ignored.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = lookup(SERVICE_NAME_ENV).filter(|v| !v.is_empty()) {
            self.service_name = name;
        }
        if let Some(id) = lookup(INSTANCE_ID_ENV).filter(|v| !v.is_empty()) {
            self.instance_id = id;
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            enabled: self.enabled,
            write_to_file: self.write_to_file,
            file_path: self.file_path.clone(),
            interval: self.interval(),
        }
    }

    pub fn route_filter(&self) -> RouteFilter {
        RouteFilter::from_lists(self.include_routes.clone(), self.exclude_routes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricsError;

    #[test]
    fn empty_config_uses_defaults() {
        let config = MetricsConfig::from_toml_str("").unwrap();
        assert_eq!(config, MetricsConfig::default());
        assert_eq!(config.interval(), Duration::from_secs(15));
        assert!(config.start_options().enabled);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
service_name = "checkout"
instance_id = "checkout-7f9c"
write_to_file = true
file_path = "/tmp/checkout.prom"
interval_secs = 5
include_routes = ["/orders"]
exclude_routes = ["/healthz", "/orders"]
"#;
        let config = MetricsConfig::from_toml_str(toml_str).unwrap();
        let opts = config.start_options();
        assert_eq!(opts.service_name, "checkout");
        assert_eq!(opts.instance_id, "checkout-7f9c");
        assert!(opts.write_to_file);
        assert_eq!(opts.file_path, Some(PathBuf::from("/tmp/checkout.prom")));
        assert_eq!(opts.interval, Duration::from_secs(5));

        let filter = config.route_filter();
        assert!(!filter.is_excluded("/orders"));
        assert!(filter.is_excluded("/healthz"));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = MetricsConfig::from_toml_str("interval_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, MetricsError::Config(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MetricsConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, MetricsError::Io(_)));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reqmeter.toml");
        std::fs::write(&path, "service_name = \"billing\"\nenabled = false\n").unwrap();
        let config = MetricsConfig::from_file(&path).unwrap();
        assert_eq!(config.service_name, "billing");
        assert!(!config.enabled);
    }

    #[test]
    fn overrides_replace_identity() {
        let config = MetricsConfig {
            service_name: "from-file".into(),
            ..MetricsConfig::default()
        }
        .with_overrides_from(|key| match key {
            SERVICE_NAME_ENV => Some("from-env".into()),
            INSTANCE_ID_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.service_name, "from-env");
        assert_eq!(config.instance_id, "");
    }
}
