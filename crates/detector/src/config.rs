//! Detector configuration management

use anyhow::{Context, Result, anyhow};
use detection::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub watch: WatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    #[serde(default = "DetectorSettings::default_log_level")]
    pub log_level: String,
    /// Print devices and events as JSON instead of text
    #[serde(default)]
    pub json_output: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            json_output: false,
        }
    }
}

impl DetectorSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Report events from startup without an explicit start
    #[serde(default = "MonitorSettings::default_auto_start")]
    pub auto_start: bool,
    /// Device list scan interval when hotplug is unavailable
    #[serde(default = "MonitorSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Use libusb hotplug callbacks when the platform supports them
    #[serde(default = "MonitorSettings::default_prefer_hotplug")]
    pub prefer_hotplug: bool,
    /// Report USB root hubs as devices too
    #[serde(default)]
    pub include_root_hubs: bool,
    /// Maximum number of pending device queries
    #[serde(default = "MonitorSettings::default_query_queue_depth")]
    pub query_queue_depth: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            auto_start: Self::default_auto_start(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            prefer_hotplug: Self::default_prefer_hotplug(),
            include_root_hubs: false,
            query_queue_depth: Self::default_query_queue_depth(),
        }
    }
}

impl MonitorSettings {
    fn default_auto_start() -> bool {
        true
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_prefer_hotplug() -> bool {
        true
    }

    fn default_query_queue_depth() -> usize {
        common::DEFAULT_QUERY_QUEUE_DEPTH
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which devices watch mode reports
///
/// Filters use the `VID:PID` notation with `*` wildcards, e.g.
/// `"0x04e8:*"` or `"0x16c0:0x0483"`. An empty list reports everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchSettings {
    #[serde(default)]
    pub filters: Vec<String>,
}

impl WatchSettings {
    /// Event topics to subscribe to, without topics covered by a broader one
    pub fn topics(&self) -> Result<Vec<String>> {
        if self.filters.is_empty() {
            return Ok(vec!["change".to_string()]);
        }

        let mut topics = BTreeSet::new();
        for filter in &self.filters {
            topics.insert(filter_topic(filter)?);
        }

        let covered = |topic: &String| {
            topics
                .iter()
                .any(|other| other != topic && topic.starts_with(&format!("{}:", other)))
        };
        Ok(topics.iter().filter(|t| !covered(t)).cloned().collect())
    }
}

/// Topic name for one watch filter
///
/// A product ID without a vendor ID matches no device, so such a filter is
/// rejected instead of silently reporting nothing.
pub fn filter_topic(filter: &str) -> Result<String> {
    if filter == "*" {
        return Ok("change".to_string());
    }

    let (vid, pid) = parse_filter(filter)?;
    match (vid, pid) {
        (None, None) => Ok("change".to_string()),
        (Some(vid), None) => Ok(format!("change:{}", vid)),
        (Some(vid), Some(pid)) => Ok(format!("change:{}:{}", vid, pid)),
        (None, Some(_)) => Err(anyhow!(
            "Invalid filter '{}', a product ID needs a vendor ID (e.g., '0x1234:0x5678')",
            filter
        )),
    }
}

/// Split a `VID:PID` filter into its IDs (`None` = wildcard)
fn parse_filter(filter: &str) -> Result<(Option<u16>, Option<u16>)> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
            filter
        ));
    }

    let parse = |id: &str, name: &str| -> Result<Option<u16>> {
        if id == "*" {
            Ok(None)
        } else {
            parse_hex_id(id, name).map(Some)
        }
    };

    Ok((parse(parts[0], "VID")?, parse(parts[1], "PID")?))
}

/// Parse a `0x`-prefixed hex ID (VID or PID)
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

impl DetectorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-detect/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DetectorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-detect").join("config.toml")
        } else {
            PathBuf::from(".config/usb-detect/config.toml")
        }
    }

    /// Library-side monitor settings
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            auto_start: self.monitor.auto_start,
            query_queue_depth: self.monitor.query_queue_depth,
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.detector.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.detector.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }
        if self.monitor.query_queue_depth == 0 {
            return Err(anyhow!("query_queue_depth must be greater than 0"));
        }

        for filter in &self.watch.filters {
            filter_topic(filter)?;
        }

        Ok(())
    }
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DetectorConfig::default();
        assert_eq!(config.detector.log_level, "info");
        assert!(!config.detector.json_output);
        assert!(config.monitor.auto_start);
        assert!(config.monitor.prefer_hotplug);
        assert!(!config.monitor.include_root_hubs);
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(1));
        assert!(config.watch.filters.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_topics() {
        assert_eq!(filter_topic("*").unwrap(), "change");
        assert_eq!(filter_topic("*:*").unwrap(), "change");
        assert_eq!(filter_topic("0x04e8:*").unwrap(), "change:1256");
        assert_eq!(filter_topic("0x16C0:0x0483").unwrap(), "change:5824:1155");
    }

    #[test]
    fn test_filter_invalid() {
        assert!(filter_topic("1234:5678").is_err());
        assert!(filter_topic("0x1234").is_err());
        assert!(filter_topic("0x1234:0x5678:0x9abc").is_err());
        assert!(filter_topic("0xGHIJ:0x5678").is_err());
        assert!(filter_topic("0x12345:0x5678").is_err());
        assert!(filter_topic("*:0x5678").is_err());
    }

    #[test]
    fn test_watch_topics_drop_covered() {
        let watch = WatchSettings {
            filters: vec![
                "0x04e8:0x503b".to_string(),
                "0x04e8:*".to_string(),
                "0x16c0:0x0483".to_string(),
            ],
        };
        assert_eq!(watch.topics().unwrap(), vec!["change:1256", "change:5824:1155"]);

        let everything = WatchSettings {
            filters: vec!["0x04e8:*".to_string(), "*".to_string()],
        };
        assert_eq!(everything.topics().unwrap(), vec!["change"]);

        assert_eq!(WatchSettings::default().topics().unwrap(), vec!["change"]);
    }

    #[test]
    fn test_validate() {
        let mut config = DetectorConfig::default();

        config.detector.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.detector.log_level = "debug".to_string();
        assert!(config.validate().is_ok());

        config.monitor.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.monitor.poll_interval_ms = 250;

        config.watch.filters = vec!["*:0x0001".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DetectorConfig::default();
        config.detector.json_output = true;
        config.monitor.prefer_hotplug = false;
        config.monitor.include_root_hubs = true;
        config.watch.filters = vec!["0x04e8:*".to_string()];
        config.save(&path).unwrap();

        let loaded = DetectorConfig::load(Some(path)).unwrap();
        assert!(loaded.detector.json_output);
        assert!(!loaded.monitor.prefer_hotplug);
        assert!(loaded.monitor.include_root_hubs);
        assert_eq!(loaded.watch.filters, vec!["0x04e8:*"]);
        assert_eq!(loaded.monitor_config().query_queue_depth, 64);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[monitor]\npoll_interval_ms = 250\n").unwrap();

        let loaded = DetectorConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.monitor.poll_interval_ms, 250);
        assert!(loaded.monitor.auto_start);
        assert_eq!(loaded.detector.log_level, "info");
    }

    #[test]
    fn test_load_rejects_bad_filter() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[watch]\nfilters = [\"04e8:*\"]\n").unwrap();

        assert!(DetectorConfig::load(Some(path)).is_err());
    }
}
