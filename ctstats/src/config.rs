use std::collections::HashMap;

/// Counter shape the host expects in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Cumulative,
    Delta,
}

/// The host collector handed to every lifecycle entry point.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Seconds between report callbacks.
    pub report_interval: u64,
    pub format: ReportFormat,
    pub mqtt_topic: Option<String>,
    /// Name of the filter to apply while collecting.
    pub collect_filter: Option<String>,
    pub node_id: String,
    pub location_id: String,
    pub other_config: HashMap<String, String>,
}

impl CollectorConfig {
    pub fn other_config(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(String::as_str)
    }

    /// The configured conntrack zone; absent or unparsable values fall
    /// back to zone 0.
    pub fn ct_zone(&self) -> u16 {
        self.other_config("ct_zone")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}
