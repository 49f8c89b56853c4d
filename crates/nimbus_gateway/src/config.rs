use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted logs instead of human-readable ones
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    // Cloud platform configuration
    /// Base URL of the cloud REST API
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// API key for the cloud REST API
    #[serde(default = "default_api_key")]
    pub api_key: String,

    // Gateway configuration
    /// UDP port devices send telemetry to
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// HTTP port for the snapshot API and WebSocket updates
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Number of device identities provisioned at startup
    #[serde(default = "default_device_count")]
    pub device_count: usize,

    /// Directory holding the persisted device store
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// How far back startup backfill reads message history, in hours
    #[serde(default = "default_history_hours")]
    pub history_hours: i64,

    // Cell geolocation configuration
    /// Endpoint of the regional cell geolocation service
    #[serde(default = "default_cell_endpoint")]
    pub cell_endpoint: String,

    /// Endpoint of the Unwired Labs fallback
    #[serde(default = "default_unwired_endpoint")]
    pub unwired_endpoint: String,

    /// Unwired Labs API token; the fallback is disabled when empty
    #[serde(default = "default_unwired_api_key")]
    pub unwired_api_key: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    false
}

fn default_api_endpoint() -> String {
    "https://api.nimbus-cloud.io".to_string()
}

fn default_api_key() -> String {
    String::new()
}

fn default_udp_port() -> u16 {
    8888
}

fn default_http_port() -> u16 {
    8080
}

fn default_device_count() -> usize {
    3
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_history_hours() -> i64 {
    24
}

fn default_cell_endpoint() -> String {
    "https://cell.nimbus-cloud.io".to_string()
}

fn default_unwired_endpoint() -> String {
    "https://eu1.unwiredlabs.com".to_string()
}

fn default_unwired_api_key() -> String {
    String::new()
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("NIMBUS"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests mutate the process environment; keep them serial.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::remove_var("NIMBUS_UDP_PORT");

        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.udp_port, 8888);
        assert_eq!(config.device_count, 3);
        assert!(config.unwired_api_key.is_empty());
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("NIMBUS_UDP_PORT", "9999");
        std::env::set_var("NIMBUS_API_KEY", "token-1");

        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.udp_port, 9999);
        assert_eq!(config.api_key, "token-1");

        std::env::remove_var("NIMBUS_UDP_PORT");
        std::env::remove_var("NIMBUS_API_KEY");
    }
}
