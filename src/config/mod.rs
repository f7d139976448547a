//! Configuration for the orchestrator host and the device daemons
//!
//! Both sides read `resource.json` from the directory named by
//! `HELPER_RES_FILE_PATH`:
//! - host file: `host.ctrlPanel`, `host.dataPanel`, `mode`, `devList[]`
//! - device file: `ipaddr`, `port`, `token`, `deviceId` and TLS file paths
//!
//! Timing knobs for the transport, executor and session layers also live here
//! so tests can shorten them.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the directory that holds `resource.json`
pub const RESOURCE_DIR_ENV: &str = "HELPER_RES_FILE_PATH";

/// Configuration file name inside the resource directory
pub const RESOURCE_FILE: &str = "resource.json";

/// Session registry file written by the daemon next to its config
pub const CLIENT_REGISTRY_FILE: &str = "client.json";

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 600;

/// Resolve the resource directory from the environment
pub fn resource_dir() -> Result<PathBuf> {
    let dir = std::env::var(RESOURCE_DIR_ENV)
        .map_err(|_| DeployError::Config(format!("{} is not set", RESOURCE_DIR_ENV)))?;
    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        return Err(DeployError::Config(format!(
            "{}={} is not a directory",
            RESOURCE_DIR_ENV,
            dir.display()
        )));
    }
    Ok(dir)
}

fn read_resource_file<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<T> {
    let path = dir.join(RESOURCE_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|e| DeployError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| DeployError::Config(format!("invalid JSON in {}: {}", path.display(), e)))
}

/// One side (control or data) of the host's network panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelConfig {
    pub ipaddr: String,
    #[serde(default)]
    pub avail_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPanels {
    pub ctrl_panel: PanelConfig,
    pub data_panel: PanelConfig,
}

/// A device daemon the orchestrator can reach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeviceEntry {
    pub device_id: i32,
    pub ipaddr: String,
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    pub port: u16,
    pub token: String,
}

impl RemoteDeviceEntry {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ipaddr, self.port)
    }
}

/// Orchestrator host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub host: HostPanels,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub dev_list: Vec<RemoteDeviceEntry>,
}

impl HostConfig {
    /// Load from `$HELPER_RES_FILE_PATH/resource.json`
    pub fn load() -> Result<Self> {
        Self::load_from(&resource_dir()?)
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let config: HostConfig = read_resource_file(dir)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.ctrl_panel.ipaddr.is_empty() {
            return Err(DeployError::Config("host.ctrlPanel.ipaddr is empty".into()));
        }
        if self.host.data_panel.ipaddr.is_empty() {
            return Err(DeployError::Config("host.dataPanel.ipaddr is empty".into()));
        }
        let mut seen = HashSet::new();
        for dev in &self.dev_list {
            if !seen.insert((dev.ipaddr.as_str(), dev.device_id)) {
                return Err(DeployError::Config(format!(
                    "duplicate device {} at {}",
                    dev.device_id, dev.ipaddr
                )));
            }
            if dev.token.is_empty() {
                return Err(DeployError::Config(format!(
                    "device {} at {} has no token",
                    dev.device_id, dev.ipaddr
                )));
            }
        }
        Ok(())
    }

    /// Data-plane address peers connect back to
    pub fn data_panel_address(&self) -> String {
        match self.host.data_panel.avail_ports.first() {
            Some(port) => format!("{}:{}", self.host.data_panel.ipaddr, port),
            None => self.host.data_panel.ipaddr.clone(),
        }
    }
}

/// Device daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub ipaddr: String,
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    pub port: u16,
    pub token: String,
    pub device_id: i32,
    #[serde(default)]
    pub heartbeat_timeout_secs: Option<u64>,
    #[serde(default)]
    pub client_registry_path: Option<PathBuf>,
}

impl DeviceConfig {
    pub fn load() -> Result<Self> {
        let dir = resource_dir()?;
        let mut config = Self::load_from(&dir)?;
        if config.client_registry_path.is_none() {
            config.client_registry_path = Some(dir.join(CLIENT_REGISTRY_FILE));
        }
        Ok(config)
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let config: DeviceConfig = read_resource_file(dir)?;
        if config.token.is_empty() {
            return Err(DeployError::Config("device token is empty".into()));
        }
        if config.ipaddr.is_empty() {
            return Err(DeployError::Config("device ipaddr is empty".into()));
        }
        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ipaddr, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_timeout_secs
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        )
    }
}

/// Device maintenance settings pushed by the orchestrator before deployment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub log_level: String,
    pub dump: Option<DumpConfig>,
    pub profiling: Option<ProfilingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpConfig {
    pub path: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingConfig {
    pub options: String,
}

/// Bounded-wait knobs for the queue transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub max_queue_name_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_retries: 3000,
            max_queue_name_len: 128,
        }
    }
}

/// Bounded-wait knobs for executor worker handshakes and requests
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub event_poll_interval: Duration,
    pub init_retries: u32,
    pub request_retries: u32,
    pub queue_depth: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            event_poll_interval: Duration::from_secs(1),
            init_retries: 300,
            request_retries: 3600,
            queue_depth: 8,
        }
    }
}

/// Client liveness settings for the daemon
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub registry_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(60),
            registry_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_device(config: &DeviceConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            registry_path: config.client_registry_path.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_JSON: &str = r#"{
        "host": {
            "ctrlPanel": {"ipaddr": "10.0.0.1", "availPorts": [9000, 9001]},
            "dataPanel": {"ipaddr": "10.0.1.1", "availPorts": [9100]}
        },
        "mode": "cluster",
        "devList": [
            {"deviceId": 0, "ipaddr": "10.0.0.2", "port": 8000, "token": "abc"},
            {"deviceId": 1, "ipaddr": "10.0.0.2", "port": 8001, "token": "abc",
             "caFile": "ca.pem", "certFile": "cert.pem", "keyFile": "key.pem"}
        ]
    }"#;

    #[test]
    fn test_load_host_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RESOURCE_FILE), HOST_JSON).unwrap();

        let config = HostConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.mode, "cluster");
        assert_eq!(config.dev_list.len(), 2);
        assert_eq!(config.dev_list[1].cert_file, "cert.pem");
        assert_eq!(config.dev_list[0].address(), "10.0.0.2:8000");
        assert_eq!(config.data_panel_address(), "10.0.1.1:9100");
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let json = HOST_JSON.replace("\"deviceId\": 1", "\"deviceId\": 0");
        fs::write(dir.path().join(RESOURCE_FILE), json).unwrap();

        let err = HostConfig::load_from(dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_load_device_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(RESOURCE_FILE),
            r#"{"ipaddr": "0.0.0.0", "port": 8000, "token": "secret", "deviceId": 3,
                "caFile": "", "certFile": "", "keyFile": ""}"#,
        )
        .unwrap();

        let config = DeviceConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.device_id, 3);
        assert_eq!(config.listen_address(), "0.0.0.0:8000");
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DeviceConfig::load_from(dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
        assert!(err.to_string().contains(RESOURCE_FILE));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RESOURCE_FILE), "{not json").unwrap();
        let err = HostConfig::load_from(dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }
}
