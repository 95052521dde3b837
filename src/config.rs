//! Gateway configuration.
//!
//! The gateway receives an already-resolved configuration: placeholder
//! substitution and merging of config files happen before it gets here.
//! Every tunable has a default so a file containing only `servers:` is
//! enough.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::mcp_client::lifecycle::BackoffPolicy;
use crate::mcp_client::types::ServerDescriptor;

// ─── Top Level ───────────────────────────────────────────────────────────────

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend servers keyed by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDescriptor>,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub chain: ChainLimits,
}

impl GatewayConfig {
    /// Read and parse a YAML (or JSON, which is valid YAML) config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Parse a config document. Server names are taken from the map keys.
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let mut config: GatewayConfig =
            serde_yaml::from_str(raw).context("failed to parse gateway config")?;
        for (name, descriptor) in config.servers.iter_mut() {
            descriptor.name = name.clone();
        }
        Ok(config)
    }

    /// Descriptors in name order, names filled in.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers.values().cloned().collect()
    }
}

// ─── Connections ─────────────────────────────────────────────────────────────

/// Per-connection timing and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Budget for transport open + initialize + capability fetch.
    ///
    /// Generous by default: some backends import heavy frameworks at startup.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Default timeout for a single call when the caller gives none.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Calls allowed in flight per connection before `ServerBusy`.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Random extra delay as a fraction of the backoff delay (0.0–1.0).
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
}

fn default_init_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    60_000
}
fn default_max_in_flight() -> usize {
    16
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_jitter() -> f64 {
    0.25
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_jitter: default_reconnect_jitter(),
        }
    }
}

impl ConnectionSettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            jitter: self.reconnect_jitter.clamp(0.0, 1.0),
        }
    }
}

// ─── Chains ──────────────────────────────────────────────────────────────────

/// Ceilings and access lists enforced by the chain validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLimits {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Serialized size ceiling for one step's arguments.
    #[serde(default = "default_max_argument_bytes")]
    pub max_argument_bytes: usize,
    /// Serialized size ceiling for the whole chain.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
    /// Chain deadline used when the caller gives none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_parallel")]
    pub default_parallel: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Chains longer than this validate with a warning.
    #[serde(default = "default_long_chain_warning")]
    pub long_chain_warning: usize,
    /// When non-empty, only these servers may be used.
    #[serde(default)]
    pub allowed_servers: Vec<String>,
    #[serde(default)]
    pub denied_servers: Vec<String>,
    /// When non-empty, only these tools (bare or `server__tool`) may be used.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

fn default_max_steps() -> usize {
    50
}
fn default_max_argument_bytes() -> usize {
    64 * 1024
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_max_string_length() -> usize {
    10_000
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_max_timeout_ms() -> u64 {
    300_000
}
fn default_parallel() -> usize {
    3
}
fn default_max_parallel() -> usize {
    10
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_long_chain_warning() -> usize {
    20
}

impl Default for ChainLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_argument_bytes: default_max_argument_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
            max_string_length: default_max_string_length(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            default_parallel: default_parallel(),
            max_parallel: default_max_parallel(),
            max_retry_attempts: default_max_retry_attempts(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            long_chain_warning: default_long_chain_warning(),
            allowed_servers: Vec::new(),
            denied_servers: Vec::new(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::{TransportConfig, TransportKind};
    use std::io::Write;

    const SAMPLE: &str = r#"
servers:
  filesystem:
    transport: local-process
    command: fs-server
    args: ["--root", "/tmp"]
  search:
    transport: http-stream
    url: https://search.example.com/mcp
    bearer_auth: true
  legacy:
    transport: push-stream
    url: http://localhost:9000/sse
    enabled: false
connection:
  max_in_flight: 4
chain:
  max_steps: 20
  denied_tools: ["drop_table"]
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 3);

        let fs = &config.servers["filesystem"];
        assert_eq!(fs.name, "filesystem");
        assert_eq!(fs.kind(), TransportKind::LocalProcess);
        assert!(fs.enabled);
        match &fs.transport {
            TransportConfig::LocalProcess { command, args, .. } => {
                assert_eq!(command, "fs-server");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected transport {other:?}"),
        }

        assert!(config.servers["search"].transport.requires_credential());
        assert!(!config.servers["legacy"].enabled);

        assert_eq!(config.connection.max_in_flight, 4);
        assert_eq!(config.connection.call_timeout_ms, 60_000);
        assert_eq!(config.chain.max_steps, 20);
        assert_eq!(config.chain.max_parallel, 10);
        assert_eq!(config.chain.denied_tools, vec!["drop_table"]);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GatewayConfig::from_yaml_str("{}").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.connection, ConnectionSettings::default());
        assert_eq!(config.chain, ChainLimits::default());
    }

    #[test]
    fn test_backoff_from_settings() {
        let settings = ConnectionSettings {
            reconnect_base_delay_ms: 10,
            reconnect_jitter: 3.0,
            ..ConnectionSettings::default()
        };
        let policy = settings.backoff();
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.jitter, 1.0);
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.descriptors().len(), 3);
        assert_eq!(config.descriptors()[0].name, "filesystem");
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let err = GatewayConfig::load(Path::new("/nonexistent/gateway.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/gateway.yaml"));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let raw = "servers:\n  x:\n    transport: carrier-pigeon\n";
        assert!(GatewayConfig::from_yaml_str(raw).is_err());
    }
}
