//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The daemon's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,

    /// The address on which the gateway accepts client traffic.
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,
    /// The terminal sink address wired in as the last chain member's next hop.
    ///
    /// Defaults to the gateway's own advertised endpoint, closing the traffic loop.
    #[serde(default = "default_sink_addr")]
    pub sink_addr: String,
    /// The monitoring sink which receives a best-effort mirror of all gateway traffic.
    #[serde(default = "default_monitor_addr")]
    pub monitor_addr: String,
    /// The host on which VNF workload listeners are bound.
    #[serde(default = "default_workload_host")]
    pub workload_host: String,
    /// The port used for the prometheus metrics scrape endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Maximum connect attempts towards a newly announced chain member.
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    /// Fixed backoff between connect attempts, in milliseconds.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// Deadline for reply-expecting RPCs over the bus, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Deadline for per-module heartbeat probes, in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Chains to create at startup, formatted as `name:size[,name:size…]`.
    #[serde(default)]
    pub bootstrap_chains: Option<String>,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The fixed backoff applied between connect attempts.
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// The deadline applied to reply-expecting RPCs.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// The deadline applied to per-module heartbeat probes.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Parse the bootstrap chain list, skipping and logging malformed entries.
    pub fn bootstrap(&self) -> Vec<(String, usize)> {
        let raw = match self.bootstrap_chains.as_deref() {
            Some(raw) => raw,
            None => return Vec::new(),
        };
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let parsed = entry.split_once(':').and_then(|(name, size)| size.parse::<usize>().ok().map(|size| (name.to_string(), size)));
                if parsed.is_none() {
                    tracing::warn!(entry, "malformed bootstrap chain entry, expected name:size, skipping");
                }
                parsed
            })
            .collect()
    }

    /// Create a config suitable for tests: loopback ephemeral ports and fast timeouts.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: String::new(),
            gateway_addr: "127.0.0.1:0".into(),
            sink_addr: "127.0.0.1:1".into(),
            monitor_addr: "127.0.0.1:1".into(),
            workload_host: "127.0.0.1".into(),
            metrics_port: 0,
            connect_max_attempts: 3,
            connect_backoff_ms: 10,
            rpc_timeout_ms: 200,
            heartbeat_timeout_ms: 100,
            bootstrap_chains: None,
        }
    }
}

fn default_gateway_addr() -> String {
    "0.0.0.0:30000".into()
}

fn default_sink_addr() -> String {
    "127.0.0.1:30000".into()
}

fn default_monitor_addr() -> String {
    "127.0.0.1:2538".into()
}

fn default_workload_host() -> String {
    "127.0.0.1".into()
}

fn default_metrics_port() -> u16 {
    7002
}

fn default_connect_max_attempts() -> u32 {
    60
}

fn default_connect_backoff_ms() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2000
}
