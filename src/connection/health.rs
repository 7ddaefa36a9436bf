//! Health telemetry for backing-store nodes.

/// Replication role reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    Primary,
    Replica,
    #[default]
    Unknown,
}

impl NodeRole {
    /// Parse the `role` field of `INFO replication` / the first element of `ROLE`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "master" => NodeRole::Primary,
            "slave" | "replica" => NodeRole::Replica,
            _ => NodeRole::Unknown,
        }
    }
}

/// Per-node health record. Process-local and rebuilt on every check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionHealth {
    pub address: Option<String>,
    pub role: NodeRole,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    /// Unix millis of the last check, successful or not.
    pub last_checked_at: Option<i64>,
}

/// Structured subset of `INFO` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub version: Option<String>,
    pub role: NodeRole,
    pub connected_replicas: u32,
    pub used_memory_bytes: Option<u64>,
    pub used_memory_human: Option<String>,
}

impl NodeInfo {
    /// Parse the text returned by `INFO`.
    pub fn parse(info: &str) -> Self {
        let mut node = NodeInfo::default();
        for line in info.lines() {
            let Some((field, value)) = line.trim().split_once(':') else {
                continue;
            };
            match field {
                "redis_version" => node.version = Some(value.to_string()),
                "role" => node.role = NodeRole::parse(value),
                "connected_slaves" => node.connected_replicas = value.parse().unwrap_or(0),
                "used_memory" => node.used_memory_bytes = value.parse().ok(),
                "used_memory_human" => node.used_memory_human = Some(value.to_string()),
                _ => {}
            }
        }
        node
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub node: Option<NodeInfo>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        HealthReport {
            healthy: false,
            latency_ms: None,
            node: None,
            error: Some(error.into()),
        }
    }
}
