//! Desired-state description of an instance, as sent by the orchestrator.
//!
//! Every optional field is typed; an absent field means "not set" and the
//! runtime default applies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification of the container backing one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceSpec {
    /// Logical name; also the container name.
    #[serde(alias = "uuid")]
    pub name: String,
    /// Full image reference, e.g. `docker.io/library/nginx:1.25`.
    pub image: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_set: Option<String>,
    /// Working directory inside the container.
    pub directory: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub domain_name: Option<String>,
    pub tty: Option<bool>,
    pub stdin_open: Option<bool>,
    pub entry_point: Option<Vec<String>>,
    pub command: Option<String>,
    pub command_args: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub publish_all_ports: Option<bool>,
    pub ports: Vec<PortSpec>,
    /// `host:container[:mode]` binds or bare container paths.
    pub data_volumes: Vec<String>,
    /// Names of containers to inherit volumes from.
    pub data_volumes_from: Vec<String>,
    pub links: Vec<LinkSpec>,
    pub privileged: bool,
    /// Set when the instance runs an agent that must reach back to the
    /// orchestrator.
    pub agent_id: Option<String>,
}

/// A container port, optionally published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub private_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub public_port: Option<u16>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortSpec {
    /// The `port/protocol` key used by the runtime.
    pub fn key(&self) -> String {
        format!("{}/{}", self.private_port, self.protocol)
    }
}

/// Link to another container under an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    /// Name of the target container.
    pub target: String,
    pub alias: String,
}

/// The host the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub uuid: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sparse_spec() {
        let spec: InstanceSpec = serde_json::from_value(json!({
            "uuid": "3f1c0a5e-8d2b-4c7a-9e61-2b7d1f0c4a11",
            "image": "alpine:3.19",
            "command": "sleep 60",
            "ports": [{"privatePort": 80}],
            "links": [{"target": "db", "alias": "database"}]
        }))
        .unwrap();

        assert_eq!(spec.name, "3f1c0a5e-8d2b-4c7a-9e61-2b7d1f0c4a11");
        assert_eq!(spec.image.as_deref(), Some("alpine:3.19"));
        assert_eq!(spec.ports[0].key(), "80/tcp");
        assert_eq!(spec.links[0].alias, "database");
        assert!(spec.memory.is_none());
        assert!(spec.data_volumes.is_empty());
        assert!(!spec.privileged);
    }
}
