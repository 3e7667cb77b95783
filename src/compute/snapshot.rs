//! Instance state snapshots reported back to the orchestrator.

use crate::runtime::{ContainerInspect, ContainerSummary, PortSummary};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Observed state of an instance's container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub container: Option<ContainerSummary>,
    pub inspect: Option<ContainerInspect>,
    /// Address of the host the agent runs on.
    pub host_ip: String,
    /// Container address on the engine's network.
    pub ip: Option<String>,
    /// `private/proto` to public port.
    pub ports: BTreeMap<String, Option<String>>,
}

impl InstanceSnapshot {
    /// Instance update in the orchestrator's data layout.
    pub fn to_update(&self) -> Value {
        json!({
            "instance": {
                "+data": {
                    "dockerContainer": self.container,
                    "dockerInspect": self.inspect.as_ref().map(|i| &i.raw),
                    "+fields": {
                        "dockerHostIp": self.host_ip,
                        "dockerPorts": self.ports,
                        "dockerIp": self.ip,
                    }
                }
            }
        })
    }
}

/// Normalize listed ports to `private/proto -> public`.
///
/// Engines report a port as private only, as private plus public, or (old
/// engines) as public only; the last form is keyed by the public port and
/// treated as unpublished.
pub fn normalize_ports(ports: &[PortSummary]) -> BTreeMap<String, Option<String>> {
    let mut map = BTreeMap::new();

    for port in ports {
        match (port.private_port, port.public_port) {
            (None, Some(public)) => {
                map.insert(format!("{}/{}", public, port.protocol), None);
            }
            (Some(private), Some(public)) => {
                map.insert(
                    format!("{}/{}", private, port.protocol),
                    Some(public.to_string()),
                );
            }
            (Some(private), None) => {
                map.insert(format!("{}/{}", private, port.protocol), None);
            }
            (None, None) => {}
        }
    }

    map
}
