//! Host resources and running instances reported on ping.

use crate::event::Event;
use crate::runtime::{ContainerRuntime, Result};
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of this host as reported to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub physical_host_uuid: String,
    /// Compute host uuid, stable across restarts.
    pub uuid: String,
    pub ip: String,
}

/// Builds pong replies.
pub struct PingReporter {
    runtime: Arc<dyn ContainerRuntime>,
    identity: HostIdentity,
}

impl PingReporter {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, identity: HostIdentity) -> Self {
        Self { runtime, identity }
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Answer `ping`, adding the resources and instances it asks for.
    ///
    /// # Errors
    ///
    /// Returns error if instances are requested and the runtime cannot list
    /// containers.
    pub async fn on_ping(&self, ping: &Event) -> Result<Event> {
        let mut resources = Vec::new();
        let mut options = Map::new();

        if option(ping, "resources") {
            resources.extend(self.resources());
        }

        if option(ping, "instances") {
            resources.extend(self.instances().await?);
            options.insert("instances".to_string(), Value::Bool(true));
        }

        debug!("Answering ping with {} resources", resources.len());
        Ok(ping.reply(Some(json!({
            "resources": resources,
            "options": options,
        }))))
    }

    fn resources(&self) -> Vec<Value> {
        let id = &self.identity;
        vec![
            json!({
                "type": "physicalHost",
                "kind": "physicalHost",
                "uuid": id.physical_host_uuid,
                "name": id.hostname,
            }),
            json!({
                "type": "host",
                "kind": "docker",
                "name": id.hostname,
                "physicalHostUuid": id.physical_host_uuid,
                "uuid": id.uuid,
            }),
            json!({
                "type": "storagePool",
                "kind": "docker",
                "name": format!("{} Storage Pool", id.hostname),
                "hostUuid": id.uuid,
                "uuid": format!("{}-pool", id.uuid),
            }),
            json!({
                "type": "ipAddress",
                "uuid": id.ip,
                "address": id.ip,
                "hostUuid": id.uuid,
            }),
        ]
    }

    async fn instances(&self) -> Result<Vec<Value>> {
        let containers = self.runtime.list_containers(false).await?;

        Ok(containers
            .iter()
            .flat_map(|c| c.names.iter())
            .filter_map(|name| name.strip_prefix('/'))
            .filter(|name| Uuid::parse_str(name).is_ok())
            .map(|name| json!({"type": "instance", "uuid": name, "state": "running"}))
            .collect())
    }
}

/// Reply to `ping` with nothing to report.
pub fn empty_pong(ping: &Event) -> Event {
    ping.reply(Some(json!({})))
}

fn option(ping: &Event, key: &str) -> bool {
    ping.data
        .pointer(&format!("/options/{}", key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Read the uuid stored in `path`, creating the file with a new uuid if it
/// is missing or empty.
///
/// # Errors
///
/// Returns error if the file cannot be read or written.
pub fn load_or_create_uuid(path: &Path) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let uuid = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &uuid)?;
    info!("Generated host uuid {} in {}", uuid, path.display());

    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_uuid_file_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join(".docker_uuid");

        let first = load_or_create_uuid(&path).unwrap();
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        let second = load_or_create_uuid(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_uuid_file_existing_value_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uuid");
        std::fs::write(&path, "fixed-host\n").unwrap();

        assert_eq!(load_or_create_uuid(&path).unwrap(), "fixed-host");
    }

    #[test]
    fn test_ping_options() {
        let ping = Event::new("ping", json!({"options": {"resources": true}}));
        assert!(option(&ping, "resources"));
        assert!(!option(&ping, "instances"));
        assert!(!option(&Event::new("ping", Value::Null), "resources"));
    }
}
