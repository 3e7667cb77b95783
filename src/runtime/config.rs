//! Container create and start parameters.
//!
//! Built by the lifecycle manager from an instance spec, then handed to the
//! registered start listeners, which may adjust them before the runtime sees
//! them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Parameters of the runtime create call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpuset: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `port/protocol` keys.
    pub exposed_ports: BTreeSet<String>,
    /// Anonymous volumes by container path.
    pub volumes: BTreeSet<String>,
}

impl CreateParams {
    /// Add environment variables, replacing existing values.
    pub fn add_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
    }

    /// Environment in `KEY=value` form.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBind {
    pub bind: String,
    pub ro: bool,
}

/// Parameters applied when the container is started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub privileged: bool,
    pub publish_all_ports: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// Host path to bind target.
    pub binds: BTreeMap<String, VolumeBind>,
    pub volumes_from: Vec<String>,
    /// Target container name to alias.
    pub links: BTreeMap<String, String>,
    /// `port/protocol` to host port.
    pub port_bindings: BTreeMap<String, u16>,
}

impl StartParams {
    /// Binds in `host:container:mode` form.
    pub fn bind_list(&self) -> Vec<String> {
        self.binds
            .iter()
            .map(|(host, b)| format!("{}:{}:{}", host, b.bind, if b.ro { "ro" } else { "rw" }))
            .collect()
    }

    /// Links in `name:alias` form.
    pub fn link_list(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|(name, alias)| format!("{}:{}", name, alias))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list() {
        let mut create = CreateParams::default();
        create.add_env([("B", "2"), ("A", "1")]);
        create.add_env([("B", "3")]);
        assert_eq!(create.env_list(), vec!["A=1", "B=3"]);
    }

    #[test]
    fn test_bind_and_link_lists() {
        let mut start = StartParams::default();
        start.binds.insert(
            "/host/a".to_string(),
            VolumeBind {
                bind: "/ctr/a".to_string(),
                ro: true,
            },
        );
        start.binds.insert(
            "/host/b".to_string(),
            VolumeBind {
                bind: "/ctr/b".to_string(),
                ro: false,
            },
        );
        start.links.insert("db".to_string(), "database".to_string());

        assert_eq!(start.bind_list(), vec!["/host/a:/ctr/a:ro", "/host/b:/ctr/b:rw"]);
        assert_eq!(start.link_list(), vec!["db:database"]);
    }
}
