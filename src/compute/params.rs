//! Mapping from instance specs to runtime parameters.

use super::{ComputeError, Result};
use crate::instance::InstanceSpec;
use crate::runtime::{CreateParams, StartParams, VolumeBind};
use std::collections::{BTreeMap, BTreeSet};

/// Build the create and start parameters for `spec`.
///
/// # Errors
///
/// Returns [`ComputeError::InvalidSpec`] if the spec names no image or its
/// command has unbalanced quotes.
pub fn build(spec: &InstanceSpec) -> Result<(CreateParams, StartParams)> {
    let image = spec
        .image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| {
            ComputeError::InvalidSpec(format!(
                "Can not start container {} with no image",
                spec.name
            ))
        })?;

    let (volumes, binds) = split_volumes(&spec.data_volumes);

    let create = CreateParams {
        name: spec.name.clone(),
        image: image.to_string(),
        hostname: spec.hostname.clone(),
        domainname: spec.domain_name.clone(),
        user: spec.user.clone(),
        working_dir: spec.directory.clone(),
        env: spec.environment.clone(),
        memory: spec.memory,
        memory_swap: spec.memory_swap,
        cpuset: spec.cpu_set.clone(),
        tty: spec.tty.unwrap_or(false),
        stdin_open: spec.stdin_open.unwrap_or(false),
        entrypoint: spec.entry_point.clone().filter(|e| !e.is_empty()),
        cmd: command(spec)?,
        exposed_ports: spec.ports.iter().map(|p| p.key()).collect(),
        volumes,
    };

    let start = StartParams {
        privileged: spec.privileged,
        publish_all_ports: spec.publish_all_ports.unwrap_or(false),
        cap_add: spec.cap_add.clone(),
        cap_drop: spec.cap_drop.clone(),
        dns: spec.dns.clone(),
        dns_search: spec.dns_search.clone(),
        binds,
        volumes_from: spec.data_volumes_from.clone(),
        links: spec
            .links
            .iter()
            .map(|l| (l.target.clone(), l.alias.clone()))
            .collect(),
        port_bindings: spec
            .ports
            .iter()
            .filter_map(|p| p.public_port.map(|public| (p.key(), public)))
            .collect(),
    };

    Ok((create, start))
}

/// Split volume specs into anonymous volumes and host binds.
///
/// `host:container` and `host:container:mode` become binds (read-only only
/// for mode `ro`); a bare path becomes an anonymous volume.
pub fn split_volumes(specs: &[String]) -> (BTreeSet<String>, BTreeMap<String, VolumeBind>) {
    let mut volumes = BTreeSet::new();
    let mut binds = BTreeMap::new();

    for spec in specs.iter().filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = spec.splitn(4, ':').collect();
        match parts.as_slice() {
            [path] => {
                volumes.insert(path.to_string());
            }
            [host, container, rest @ ..] => {
                let ro = matches!(rest, ["ro"]);
                binds.insert(
                    host.to_string(),
                    VolumeBind {
                        bind: container.to_string(),
                        ro,
                    },
                );
            }
            [] => {}
        }
    }

    (volumes, binds)
}

/// Command plus arguments. With arguments the command is one element;
/// without, it is split with shell quoting rules.
fn command(spec: &InstanceSpec) -> Result<Option<Vec<String>>> {
    let Some(command) = spec
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    else {
        return Ok(None);
    };

    if spec.command_args.is_empty() {
        return shlex::split(command).map(Some).ok_or_else(|| {
            ComputeError::InvalidSpec(format!(
                "Unbalanced quoting in command for {}: {}",
                spec.name, command
            ))
        });
    }

    let mut cmd = vec![command.to_string()];
    cmd.extend(spec.command_args.iter().cloned());
    Ok(Some(cmd))
}
