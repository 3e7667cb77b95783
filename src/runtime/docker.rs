//! Docker/Podman runtime backed by bollard.
//!
//! Provides connection handling with fallback strategies, maps engine errors
//! onto [`RuntimeError`], and opens exec sessions through a hijacked
//! connection so callers receive the raw multiplexed stream.

use super::hijack::{self, Endpoint};
use super::{
    ContainerInspect, ContainerRuntime, ContainerSummary, CreateParams, ExecChannel, ExecOptions,
    PortSummary, Result, RuntimeError, StartParams,
};
use crate::event::Progress;
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::exec::CreateExecOptions;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    KillContainerOptions, ListContainersOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Runtime connection configuration.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Engine url (`unix://...` or `tcp://...`); local defaults when unset
    pub url: Option<String>,
    /// API version used for hijacked exec calls, e.g. `1.41`
    pub api_version: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_version: None,
            timeout: 60,
        }
    }
}

/// Docker/Podman API client.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    endpoint: Endpoint,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connect to the engine and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] if no engine can be reached.
    pub async fn connect(config: DockerRuntimeConfig) -> Result<Self> {
        let (docker, endpoint) = Self::open(&config)?;

        let runtime = Self {
            docker: Arc::new(docker),
            endpoint,
            config,
        };

        runtime.ping().await?;

        Ok(runtime)
    }

    /// Try connection strategies in order:
    /// 1. Configured url
    /// 2. Local defaults (DOCKER_HOST or the default socket)
    /// 3. Podman sockets
    fn open(config: &DockerRuntimeConfig) -> Result<(Docker, Endpoint)> {
        if let Some(url) = &config.url {
            debug!("Connecting to configured engine url {}", url);
            let endpoint = Endpoint::parse(url)?;
            let docker = match &endpoint {
                Endpoint::Unix(_) => {
                    Docker::connect_with_socket(url, config.timeout, bollard::API_DEFAULT_VERSION)
                }
                Endpoint::Tcp(_) => {
                    Docker::connect_with_http(url, config.timeout, bollard::API_DEFAULT_VERSION)
                }
            }
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", url, e)))?;
            info!("Connected to container runtime at {}", url);
            return Ok((docker, endpoint));
        }

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                let endpoint = match std::env::var("DOCKER_HOST") {
                    Ok(host) => Endpoint::parse(&host)?,
                    Err(_) => Endpoint::Unix(Endpoint::DEFAULT_SOCKET.into()),
                };
                info!("Connected to container runtime via local defaults");
                return Ok((docker.with_timeout(Duration::from_secs(config.timeout)), endpoint));
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            let mut sockets = Vec::new();
            if let Ok(home) = std::env::var("HOME") {
                sockets.push(format!("{}/run/podman/podman.sock", home));
            }
            sockets.push("/run/podman/podman.sock".to_string());

            for socket in sockets {
                let url = format!("unix://{}", socket);
                debug!("Trying Podman socket: {}", url);

                let connected =
                    Docker::connect_with_socket(&url, config.timeout, bollard::API_DEFAULT_VERSION);
                match connected {
                    Ok(docker) => {
                        info!("Connected to Podman via {}", socket);
                        return Ok((docker, Endpoint::Unix(socket.into())));
                    }
                    Err(e) => {
                        debug!("Podman socket {} failed: {}", socket, e);
                    }
                }
            }
        }

        Err(RuntimeError::Unavailable(
            "Failed to connect to Docker or Podman. Please ensure the engine is running."
                .to_string(),
        ))
    }

    /// Ping the engine.
    ///
    /// # Errors
    ///
    /// Returns error if ping fails.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::Unavailable(format!("Failed to ping container runtime: {}", e))
        })?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    /// Get the underlying Docker client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    fn exec_start_path(&self, exec_id: &str) -> String {
        match &self.config.api_version {
            Some(version) => format!("/v{}/exec/{}/start", version, exec_id),
            None => format!("/exec/{}/start", exec_id),
        }
    }
}

/// Map an engine error for `subject`, keeping 404 and timeouts distinct.
fn classify(err: BollardError, subject: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(format!("{}: {}", subject, message)),
        BollardError::RequestTimeoutError => RuntimeError::Timeout(subject.to_string()),
        e => RuntimeError::Api(e),
    }
}

fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn to_create_body(create: &CreateParams, start: &StartParams) -> ContainerCreateBody {
    let unit_map = |keys: &std::collections::BTreeSet<String>| {
        (!keys.is_empty()).then(|| {
            keys.iter()
                .map(|k| (k.clone(), HashMap::new()))
                .collect::<HashMap<_, _>>()
        })
    };
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    let port_bindings = (!start.port_bindings.is_empty()).then(|| {
        start
            .port_bindings
            .iter()
            .map(|(key, host_port)| {
                (
                    key.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect::<HashMap<_, _>>()
    });

    let binds = start.bind_list();
    let links = start.link_list();

    ContainerCreateBody {
        image: Some(create.image.clone()),
        hostname: create.hostname.clone(),
        domainname: create.domainname.clone(),
        user: create.user.clone(),
        working_dir: create.working_dir.clone(),
        env: (!create.env.is_empty()).then(|| create.env_list()),
        tty: Some(create.tty),
        open_stdin: Some(create.stdin_open),
        entrypoint: create.entrypoint.clone(),
        cmd: create.cmd.clone(),
        exposed_ports: unit_map(&create.exposed_ports),
        volumes: unit_map(&create.volumes),
        host_config: Some(HostConfig {
            memory: create.memory,
            memory_swap: create.memory_swap,
            cpuset_cpus: create.cpuset.clone(),
            privileged: Some(start.privileged),
            publish_all_ports: Some(start.publish_all_ports),
            cap_add: non_empty(&start.cap_add),
            cap_drop: non_empty(&start.cap_drop),
            dns: non_empty(&start.dns),
            dns_search: non_empty(&start.dns_search),
            binds: non_empty(&binds),
            links: non_empty(&links),
            volumes_from: non_empty(&start.volumes_from),
            port_bindings,
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(all).build()))
            .await
            .map_err(|e| classify(e, "containers"))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PortSummary {
                        private_port: Some(p.private_port),
                        public_port: p.public_port,
                        protocol: p
                            .typ
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "tcp".to_string()),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, id))?;

        let raw = serde_json::to_value(&inspect).unwrap_or_default();
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let ip_address = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        Ok(ContainerInspect {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            running,
            ip_address,
            raw,
        })
    }

    async fn create_container(
        &self,
        create: &CreateParams,
        start: &StartParams,
    ) -> Result<String> {
        let options = CreateContainerOptionsBuilder::new()
            .name(&create.name)
            .build();

        debug!("Creating container: {}", create.name);

        let response = self
            .docker
            .create_container(Some(options), to_create_body(create, start))
            .await
            .map_err(|e| match classify(e, &create.name) {
                RuntimeError::NotFound(_) => RuntimeError::ImageNotFound(create.image.clone()),
                e => e,
            })?;

        info!("Created container: {} ({})", create.name, response.id);

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        debug!("Starting container: {}", id);

        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => debug!("Container {} already running", id),
            Err(e) => return Err(classify(e, id)),
        }

        info!("Started container: {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        debug!("Stopping container: {}", id);

        let t = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(t).build()))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => debug!("Container {} already stopped", id),
            Err(e) => return Err(classify(e, id)),
        }

        info!("Stopped container: {}", id);
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        debug!("Killing container: {}", id);

        match self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => {}
            // 409: not running
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!("Container {} was not running", id),
            Err(e) => return Err(classify(e, id)),
        }

        info!("Killed container: {}", id);
        Ok(())
    }

    async fn pull_image(&self, image: &str, progress: &dyn Progress) -> Result<()> {
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (image, "latest"),
        };

        info!("Pulling image: {}", image);

        let mut stream = self.docker.create_image(
            Some(
                CreateImageOptionsBuilder::new()
                    .from_image(from_image)
                    .tag(tag)
                    .build(),
            ),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| classify(e, image))?;
            if let Some(status) = info.status {
                debug!("Pull status: {}", status);
                progress.update(&status, None);
            }
            if let Some(detail) = info.progress {
                debug!("Pull progress: {}", detail);
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        options: &ExecOptions,
    ) -> Result<String> {
        debug!("Creating exec in container {}: {:?}", container, cmd);

        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdin: Some(options.attach_stdin),
            attach_stdout: Some(options.attach_stdout),
            attach_stderr: Some(options.attach_stderr),
            tty: Some(options.tty),
            privileged: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, exec_options)
            .await
            .map_err(|e| match classify(e, container) {
                RuntimeError::NotFound(c) => {
                    RuntimeError::Unavailable(format!("Container {} does not exist", c))
                }
                RuntimeError::Conflict(c) => {
                    RuntimeError::Unavailable(format!("Container {} is not running", c))
                }
                e => e,
            })?;

        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str, options: &ExecOptions) -> Result<ExecChannel> {
        let body = serde_json::json!({
            "Detach": options.detach,
            "Tty": options.tty,
        });
        let body = serde_json::to_vec(&body).map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        hijack::upgrade(&self.endpoint, &self.exec_start_path(exec_id), &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VolumeBind;

    #[test]
    fn test_create_body_mapping() {
        let mut create = CreateParams {
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            memory: Some(64 << 20),
            tty: true,
            ..Default::default()
        };
        create.add_env([("A", "1")]);
        create.exposed_ports.insert("80/tcp".to_string());
        create.volumes.insert("/data".to_string());

        let mut start = StartParams {
            privileged: true,
            ..Default::default()
        };
        start.binds.insert(
            "/srv".to_string(),
            VolumeBind {
                bind: "/usr/share/nginx".to_string(),
                ro: true,
            },
        );
        start.links.insert("db".to_string(), "database".to_string());
        start.port_bindings.insert("80/tcp".to_string(), 8080);

        let body = to_create_body(&create, &start);
        assert_eq!(body.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(body.env, Some(vec!["A=1".to_string()]));
        assert_eq!(body.tty, Some(true));
        assert!(body.exposed_ports.unwrap().contains_key("80/tcp"));
        assert!(body.volumes.unwrap().contains_key("/data"));

        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(64 << 20));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.binds, Some(vec!["/srv:/usr/share/nginx:ro".to_string()]));
        assert_eq!(host.links, Some(vec!["db:database".to_string()]));
        assert!(host.cap_add.is_none());
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn test_classify_errors() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(classify(not_found, "x"), RuntimeError::NotFound(_)));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(matches!(classify(conflict, "x"), RuntimeError::Conflict(_)));

        assert!(matches!(
            classify(BollardError::RequestTimeoutError, "x"),
            RuntimeError::Timeout(_)
        ));
    }
}
