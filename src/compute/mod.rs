//! Container lifecycle management.
//!
//! [`ContainerCompute`] reconciles an [`InstanceSpec`] against the runtime:
//! activation is idempotent per logical name, deactivation escalates from a
//! graceful stop to a single kill, and [`describe`](ContainerCompute::describe)
//! reports what the runtime currently sees. Nothing is cached; every call
//! looks the container up again by exact name.
//!
//! ## Components
//!
//! - [`params`]: instance spec to create/start parameters
//! - [`snapshot`]: observed state and port normalization

pub mod params;
pub mod snapshot;

pub use snapshot::{InstanceSnapshot, normalize_ports};

use crate::event::Progress;
use crate::instance::{HostInfo, InstanceSpec};
use crate::listener::Listeners;
use crate::runtime::{
    ContainerInspect, ContainerRuntime, ContainerSummary, CreateParams, RuntimeError, StartParams,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timeout of a single graceful stop request.
const STOP_ATTEMPT: Duration = Duration::from_secs(1);

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A start listener refused the activation
    #[error("Listener {listener} failed: {message}")]
    Listener { listener: String, message: String },

    /// The container did not reach the requested state
    #[error("Failed to converge: {0}")]
    ConvergenceFailure(String),

    #[error("Invalid instance: {0}")]
    InvalidSpec(String),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// How long graceful stop is retried before killing.
    pub stop_timeout: Duration,
    /// Address of this host, reported in snapshots.
    pub host_ip: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            host_ip: String::new(),
        }
    }
}

/// Container lifecycle manager.
#[derive(Clone)]
pub struct ContainerCompute {
    runtime: Arc<dyn ContainerRuntime>,
    listeners: Listeners,
    config: ComputeConfig,
}

impl ContainerCompute {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        listeners: Listeners,
        config: ComputeConfig,
    ) -> Self {
        Self {
            runtime,
            listeners,
            config,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Find a container, running or not, named exactly `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn get_container_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        let containers = self.runtime.list_containers(true).await?;
        Ok(containers.into_iter().find(|c| c.has_name(name)))
    }

    /// Inspect a container; `None` if it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error on any runtime failure other than absence.
    pub async fn inspect(&self, id: &str) -> Result<Option<ContainerInspect>> {
        match self.runtime.inspect_container(id).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The container named `name`, if it exists and is running.
    ///
    /// # Errors
    ///
    /// Returns error on any runtime failure other than absence.
    pub async fn running_container(&self, name: &str) -> Result<Option<ContainerSummary>> {
        let Some(container) = self.get_container_by_name(name).await? else {
            return Ok(None);
        };

        match self.inspect(&container.id).await? {
            Some(inspect) if inspect.running => Ok(Some(container)),
            _ => Ok(None),
        }
    }

    /// Whether a container named `name` exists and is running.
    ///
    /// Lookup failures count as not active.
    pub async fn is_active(&self, name: &str) -> bool {
        match self.running_container(name).await {
            Ok(container) => container.is_some(),
            Err(e) => {
                warn!("Failed to check container {}: {}", name, e);
                false
            }
        }
    }

    /// Whether no running container is named `name`.
    pub async fn is_inactive(&self, name: &str) -> bool {
        !self.is_active(name).await
    }

    /// Make sure the container for `spec` exists and is running.
    ///
    /// Safe to repeat: an existing container is reused and starting a running
    /// container is a no-op. Returns the container id.
    ///
    /// Start parameters, including listener edits, are part of the host
    /// configuration fixed at create time. A reused container keeps the
    /// settings it was created with.
    ///
    /// # Errors
    ///
    /// Returns error if the spec is invalid, a start listener fails, or the
    /// runtime rejects a create/pull/start call.
    pub async fn activate(
        &self,
        spec: &InstanceSpec,
        host: &HostInfo,
        progress: &dyn Progress,
    ) -> Result<String> {
        let (mut create, mut start) = params::build(spec)?;
        self.listeners
            .before_start(spec, host, &mut create, &mut start)?;

        let id = match self.get_container_by_name(&spec.name).await? {
            Some(container) => {
                debug!(
                    "Reusing container {} for {}, start parameters not re-applied",
                    container.id, spec.name
                );
                container.id
            }
            None => self.create(&create, &start, progress).await?,
        };

        info!("Starting container: {}", spec.name);
        self.runtime.start_container(&id).await?;

        self.listeners.after_start(spec, host, &id)?;

        Ok(id)
    }

    async fn create(
        &self,
        create: &CreateParams,
        start: &StartParams,
        progress: &dyn Progress,
    ) -> Result<String> {
        let mut pulled = false;

        loop {
            info!("Creating container: {}", create.name);
            match self.runtime.create_container(create, start).await {
                Ok(id) => return Ok(id),
                Err(RuntimeError::ImageNotFound(_)) if !pulled => {
                    progress.update(
                        &format!("Pulling image {}", create.image),
                        Some(json!({"image": create.image})),
                    );
                    self.runtime.pull_image(&create.image, progress).await?;
                    pulled = true;
                }
                Err(RuntimeError::Conflict(_)) => {
                    debug!("Container {} created concurrently, adopting it", create.name);
                    return self
                        .get_container_by_name(&create.name)
                        .await?
                        .map(|c| c.id)
                        .ok_or_else(|| {
                            ComputeError::ConvergenceFailure(format!(
                                "Container {} reported as existing but not listed",
                                create.name
                            ))
                        });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop the container named `name`, killing it if it will not stop.
    ///
    /// An absent container counts as stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ConvergenceFailure`] if the container is still
    /// running after the kill, or any runtime error other than a stop timeout.
    pub async fn deactivate(&self, name: &str, progress: &dyn Progress) -> Result<()> {
        let Some(container) = self.get_container_by_name(name).await? else {
            debug!("Container {} not found, already stopped", name);
            return Ok(());
        };

        info!("Stopping container: {}", name);
        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            match self.runtime.stop_container(&container.id, STOP_ATTEMPT).await {
                Ok(()) => break,
                Err(RuntimeError::Timeout(_)) if Instant::now() < deadline => {
                    debug!("Stop of {} timed out, retrying", name);
                    tokio::task::yield_now().await;
                }
                Err(RuntimeError::Timeout(_)) => {
                    warn!("Container {} did not stop within {:?}", name, self.config.stop_timeout);
                    break;
                }
                Err(RuntimeError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        if self.running_container(name).await?.is_none() {
            return Ok(());
        }

        warn!("Killing container: {}", name);
        progress.update(&format!("Killing container {}", name), None);
        match self.runtime.kill_container(&container.id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if self.running_container(name).await?.is_some() {
            return Err(ComputeError::ConvergenceFailure(format!(
                "Failed to stop container {}",
                name
            )));
        }

        Ok(())
    }

    /// Snapshot what the runtime reports for `name`.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot be queried.
    pub async fn describe(&self, name: &str) -> Result<InstanceSnapshot> {
        let container = self.get_container_by_name(name).await?;

        let inspect = match &container {
            Some(c) => self.inspect(&c.id).await?,
            None => None,
        };

        let ip = inspect
            .as_ref()
            .and_then(|i| i.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        let ports = container
            .as_ref()
            .map(|c| normalize_ports(&c.ports))
            .unwrap_or_default();

        Ok(InstanceSnapshot {
            container,
            inspect,
            host_ip: self.config.host_ip.clone(),
            ip,
            ports,
        })
    }
}
