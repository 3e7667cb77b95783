//! Container runtime access.
//!
//! The rest of the crate talks to the container engine only through the
//! [`ContainerRuntime`] trait. [`DockerRuntime`] implements it on top of the
//! bollard Docker API client, plus a hijacked HTTP upgrade for exec sessions
//! so the raw multiplexed channel is available to [`crate::frame`].
//!
//! ## Components
//!
//! - [`docker`]: bollard-backed runtime with connection fallbacks
//! - [`config`]: create/start parameters handed to the runtime
//! - [`hijack`]: raw exec-start over the engine socket

mod config;
mod docker;
mod hijack;

pub use config::{CreateParams, StartParams, VolumeBind};
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use hijack::Endpoint;

use crate::event::Progress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Container or exec instance does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Image referenced by a create call is not present locally
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// A container with the requested name already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Runtime unreachable, or the target cannot serve the request
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// Client-side request timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unexpected response on a hijacked connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Docker API error
    #[error("Container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// One entry of the runtime's container list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the runtime, each with a leading `/`.
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortSummary>,
}

impl ContainerSummary {
    /// Whether the container is named exactly `name`.
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
    }
}

/// Port as reported in a container listing.
///
/// Old engines reported only a public port for unpublished ports, so both
/// sides are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSummary {
    pub private_port: Option<u16>,
    pub public_port: Option<u16>,
    #[serde(rename = "type")]
    pub protocol: String,
}

/// Snapshot of a container inspect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInspect {
    pub id: String,
    pub running: bool,
    pub ip_address: Option<String>,
    /// Full inspect document as returned by the runtime.
    pub raw: Value,
}

/// Options for an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub detach: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    /// Read the reply incrementally instead of buffering it whole.
    pub stream: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            detach: false,
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            stream: false,
        }
    }
}

/// Byte channel attached to an exec session.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RawIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Duplex channel bound to a command's standard streams.
pub type ExecChannel = Box<dyn RawIo>;

/// Capabilities the agent needs from a container runtime.
///
/// Implementations never cache: every call reflects current runtime state.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Inspect a container by id or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect>;

    /// Create a container and return its id.
    ///
    /// Fails with [`RuntimeError::ImageNotFound`] when the image is missing
    /// and [`RuntimeError::Conflict`] when the name is taken.
    async fn create_container(&self, create: &CreateParams, start: &StartParams)
    -> Result<String>;

    /// Start a container. Starting a running container succeeds.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Ask a container to stop, killing it after `grace`.
    ///
    /// Fails with [`RuntimeError::Timeout`] when the call itself times out.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Send SIGKILL.
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Pull an image, reporting status through `progress`.
    async fn pull_image(&self, image: &str, progress: &dyn Progress) -> Result<()>;

    /// Create an exec instance in a running container and return its id.
    ///
    /// Fails with [`RuntimeError::Unavailable`] when the container is missing
    /// or not running.
    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        options: &ExecOptions,
    ) -> Result<String>;

    /// Start an exec instance and attach to its streams.
    async fn start_exec(&self, exec_id: &str, options: &ExecOptions) -> Result<ExecChannel>;
}
