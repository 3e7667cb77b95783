//! Request forwarding into running containers.
//!
//! A `delegate.request` wraps an inner event addressed to an agent-managed
//! container. [`DockerDelegate`] serializes the inner event, writes it to an
//! executor command started inside the container, and turns the executor's
//! `{exitCode, output, data}` reply into a reply or a failure update.

use crate::compute::{self, ComputeError, ContainerCompute};
use crate::env;
use crate::event::{Event, Marshaller, Progress};
use crate::exec::ExecSession;
use crate::frame::StreamFilter;
use crate::instance::{HostInfo, InstanceSpec};
use crate::listener::StartListener;
use crate::runtime::{CreateParams, ExecOptions, RuntimeError, StartParams};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Delegate errors.
#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("Malformed delegate request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result type for delegate operations.
pub type Result<T> = std::result::Result<T, DelegateError>;

/// How requests are carried over the exec channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelVariant {
    /// Newline-terminated request, reply demultiplexed while it arrives.
    #[default]
    Hijacked,
    /// Request terminated by closing stdin, reply read whole.
    Buffered,
}

/// Delegate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    pub tunnel: TunnelVariant,
    /// Executor run inside the container; defaults to `<home>/events/executor`.
    pub executor: Option<PathBuf>,
    /// URL agent instances use to fetch their configuration.
    pub config_url: Option<String>,
    /// Port of the local API proxy handed to agent instances.
    pub api_proxy_port: u16,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelVariant::Hijacked,
            executor: None,
            config_url: None,
            api_proxy_port: 9342,
        }
    }
}

/// Target of a delegated request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceData {
    pub uuid: String,
    pub kind: String,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateRequest {
    #[serde(default)]
    instance_data: InstanceData,
    event: Event,
}

/// Decoded executor reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecReply {
    pub exit_code: i64,
    pub output: Value,
    pub data: Option<Value>,
}

impl ExecReply {
    fn failed(output: impl Into<Value>) -> Self {
        Self {
            exit_code: 1,
            output: output.into(),
            data: None,
        }
    }
}

/// Forwards `delegate.request` events into containers.
pub struct DockerDelegate {
    compute: ContainerCompute,
    marshaller: Arc<dyn Marshaller>,
    config: DelegateConfig,
    home: PathBuf,
}

impl DockerDelegate {
    pub fn new(
        compute: ContainerCompute,
        marshaller: Arc<dyn Marshaller>,
        config: DelegateConfig,
        home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            compute,
            marshaller,
            config,
            home: home.into(),
        }
    }

    /// Handle a `delegate.request`.
    ///
    /// Returns the reply to send, or `None` when the request is not for a
    /// container, the container is gone or stopped (also when that happens
    /// while the exec session opens), or the executor failed. Executor
    /// failures are reported through `progress`.
    ///
    /// # Errors
    ///
    /// Returns error if the request is malformed or the runtime cannot be
    /// queried.
    pub async fn delegate_request(
        &self,
        req: &Event,
        progress: &dyn Progress,
    ) -> Result<Option<Event>> {
        let request: DelegateRequest = serde_json::from_value(req.data.clone())
            .map_err(|e| DelegateError::InvalidRequest(e.to_string()))?;
        let instance = request.instance_data;
        let event = request.event;

        if instance.kind != "container" || instance.token.is_none() {
            debug!("Ignoring delegate request for {} {}", instance.kind, instance.uuid);
            return Ok(None);
        }

        let Some(container) = self.compute.get_container_by_name(&instance.uuid).await? else {
            error!("Can not call [{}], container does not exist", instance.uuid);
            return Ok(None);
        };

        let running = self
            .compute
            .inspect(&container.id)
            .await?
            .is_some_and(|i| i.running);
        if !running {
            error!("Can not call [{}], container is not running", instance.uuid);
            return Ok(None);
        }

        if is_empty_config_update(&event) {
            return Ok(Some(wrap_reply(req, &event, None)?));
        }

        let reply = match self.container_exec(&container.id, &event).await {
            Ok(reply) => reply,
            Err(DelegateError::Runtime(
                RuntimeError::Unavailable(message) | RuntimeError::NotFound(message),
            )) => {
                error!("Can not call [{}], {}", instance.uuid, message);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if reply.exit_code == 0 {
            Ok(Some(wrap_reply(req, &event, reply.data)?))
        } else {
            info!(
                "Event {} failed in {} with exit code {}",
                event.name, instance.uuid, reply.exit_code
            );
            progress.update(
                "Update failed",
                Some(json!({
                    "exitCode": reply.exit_code,
                    "output": reply.output,
                })),
            );
            Ok(None)
        }
    }

    /// Executor command for `event`: the executor plus the event's script.
    ///
    /// The script path is the events directory and the event name up to the
    /// first `;`, joined as text so that a name starting with `/` stays
    /// inside the events directory.
    pub fn command(&self, event: &Event) -> Vec<String> {
        let executor = self
            .config
            .executor
            .clone()
            .unwrap_or_else(|| env::executor_path(&self.home));
        let script = event.name.split(';').next().unwrap_or_default();

        vec![
            executor.display().to_string(),
            format!("{}/{}", env::events_dir_path(&self.home).display(), script),
        ]
    }

    /// Run `event` through the executor in `container_id`.
    ///
    /// I/O failures after the session is open are logged and reported as a
    /// failed reply.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be serialized or the session cannot
    /// be opened.
    pub async fn container_exec(&self, container_id: &str, event: &Event) -> Result<ExecReply> {
        let cmd = self.command(event);
        let payload = self.marshaller.to_bytes(event)?;

        let options = ExecOptions {
            attach_stdin: true,
            stream: self.config.tunnel == TunnelVariant::Hijacked,
            ..Default::default()
        };
        let mut session =
            ExecSession::open(self.compute.runtime().as_ref(), container_id, &cmd, options).await?;

        let raw = match self.config.tunnel {
            TunnelVariant::Hijacked => hijacked_exchange(&mut session, payload).await,
            TunnelVariant::Buffered => buffered_exchange(&mut session, &payload).await,
        };
        session.close();

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                error!("Exec {} in {} failed: {}", session.id(), container_id, e);
                return Ok(ExecReply::failed(e.to_string()));
            }
        };

        let text = match self.config.tunnel {
            TunnelVariant::Hijacked => match String::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => {
                    error!("Reply from {} is not UTF-8: {}", container_id, e);
                    let text = String::from_utf8_lossy(e.as_bytes()).into_owned();
                    return Ok(ExecReply::failed(text));
                }
            },
            TunnelVariant::Buffered => {
                let text = ascii_lossy(&raw);
                if !text.trim_start().starts_with('{') {
                    error!("Reply from {} is not a JSON object", container_id);
                    return Ok(ExecReply::failed(text));
                }
                text
            }
        };

        Ok(self.decode(text))
    }

    fn decode(&self, text: String) -> ExecReply {
        let value = match self.marshaller.from_bytes(text.as_bytes()) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to decode executor reply: {}", e);
                return ExecReply::failed(text);
            }
        };

        match value.get("exitCode").and_then(Value::as_i64) {
            Some(exit_code) => ExecReply {
                exit_code,
                output: value.get("output").cloned().unwrap_or(Value::Null),
                data: value.get("data").cloned().filter(|d| !d.is_null()),
            },
            None => {
                error!("Executor reply has no exit code");
                ExecReply::failed(text)
            }
        }
    }
}

async fn hijacked_exchange(
    session: &mut ExecSession,
    mut payload: Vec<u8>,
) -> crate::runtime::Result<Vec<u8>> {
    payload.push(b'\n');
    session.write(&payload).await?;
    let raw = session.read(StreamFilter::new(true, false)).await?;
    session.shutdown().await?;
    Ok(raw)
}

async fn buffered_exchange(
    session: &mut ExecSession,
    payload: &[u8],
) -> crate::runtime::Result<Vec<u8>> {
    session.write(payload).await?;
    session.shutdown().await?;
    session.read(StreamFilter::new(true, false)).await
}

fn is_empty_config_update(event: &Event) -> bool {
    event.name == "config.update"
        && event
            .data
            .get("items")
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty)
}

/// Reply to the inner event, carried as the data of the reply to `req`.
fn wrap_reply(req: &Event, event: &Event, data: Option<Value>) -> Result<Event> {
    let inner = serde_json::to_value(event.reply(data))?;
    Ok(req.reply(Some(inner)))
}

fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Injects configuration-URL environment into agent instances.
#[derive(Debug, Clone)]
pub struct AgentInstanceEnv {
    config_url: Option<String>,
    api_proxy_port: u16,
}

impl AgentInstanceEnv {
    pub fn new(config_url: Option<String>, api_proxy_port: u16) -> Self {
        Self {
            config_url,
            api_proxy_port,
        }
    }

    pub fn from_config(config: &DelegateConfig) -> Self {
        Self::new(config.config_url.clone(), config.api_proxy_port)
    }
}

impl StartListener for AgentInstanceEnv {
    fn name(&self) -> &str {
        "agent-instance-env"
    }

    fn before_start(
        &self,
        instance: &InstanceSpec,
        _host: &HostInfo,
        create: &mut CreateParams,
        _start: &mut StartParams,
    ) -> compute::Result<()> {
        if instance.agent_id.is_none() {
            return Ok(());
        }
        let Some(config_url) = &self.config_url else {
            return Ok(());
        };

        let url = url::Url::parse(config_url).map_err(|e| ComputeError::Listener {
            listener: self.name().to_string(),
            message: format!("Invalid config URL {}: {}", config_url, e),
        })?;

        if url.host_str() == Some("localhost") {
            create.add_env([
                ("DOCKHAND_AGENT_INSTANCE", "true".to_string()),
                ("DOCKHAND_CONFIG_URL_SCHEME", url.scheme().to_string()),
                ("DOCKHAND_CONFIG_URL_PATH", url.path().to_string()),
                ("DOCKHAND_CONFIG_URL_PORT", self.api_proxy_port.to_string()),
            ]);
        } else {
            create.add_env([("DOCKHAND_CONFIG_URL", config_url.clone())]);
        }

        Ok(())
    }
}
