//! Event dispatch and the agent's event loop.
//!
//! [`Agent`] routes orchestrator events to the lifecycle manager, the
//! delegate and the ping reporter. [`Agent::serve`] reads one JSON event per
//! line, handles up to `workers` events at once and writes replies and
//! progress updates as JSON lines.

use crate::compute::{ComputeError, ContainerCompute};
use crate::config::{AgentConfig, ConfigError};
use crate::delegate::{AgentInstanceEnv, DelegateError, DockerDelegate};
use crate::event::{Event, EventProgress, JsonMarshaller, Progress};
use crate::instance::{HostInfo, InstanceSpec};
use crate::listener::{Listeners, StartListener};
use crate::ping::{self, HostIdentity, PingReporter};
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

pub const PING: &str = "ping";
pub const INSTANCE_ACTIVATE: &str = "compute.instance.activate";
pub const INSTANCE_DEACTIVATE: &str = "compute.instance.deactivate";
pub const DELEGATE_REQUEST: &str = "delegate.request";

/// Agent setup and event loop errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

struct Services {
    compute: ContainerCompute,
    delegate: DockerDelegate,
    ping: PingReporter,
}

/// Routes orchestrator events.
pub struct Agent {
    services: Option<Services>,
    host: HostInfo,
    workers: usize,
}

impl Agent {
    /// Build an agent over `runtime`.
    ///
    /// # Errors
    ///
    /// Returns error if the host uuid file cannot be read or created.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AgentConfig) -> Result<Self> {
        let identity = host_identity(config)?;
        let host = HostInfo {
            uuid: identity.uuid.clone(),
            name: identity.hostname.clone(),
        };

        let listeners: Listeners = [Arc::new(AgentInstanceEnv::from_config(&config.delegate))
            as Arc<dyn StartListener>]
        .into_iter()
        .collect();

        let compute = ContainerCompute::new(runtime.clone(), listeners, config.compute_config());
        let delegate = DockerDelegate::new(
            compute.clone(),
            Arc::new(JsonMarshaller),
            config.delegate.clone(),
            config.home.clone(),
        );
        let ping = PingReporter::new(runtime, identity);

        Ok(Self {
            services: Some(Services {
                compute,
                delegate,
                ping,
            }),
            host,
            workers: config.workers.max(1),
        })
    }

    /// An agent with the container engine disabled; it answers pings with
    /// empty pongs and ignores everything else.
    pub fn disabled(config: &AgentConfig) -> Self {
        let name = config.hostname();
        Self {
            services: None,
            host: HostInfo {
                uuid: config.docker.uuid.clone().unwrap_or_default(),
                name,
            },
            workers: config.workers.max(1),
        }
    }

    /// Build the agent described by `config`, connecting to the engine when
    /// it is enabled.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be reached.
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        if !config.docker.enabled {
            info!("Docker disabled, running without a container engine");
            return Ok(Self::disabled(config));
        }

        let runtime = DockerRuntime::connect(config.runtime_config()).await?;
        Self::new(Arc::new(runtime), config)
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn compute(&self) -> Option<&ContainerCompute> {
        self.services.as_ref().map(|s| &s.compute)
    }

    /// Handle one event, returning the reply to send if any.
    ///
    /// Progress updates go to `outbox`. Failures of an instruction become an
    /// error reply. Failed delegate requests are logged and get no reply.
    pub async fn handle(
        &self,
        event: &Event,
        outbox: mpsc::UnboundedSender<Event>,
    ) -> Option<Event> {
        let progress = EventProgress::new(event.clone(), outbox);

        match self.dispatch(event, &progress).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Failed to handle {}: {}", event.name, e);
                Some(event.error_reply(e.to_string()))
            }
        }
    }

    async fn dispatch(&self, event: &Event, progress: &dyn Progress) -> Result<Option<Event>> {
        let Some(services) = &self.services else {
            if event.name == PING {
                return Ok(Some(ping::empty_pong(event)));
            }
            debug!("Docker disabled, ignoring {}", event.name);
            return Ok(None);
        };

        match event.name.as_str() {
            PING => Ok(Some(services.ping.on_ping(event).await?)),
            INSTANCE_ACTIVATE => {
                let instance = instance_from(event)?;
                let id = services
                    .compute
                    .activate(&instance, &self.host, progress)
                    .await?;
                info!("Activated instance {} as {}", instance.name, id);
                let snapshot = services.compute.describe(&instance.name).await?;
                Ok(Some(event.reply(Some(snapshot.to_update()))))
            }
            INSTANCE_DEACTIVATE => {
                let instance = instance_from(event)?;
                services.compute.deactivate(&instance.name, progress).await?;
                info!("Deactivated instance {}", instance.name);
                let snapshot = services.compute.describe(&instance.name).await?;
                Ok(Some(event.reply(Some(snapshot.to_update()))))
            }
            DELEGATE_REQUEST => match services.delegate.delegate_request(event, progress).await {
                Ok(reply) => Ok(reply),
                Err(e) => {
                    error!("Dropping delegate request {}: {}", event.id, e);
                    Ok(None)
                }
            },
            other => {
                debug!("Ignoring event {}", other);
                Ok(None)
            }
        }
    }

    /// Run the event loop until `input` is exhausted.
    ///
    /// Malformed lines are logged and skipped. Returns once every accepted
    /// event has been handled and its output written.
    ///
    /// # Errors
    ///
    /// Returns error if reading `input` or writing `output` fails.
    pub async fn serve<R, W>(self: Arc<Self>, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let writer = tokio::spawn(write_events(rx, output));
        let semaphore = Arc::new(Semaphore::new(self.workers));

        info!("Serving events with {} workers", self.workers);

        let mut lines = BufReader::new(input).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event: Event = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed event: {}", e);
                    continue;
                }
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let agent = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                debug!("Handling event {} ({})", event.name, event.id);
                if let Some(reply) = agent.handle(&event, tx.clone()).await {
                    let _ = tx.send(reply);
                }
                drop(permit);
            });
        }

        // Wait for in-flight events.
        let _all = semaphore.acquire_many(self.workers as u32).await;
        drop(tx);

        match writer.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::Io(std::io::Error::other(e))),
        }
    }
}

async fn write_events<W>(mut rx: mpsc::UnboundedReceiver<Event>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event).map_err(std::io::Error::other)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

/// Instance carried by a lifecycle event, under `instanceHostMap.instance`
/// or `instance`.
fn instance_from(event: &Event) -> Result<InstanceSpec> {
    let value = event
        .data
        .pointer("/instanceHostMap/instance")
        .or_else(|| event.data.get("instance"))
        .cloned()
        .unwrap_or(Value::Null);

    if value.is_null() {
        return Err(AgentError::InvalidEvent(format!(
            "{} carries no instance",
            event.name
        )));
    }

    let instance: InstanceSpec =
        serde_json::from_value(value).map_err(|e| AgentError::InvalidEvent(e.to_string()))?;
    if instance.name.is_empty() {
        return Err(AgentError::InvalidEvent(format!(
            "{} instance has no name",
            event.name
        )));
    }
    Ok(instance)
}

fn host_identity(config: &AgentConfig) -> Result<HostIdentity> {
    let uuid = match &config.docker.uuid {
        Some(uuid) => uuid.clone(),
        None => ping::load_or_create_uuid(&config.uuid_file())?,
    };

    Ok(HostIdentity {
        hostname: config.hostname(),
        physical_host_uuid: config
            .physical_host_uuid
            .clone()
            .unwrap_or_else(|| uuid.clone()),
        ip: config.host_ip(),
        uuid,
    })
}
