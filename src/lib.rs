//! # Dockhand
//!
//! A node-resident agent that reconciles desired container state against the
//! local Docker (or Podman) engine and tunnels request/reply events into
//! running containers through exec sessions.
//!
//! ## Architecture Overview
//!
//! - **[`frame`]**: decoder for the engine's multiplexed stdout/stderr format
//! - **[`runtime`]**: container engine capabilities behind a trait, with a
//!   bollard-backed implementation
//! - **[`exec`]**: attached command sessions inside containers
//! - **[`compute`]**: idempotent activation, stop-then-kill deactivation and
//!   state snapshots
//! - **[`delegate`]**: forwards events to an executor inside the container
//! - **[`agent`]**: routes orchestrator events and runs the event loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dockhand::{Agent, AgentConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::default();
//!     let agent = Arc::new(Agent::from_config(&config).await?);
//!
//!     agent.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
//!     Ok(())
//! }
//! ```

/// Multiplexed stream decoding.
pub mod frame;

/// Container engine access.
pub mod runtime;

/// Command sessions in running containers.
pub mod exec;

/// Instance specifications.
pub mod instance;

/// Orchestrator events, marshalling and progress reporting.
pub mod event;

/// Start hooks.
pub mod listener;

/// Container lifecycle management.
pub mod compute;

/// Event forwarding into containers.
pub mod delegate;

/// Ping replies.
pub mod ping;

/// Event dispatch and the serve loop.
pub mod agent;

pub mod config;
pub mod env;

/// Command line interface.
pub mod cli;

pub use agent::{Agent, AgentError};
pub use compute::{ComputeConfig, ComputeError, ContainerCompute, InstanceSnapshot};
pub use config::AgentConfig;
pub use delegate::{AgentInstanceEnv, DelegateConfig, DockerDelegate, TunnelVariant};
pub use event::{Event, JsonMarshaller, Marshaller, NoProgress, Progress};
pub use exec::ExecSession;
pub use frame::{BufferedFrames, LiveFrames, StreamFilter, StreamType};
pub use instance::{HostInfo, InstanceSpec};
pub use listener::{Listeners, StartListener};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
