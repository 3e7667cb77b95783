//! In-memory container runtime for driving the agent without an engine.

#![allow(dead_code)]

use async_trait::async_trait;
use dockhand::event::Progress;
use dockhand::frame::{StreamType, encode_frame};
use dockhand::runtime::{
    ContainerInspect, ContainerRuntime, ContainerSummary, CreateParams, ExecChannel, ExecOptions,
    PortSummary, Result, RuntimeError, StartParams,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// How a container reacts to a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    Stops,
    Ignores,
    TimesOut,
}

/// Produces the raw (framed) exec output for a request.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub ports: Vec<PortSummary>,
    pub create: CreateParams,
    pub start: StartParams,
}

struct State {
    containers: Vec<FakeContainer>,
    images: HashSet<String>,
    calls: Vec<String>,
    stop: StopBehavior,
    kill_works: bool,
    lose_create_race: bool,
    next_id: usize,
}

pub struct FakeRuntime {
    state: Mutex<State>,
    responder: Mutex<Option<Responder>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                containers: Vec::new(),
                images: HashSet::new(),
                calls: Vec::new(),
                stop: StopBehavior::Stops,
                kill_works: true,
                lose_create_race: false,
                next_id: 1,
            }),
            responder: Mutex::new(None),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    pub fn with_container(self, name: &str, running: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = format!("c{}", state.next_id);
            state.next_id += 1;
            state.containers.push(FakeContainer {
                id,
                name: name.to_string(),
                running,
                ports: Vec::new(),
                create: CreateParams::default(),
                start: StartParams::default(),
            });
        }
        self
    }

    pub fn with_ports(self, name: &str, ports: Vec<PortSummary>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(c) = state.containers.iter_mut().find(|c| c.name == name) {
                c.ports = ports;
            }
        }
        self
    }

    pub fn with_stop(self, stop: StopBehavior, kill_works: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.stop = stop;
            state.kill_works = kill_works;
        }
        self
    }

    /// The next create loses to a concurrent activation of the same name.
    pub fn losing_create_race(self) -> Self {
        self.state.lock().unwrap().lose_create_race = true;
        self
    }

    pub fn with_responder(self, responder: Responder) -> Self {
        *self.responder.lock().unwrap() = Some(responder);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of calls whose name starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Bytes received by exec sessions, one entry per session.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn summary(c: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: c.id.clone(),
            names: vec![format!("/{}", c.name)],
            image: c.create.image.clone(),
            state: if c.running { "running" } else { "exited" }.to_string(),
            status: String::new(),
            ports: c.ports.clone(),
        }
    }
}

/// Executor reply framed on stdout.
pub fn framed_reply(exit_code: i64, output: &str, data: serde_json::Value) -> Vec<u8> {
    let body = json!({"exitCode": exit_code, "output": output, "data": data}).to_string();
    let mut out = Vec::new();
    encode_frame(StreamType::Stderr, b"executor starting\n", &mut out);
    encode_frame(StreamType::Stdout, body.as_bytes(), &mut out);
    out
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.record(format!("list:{}", all));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(Self::summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        self.record(format!("inspect:{}", id));
        let state = self.state.lock().unwrap();
        let c = state
            .containers
            .iter()
            .find(|c| c.id == id || c.name == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        Ok(ContainerInspect {
            id: c.id.clone(),
            running: c.running,
            ip_address: c.running.then(|| "172.17.0.2".to_string()),
            raw: json!({"Id": c.id, "State": {"Running": c.running}}),
        })
    }

    async fn create_container(&self, create: &CreateParams, start: &StartParams) -> Result<String> {
        self.record(format!("create:{}", create.name));
        let mut state = self.state.lock().unwrap();

        if state.lose_create_race {
            state.lose_create_race = false;
            let id = format!("c{}", state.next_id);
            state.next_id += 1;
            state.containers.push(FakeContainer {
                id,
                name: create.name.clone(),
                running: false,
                ports: Vec::new(),
                create: create.clone(),
                start: start.clone(),
            });
            return Err(RuntimeError::Conflict(create.name.clone()));
        }

        if state.containers.iter().any(|c| c.name == create.name) {
            return Err(RuntimeError::Conflict(create.name.clone()));
        }
        if !state.images.contains(&create.image) {
            return Err(RuntimeError::ImageNotFound(create.image.clone()));
        }

        let id = format!("c{}", state.next_id);
        state.next_id += 1;
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: create.name.clone(),
            running: false,
            ports: Vec::new(),
            create: create.clone(),
            start: start.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start:{}", id));
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        self.record(format!("stop:{}", id));
        let mut state = self.state.lock().unwrap();
        let behavior = state.stop;
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        match behavior {
            StopBehavior::Stops => {
                c.running = false;
                Ok(())
            }
            StopBehavior::Ignores => Ok(()),
            StopBehavior::TimesOut => Err(RuntimeError::Timeout(format!("stop {}", id))),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.record(format!("kill:{}", id));
        let mut state = self.state.lock().unwrap();
        let kill_works = state.kill_works;
        let c = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if kill_works {
            c.running = false;
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str, progress: &dyn Progress) -> Result<()> {
        self.record(format!("pull:{}", image));
        progress.update("Downloaded", None);
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        options: &ExecOptions,
    ) -> Result<String> {
        self.record(format!("create_exec:{}:{}", container, cmd.join(" ")));
        assert!(options.attach_stdin);

        let mut state = self.state.lock().unwrap();
        let running = state
            .containers
            .iter()
            .any(|c| (c.id == container || c.name == container) && c.running);
        if !running {
            return Err(RuntimeError::Unavailable(container.to_string()));
        }

        let id = format!("exec{}", state.next_id);
        state.next_id += 1;
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, _options: &ExecOptions) -> Result<ExecChannel> {
        self.record(format!("start_exec:{}", exec_id));
        let responder = self
            .responder
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RuntimeError::Unavailable("no executor".to_string()))?;

        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let requests = self.requests.clone();

        tokio::spawn(async move {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.contains(&b'\n') {
                            break;
                        }
                    }
                }
            }
            requests.lock().unwrap().push(request.clone());

            let trimmed = request.strip_suffix(b"\n").unwrap_or(&request[..]);
            let reply = responder(trimmed);
            let _ = remote.write_all(&reply).await;
            let _ = remote.shutdown().await;
        });

        Ok(Box::new(local))
    }
}
