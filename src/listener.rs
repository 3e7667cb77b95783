//! Hooks invoked around container start.
//!
//! Network wiring, port publishing and similar add-ons plug in here. They run
//! synchronously in registration order; an error from any of them aborts the
//! activation.

use crate::compute::{ComputeError, Result};
use crate::instance::{HostInfo, InstanceSpec};
use crate::runtime::{CreateParams, StartParams};
use std::sync::Arc;

/// A start hook.
pub trait StartListener: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Called before the container is created/started. May adjust both
    /// parameter sets.
    fn before_start(
        &self,
        instance: &InstanceSpec,
        host: &HostInfo,
        create: &mut CreateParams,
        start: &mut StartParams,
    ) -> Result<()>;

    /// Called once the runtime reports the container started.
    fn after_start(
        &self,
        _instance: &InstanceSpec,
        _host: &HostInfo,
        _container_id: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered collection of start hooks.
#[derive(Clone, Default)]
pub struct Listeners {
    listeners: Vec<Arc<dyn StartListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; hooks run in the order they were added.
    pub fn register(&mut self, listener: Arc<dyn StartListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn before_start(
        &self,
        instance: &InstanceSpec,
        host: &HostInfo,
        create: &mut CreateParams,
        start: &mut StartParams,
    ) -> Result<()> {
        for listener in &self.listeners {
            listener
                .before_start(instance, host, create, start)
                .map_err(|e| wrap(listener.name(), e))?;
        }
        Ok(())
    }

    pub(crate) fn after_start(
        &self,
        instance: &InstanceSpec,
        host: &HostInfo,
        container_id: &str,
    ) -> Result<()> {
        for listener in &self.listeners {
            listener
                .after_start(instance, host, container_id)
                .map_err(|e| wrap(listener.name(), e))?;
        }
        Ok(())
    }
}

fn wrap(name: &str, err: ComputeError) -> ComputeError {
    match err {
        ComputeError::Listener { .. } => err,
        other => ComputeError::Listener {
            listener: name.to_string(),
            message: other.to_string(),
        },
    }
}

impl FromIterator<Arc<dyn StartListener>> for Listeners {
    fn from_iter<I: IntoIterator<Item = Arc<dyn StartListener>>>(iter: I) -> Self {
        Self {
            listeners: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl StartListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn before_start(
            &self,
            _instance: &InstanceSpec,
            _host: &HostInfo,
            create: &mut CreateParams,
            _start: &mut StartParams,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            create.add_env([(self.name.clone(), "seen")]);
            if self.fail {
                return Err(ComputeError::InvalidSpec("refused".to_string()));
            }
            Ok(())
        }
    }

    fn host() -> HostInfo {
        HostInfo {
            uuid: "host-1".to_string(),
            name: "node".to_string(),
        }
    }

    #[test]
    fn test_listeners_run_in_order_and_stop_on_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |name: &str, fail: bool| -> Arc<dyn StartListener> {
            Arc::new(Recorder {
                name: name.to_string(),
                log: log.clone(),
                fail,
            })
        };

        let listeners: Listeners = [
            make("first", false),
            make("second", true),
            make("third", false),
        ]
        .into_iter()
        .collect();

        let mut create = CreateParams::default();
        let mut start = StartParams::default();
        let err = listeners
            .before_start(&InstanceSpec::default(), &host(), &mut create, &mut start)
            .unwrap_err();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert!(create.env.contains_key("first"));
        assert!(matches!(err, ComputeError::Listener { ref listener, .. } if listener == "second"));
    }
}
