//! Supervisor for all configured proxy instances.
//!
//! Binds every instance concurrently, runs each accept loop as a tracked
//! task, and on shutdown closes every listener while collecting the
//! individual failures. Shutdown means "stop accepting"; in-flight
//! connections are not drained.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::listener::ProxyInstance;
use crate::config::ProxyConfig;
use crate::error::{PppxyError, Result};

/// A failure tagged with the listen address of the instance it came from.
pub type InstanceFailure = (String, PppxyError);

/// Owns the proxy instances and their accept-loop tasks.
pub struct InstanceGroup {
    instances: Vec<Arc<ProxyInstance>>,
    tasks: JoinSet<(String, Result<()>)>,
}

impl InstanceGroup {
    pub fn new(configs: impl IntoIterator<Item = ProxyConfig>) -> Self {
        Self {
            instances: configs
                .into_iter()
                .map(|config| Arc::new(ProxyInstance::new(config)))
                .collect(),
            tasks: JoinSet::new(),
        }
    }

    pub fn instances(&self) -> &[Arc<ProxyInstance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Bind every instance and start serving the ones that bound.
    ///
    /// One instance failing to bind does not stop the others. The failures
    /// are returned so the caller can decide whether to abort.
    pub async fn start(&mut self) -> Vec<InstanceFailure> {
        let results = join_all(self.instances.iter().map(|instance| instance.listen())).await;

        let mut failures = Vec::new();
        for (instance, result) in self.instances.iter().zip(results) {
            let listen_addr = instance.config().listen_addr.clone();
            match result {
                Ok(_) => {
                    let instance = Arc::clone(instance);
                    self.tasks.spawn(async move {
                        let result = instance.serve().await;
                        (listen_addr, result)
                    });
                }
                Err(e) => {
                    error!(listen_addr = %listen_addr, error = %e, "Failed to start TCP server");
                    failures.push((listen_addr, e));
                }
            }
        }

        info!(
            started = self.tasks.len(),
            failed = failures.len(),
            "Instance group started"
        );
        failures
    }

    /// Wait for an accept loop to fail.
    ///
    /// Loops that stop cleanly (after `close`) are skipped. Returns `None`
    /// once no accept loop is left.
    pub async fn next_failure(&mut self) -> Option<PppxyError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => continue,
                Ok((listen_addr, Err(e))) => {
                    error!(listen_addr = %listen_addr, error = %e, "Accept loop failed");
                    return Some(e);
                }
                Err(e) => {
                    error!(error = %e, "Accept loop task failed");
                    return Some(PppxyError::Task(e));
                }
            }
        }
        None
    }

    /// Close every instance and reap the accept loops.
    ///
    /// A failure closing one instance is logged and collected; the
    /// remaining instances are still closed.
    pub async fn shutdown(&mut self) -> Vec<InstanceFailure> {
        info!(instances = self.instances.len(), "Closing all listeners");

        let mut failures = Vec::new();
        for instance in &self.instances {
            let listen_addr = instance.config().listen_addr.clone();
            if let Err(e) = instance.close().await {
                error!(listen_addr = %listen_addr, error = %e, "Failed to close pppxy listener");
                failures.push((listen_addr, e));
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((listen_addr, Err(e))) => {
                    error!(listen_addr = %listen_addr, error = %e, "Accept loop failed");
                    failures.push((listen_addr, e));
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "Accept loop task failed");
                    failures.push((String::new(), PppxyError::Task(e)));
                }
            }
        }

        failures
    }
}
