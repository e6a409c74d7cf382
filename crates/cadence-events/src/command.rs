//! "Poll now" commands.
//!
//! A poll command wakes the worker that owns a shard key and clears its
//! backoff. The owner is found through the cluster's shard map. Without a
//! shard key every worker is signalled.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;

use crate::backoff::Backoff;
use crate::shard::ClusterView;

/// Local handle that resets one engine's backoff and wakes its loop.
#[derive(Clone)]
pub struct PollHandle {
    backoff: Arc<Mutex<Backoff>>,
    wake: Arc<Notify>,
}

impl PollHandle {
    pub(crate) fn new(backoff: Arc<Mutex<Backoff>>, wake: Arc<Notify>) -> Self {
        Self { backoff, wake }
    }

    pub fn poll_now(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.wake.notify_one();
    }
}

/// Delivers a poll command to another worker.
#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn send_poll(&self, endpoint: &str) -> Result<()>;
}

/// In-process transport: every endpoint is an engine in this process.
#[derive(Default)]
pub struct LocalPollTransport {
    handles: RwLock<HashMap<String, PollHandle>>,
}

impl LocalPollTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: &str, handle: PollHandle) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), handle);
    }
}

#[async_trait]
impl PollTransport for LocalPollTransport {
    async fn send_poll(&self, endpoint: &str) -> Result<()> {
        let handle = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned();
        match handle {
            Some(handle) => {
                handle.poll_now();
                Ok(())
            }
            None => Err(CadenceError::other(format!("unknown endpoint '{endpoint}'"))),
        }
    }
}

/// Routes poll commands to the worker owning a shard key.
pub struct PollRouter {
    cluster: ClusterView,
    local: PollHandle,
    transport: Arc<dyn PollTransport>,
}

impl PollRouter {
    pub fn new(cluster: ClusterView, local: PollHandle, transport: Arc<dyn PollTransport>) -> Self {
        Self {
            cluster,
            local,
            transport,
        }
    }

    /// Signal the owner of `shard_key`, or every worker when `None`.
    /// Returns the endpoints that were signalled.
    pub async fn poll(&self, shard_key: Option<u32>) -> Result<Vec<String>> {
        let targets: Vec<String> = match shard_key {
            Some(key) => {
                let endpoint = self.cluster.endpoint_for(key).ok_or_else(|| {
                    CadenceError::Config(format!("no endpoint owns shard key {key}"))
                })?;
                vec![endpoint.to_string()]
            }
            None => self.cluster.endpoints().to_vec(),
        };

        for endpoint in &targets {
            if endpoint == self.cluster.self_name() {
                self.local.poll_now();
            } else {
                self.transport.send_poll(endpoint).await?;
            }
            tracing::debug!("📣 Poll command sent to {endpoint}");
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::config::ClusterConfig;
    use std::time::Duration;

    fn handle() -> (PollHandle, Arc<Mutex<Backoff>>) {
        let backoff = Arc::new(Mutex::new(Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            1.5,
        )));
        backoff.lock().unwrap().next_interval();
        (PollHandle::new(backoff.clone(), Arc::new(Notify::new())), backoff)
    }

    fn cluster(self_name: &str) -> ClusterView {
        ClusterView::new(&ClusterConfig {
            self_name: self_name.into(),
            endpoints: vec!["a".into(), "b".into()],
            max_shard_key: 99,
        })
        .unwrap()
    }

    #[test]
    fn test_poll_now_resets_backoff() {
        let (handle, backoff) = handle();
        assert!(!backoff.lock().unwrap().cur_poll().is_zero());
        handle.poll_now();
        assert!(backoff.lock().unwrap().cur_poll().is_zero());
        assert!(backoff.lock().unwrap().poll_in().is_zero());
    }

    #[tokio::test]
    async fn test_routes_to_shard_owner() {
        let (local, local_backoff) = handle();
        let (remote, remote_backoff) = handle();
        let transport = Arc::new(LocalPollTransport::new());
        transport.register("b", remote);

        let router = PollRouter::new(cluster("a"), local, transport);
        assert_eq!(router.poll(Some(80)).await.unwrap(), vec!["b"]);
        assert!(remote_backoff.lock().unwrap().cur_poll().is_zero());
        assert!(!local_backoff.lock().unwrap().cur_poll().is_zero());

        assert_eq!(router.poll(Some(10)).await.unwrap(), vec!["a"]);
        assert!(local_backoff.lock().unwrap().cur_poll().is_zero());
    }

    #[tokio::test]
    async fn test_broadcast_without_shard_key() {
        let (local, local_backoff) = handle();
        let (remote, remote_backoff) = handle();
        let transport = Arc::new(LocalPollTransport::new());
        transport.register("a", remote);

        let router = PollRouter::new(cluster("b"), local, transport);
        assert_eq!(router.poll(None).await.unwrap(), vec!["a", "b"]);
        assert!(local_backoff.lock().unwrap().cur_poll().is_zero());
        assert!(remote_backoff.lock().unwrap().cur_poll().is_zero());
    }

    #[tokio::test]
    async fn test_unknown_remote_endpoint_errors() {
        let (local, _) = handle();
        let router = PollRouter::new(cluster("a"), local, Arc::new(LocalPollTransport::new()));
        assert!(router.poll(Some(90)).await.is_err());
    }
}
