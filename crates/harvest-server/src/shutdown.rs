//! Ordered gateway shutdown.
//!
//! Stop accepting sockets, let in-flight queries reply, close the worker pool,
//! close every connection, then wait for the server tasks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gateway::QueryGateway;

/// Time allowed for server tasks to exit once connections are closed.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened during shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight query finished within the drain timeout.
    pub drained: bool,
    pub connections_closed: usize,
    /// Workers still running past their deadline when the pool closed.
    pub abandoned_workers: usize,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by the listener and background sweeps.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run the full shutdown sequence. Queries still running after
    /// `drain_timeout` are left to finish unobserved.
    pub async fn graceful_shutdown(
        &self,
        gateway: &QueryGateway,
        handles: Vec<JoinHandle<()>>,
        drain_timeout: Duration,
    ) -> ShutdownReport {
        self.shutdown();
        info!(
            in_flight = gateway.in_flight(),
            drain_timeout_secs = drain_timeout.as_secs(),
            "shutting down gateway"
        );

        let drained = gateway.drain(drain_timeout).await;

        let invoker = gateway.invoker();
        invoker.close();
        let abandoned_workers = invoker.abandoned();

        let connections_closed = gateway.registry().close_all().await;

        if tokio::time::timeout(TASK_JOIN_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("server tasks did not exit within {TASK_JOIN_TIMEOUT:?}");
        }

        let report = ShutdownReport {
            drained,
            connections_closed,
            abandoned_workers,
        };
        info!(
            drained,
            connections_closed, abandoned_workers, "gateway shutdown complete"
        );
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::RecordingHandle;
    use crate::registry::ConnectionRegistry;
    use harvest_core::ids::UserId;
    use harvest_engine::pipelines::EchoPipeline;
    use harvest_engine::{BoundedInvoker, InvokerConfig};
    use std::sync::Arc;

    fn gateway(deadline: Duration) -> Arc<QueryGateway> {
        Arc::new(QueryGateway::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(BoundedInvoker::new(InvokerConfig {
                workers: 2,
                deadline,
            })),
            Arc::new(EchoPipeline),
        ))
    }

    #[test]
    fn token_propagation() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let gateway = gateway(Duration::from_secs(5));
        let a = RecordingHandle::new();
        let b = RecordingHandle::new();
        gateway.registry().connect(UserId::from_raw("a"), a.clone()).await;
        gateway.registry().connect(UserId::from_raw("b"), b.clone()).await;

        let coord = ShutdownCoordinator::new();
        let report = coord
            .graceful_shutdown(&gateway, Vec::new(), Duration::from_secs(1))
            .await;

        assert!(report.drained);
        assert_eq!(report.connections_closed, 2);
        assert_eq!(a.close_count(), 1);
        assert_eq!(b.close_count(), 1);
        assert_eq!(gateway.registry().count(), 0);
    }

    #[tokio::test]
    async fn in_flight_reply_lands_before_connections_close() {
        let gateway = gateway(Duration::from_secs(5));
        let user = UserId::from_raw("u1");
        let handle = RecordingHandle::new();
        gateway.registry().connect(user.clone(), handle.clone()).await;

        gateway.dispatch(user, r#"{"type":"query","text":"hello"}"#);

        let coord = ShutdownCoordinator::new();
        let report = coord
            .graceful_shutdown(&gateway, Vec::new(), Duration::from_secs(2))
            .await;

        assert!(report.drained);
        let messages = handle.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "response");
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_server_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let task = tokio::spawn(async move { token.cancelled().await });

        let gateway = gateway(Duration::from_secs(1));
        let report = coord
            .graceful_shutdown(&gateway, vec![task], Duration::from_millis(100))
            .await;
        assert_eq!(report.connections_closed, 0);
        assert!(coord.is_shutting_down());
    }
}
