//! Bounded-time shutdown
//!
//! Order matters:
//! 1. background tasks (heartbeat, maintenance) stop first
//! 2. the server-wide token is cancelled, ending sessions and invocations
//! 3. the listener stops accepting and drains connections
//! 4. in-flight invocations get until the grace deadline
//! 5. the serve task is awaited, bounded by the same deadline

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::server::ServerState;
use super::streaming::SessionManager;
use crate::{Error, Result};

/// Extra time allowed for the listener to return after the grace deadline
const LISTENER_SLACK: Duration = Duration::from_millis(500);

/// Everything the gateway must stop, in the order it must stop it
#[derive(Debug)]
pub struct ShutdownCoordinator {
    background: CancellationToken,
    background_tasks: Vec<JoinHandle<()>>,
    server: CancellationToken,
    sessions: Arc<SessionManager>,
    stop_listener: Option<oneshot::Sender<Duration>>,
    invocations: TaskTracker,
    serve_task: Option<JoinHandle<io::Result<()>>>,
    state: watch::Sender<ServerState>,
}

impl ShutdownCoordinator {
    /// Assemble a coordinator.
    ///
    /// `stop_listener` receives the grace period when the listener must stop
    /// accepting; `serve_task` resolves once it has.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        background: CancellationToken,
        background_tasks: Vec<JoinHandle<()>>,
        server: CancellationToken,
        sessions: Arc<SessionManager>,
        stop_listener: oneshot::Sender<Duration>,
        invocations: TaskTracker,
        serve_task: JoinHandle<io::Result<()>>,
        state: watch::Sender<ServerState>,
    ) -> Self {
        Self {
            background,
            background_tasks,
            server,
            sessions,
            stop_listener: Some(stop_listener),
            invocations,
            serve_task: Some(serve_task),
            state,
        }
    }

    /// Whether the serve task has already returned
    #[must_use]
    pub fn listener_finished(&self) -> bool {
        self.serve_task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop everything within `grace` (plus a small listener slack).
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener itself failed.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        self.state.send_replace(ServerState::Draining);
        info!(grace_ms = grace.as_millis(), "Shutting down");

        self.background.cancel();
        for task in self.background_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        debug!("Background tasks stopped");

        self.server.cancel();
        let closed = self.sessions.close_all();
        debug!(sessions = closed, "Sessions closed");

        if let Some(stop) = self.stop_listener.take() {
            let _ = stop.send(grace);
        }

        self.invocations.close();
        if timeout_at(deadline, self.invocations.wait()).await.is_err() {
            warn!(
                abandoned = self.invocations.len(),
                "Tool invocations still running at the grace deadline; abandoning them"
            );
        }

        let result = match self.serve_task.take() {
            Some(mut serve) => match timeout_at(deadline + LISTENER_SLACK, &mut serve).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(Error::Io(e)),
                Ok(Err(e)) => Err(Error::Internal(format!("listener task failed: {e}"))),
                Err(_) => {
                    warn!("Listener did not stop before the grace deadline; aborting it");
                    serve.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };

        self.state.send_replace(ServerState::Stopped);
        info!("Shutdown complete");
        result
    }
}
