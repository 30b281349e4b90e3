//! Sessions and server-to-client streaming
//!
//! Implements the streaming half of MCP Streamable HTTP (2025-03-26):
//! - `initialize` creates a session, identified by the `Mcp-Session-Id` header
//! - GET /mcp opens an SSE stream for that session
//! - a single scheduler task pushes a `heartbeat` event to every open stream
//!   so idle connections survive proxies

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_stream::stream;
use axum::response::sse::{Event, Sse};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Prefix of every session identifier
pub const SESSION_PREFIX: &str = "tg-";

/// Header carrying the session identifier
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Event pushed to a session's stream
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Keep-alive tick
    Heartbeat {
        /// Unix time in seconds
        timestamp: u64,
    },
}

impl SessionEvent {
    /// Heartbeat stamped with the current wall-clock time
    #[must_use]
    pub fn heartbeat_now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self::Heartbeat { timestamp }
    }

    fn to_sse(&self) -> Event {
        match self {
            Self::Heartbeat { timestamp } => Event::default()
                .event("heartbeat")
                .data(json!({ "type": "heartbeat", "timestamp": timestamp }).to_string()),
        }
    }
}

/// A client session
#[derive(Debug)]
pub struct Session {
    id: String,
    client_id: String,
    protocol_version: String,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client that created the session
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Negotiated protocol version
    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record activity
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for one invocation on this session; cancelled with the session
    #[must_use]
    pub fn invocation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Push an event to open streams. Returns `false` if nobody is listening.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Number of open SSE streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Owns every live session
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    root: CancellationToken,
    buffer_size: usize,
}

impl SessionManager {
    /// Sessions whose tokens are children of `root`
    #[must_use]
    pub fn new(root: CancellationToken, buffer_size: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            root,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Create and register a session
    pub fn create(&self, client_id: &str, protocol_version: &str) -> Arc<Session> {
        let (tx, _) = broadcast::channel(self.buffer_size);
        let now = Instant::now();
        let session = Arc::new(Session {
            id: format!("{SESSION_PREFIX}{}", Uuid::new_v4()),
            client_id: client_id.to_string(),
            protocol_version: protocol_version.to_string(),
            created_at: now,
            last_activity: Mutex::new(now),
            cancel: self.root.child_token(),
            tx,
        });
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, client_ip = %client_id, "Session created");
        session
    }

    /// Look up a session and record activity on it
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Close and forget a session. Returns `false` if it did not exist.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                session.close();
                info!(
                    session_id = %id,
                    client_ip = %session.client_id(),
                    age_secs = session.age().as_secs(),
                    "Session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Push `event` to every session. Returns how many had a listener.
    pub fn broadcast(&self, event: &SessionEvent) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|session| session.send(event.clone()))
            .count()
    }

    /// Close sessions idle for longer than `idle_timeout`
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.idle_for() <= idle_timeout || session.stream_count() > 0;
            if !keep {
                session.close();
                debug!(
                    session_id = %id,
                    client_ip = %session.client_id(),
                    age_secs = session.age().as_secs(),
                    "Reaped idle session"
                );
            }
            keep
        });
        before - sessions.len()
    }

    /// Close every session
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        drained.len()
    }
}

/// SSE stream for `session`.
///
/// Ends when the session is closed (DELETE, idle reaping or shutdown).
pub fn create_sse_response(
    session: Arc<Session>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = session.tx.subscribe();
    let cancel = session.cancel.clone();
    let session_id = session.id.clone();

    let stream = stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(json!({ "session_id": session_id }).to_string()));

        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => yield Ok(event.to_sse()),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "missed": n }).to_string()));
                }
            }
        }
        debug!(session_id = %session_id, "SSE stream ended");
    };

    Sse::new(stream)
}

/// Spawn the heartbeat scheduler.
///
/// Ticks every `interval` until `cancel` fires, sending one heartbeat to
/// every open session stream per tick.
pub fn spawn_heartbeat(
    sessions: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let delivered = sessions.broadcast(&SessionEvent::heartbeat_now());
                    debug!(sessions = delivered, "Heartbeat sent");
                }
            }
        }
        debug!("Heartbeat scheduler stopped");
    })
}
