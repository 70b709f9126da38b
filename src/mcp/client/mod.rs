//! Search client over a single MCP event-stream connection.
//!
//! One [`SearchClient`] owns one transport. Callers submit searches from any
//! task; the client serializes them onto the connection, connecting and
//! running the handshake on demand, and routes each response back to its
//! caller.

mod dispatch;
mod lifecycle;
#[cfg(test)]
mod tests;

use super::error::SearchError;
use super::protocol::SearchOptions;
use super::queue::{PendingRequest, RequestQueue};
use super::session::Session;
use super::transport::{EventTransport, HttpEventTransport};
use crate::core::config::ClientConfig;
use crate::core::token_store::CredentialStore;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub connection_state: ConnectionState,
}

/// Connection lifecycle with its per-state payload.
///
/// A session only exists while connected.
enum Link {
    Disconnected,
    Connecting {
        cancel: CancellationToken,
    },
    Connected {
        session: Session,
        cancel: CancellationToken,
    },
    /// `retry` is `None` once reconnect attempts are exhausted.
    Error {
        retry: Option<JoinHandle<()>>,
    },
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
            Link::Error { .. } => ConnectionState::Error,
        }
    }

    /// Stops the reader, heartbeat and any scheduled reconnect.
    fn shutdown(self) {
        match self {
            Link::Connecting { cancel } | Link::Connected { cancel, .. } => cancel.cancel(),
            Link::Error { retry: Some(retry) } => retry.abort(),
            Link::Error { retry: None } | Link::Disconnected => {}
        }
    }
}

struct LinkState {
    link: Link,
    /// Bumped for every connection attempt and every explicit disconnect;
    /// callbacks from older attempts are ignored.
    generation: u64,
    /// Consecutive failed attempts since the last successful connect.
    attempts: u32,
    last_error: Option<SearchError>,
}

impl LinkState {
    /// Swaps in `link`, publishes the new state and hands back the old link.
    fn replace(&mut self, link: Link, state_tx: &watch::Sender<ConnectionState>) -> Link {
        let previous = std::mem::replace(&mut self.link, link);
        state_tx.send_replace(self.link.state());
        previous
    }
}

struct Shared {
    config: ClientConfig,
    transport: Arc<dyn EventTransport>,
    credentials: Arc<dyn CredentialStore>,
    link: Mutex<LinkState>,
    state_tx: watch::Sender<ConnectionState>,
    queue: Mutex<RequestQueue>,
    draining: AtomicBool,
    next_control_id: AtomicI64,
}

impl Shared {
    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, RequestQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_control_id(&self) -> i64 {
        self.next_control_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_enabled(&self) -> bool {
        self.credentials.has_token(&self.config.server_name)
    }

    /// Drops the connection and rejects everything outstanding with `reason`.
    ///
    /// A terminal error survives; only `connect()` clears it.
    fn close(&self, reason: SearchError) {
        {
            let mut link = self.lock_link();
            link.generation += 1;
            if !matches!(link.link, Link::Error { retry: None }) {
                link.attempts = 0;
                link.last_error = None;
                link.replace(Link::Disconnected, &self.state_tx).shutdown();
            }
        }
        self.reject_all(reason);
    }

    fn reject_all(&self, err: SearchError) {
        let requests = self.lock_queue().take_all();
        if !requests.is_empty() {
            debug!(count = requests.len(), error = %err, "Rejecting outstanding MCP searches");
        }
        for request in requests {
            request.settle(Err(err.clone()));
        }
    }
}

pub struct SearchClient {
    shared: Arc<Shared>,
}

impl SearchClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn EventTransport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                credentials,
                link: Mutex::new(LinkState {
                    link: Link::Disconnected,
                    generation: 0,
                    attempts: 0,
                    last_error: None,
                }),
                state_tx,
                queue: Mutex::new(RequestQueue::default()),
                draining: AtomicBool::new(false),
                next_control_id: AtomicI64::new(0),
            }),
        }
    }

    /// Builds a client on the reqwest transport, authenticating with the
    /// token stored for `config.server_name` when one exists.
    pub fn with_http_transport(
        config: ClientConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, SearchError> {
        let token = match credentials.get_token(&config.server_name) {
            Ok(token) => token,
            Err(err) => {
                debug!(server = %config.server_name, error = %err, "MCP token lookup failed");
                None
            }
        };
        let transport = HttpEventTransport::new(&config, token)?;
        Ok(Self::new(config, Arc::new(transport), credentials))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// True when a credential is available for the configured server.
    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Queues a search and waits for its result.
    ///
    /// Requests are dispatched one at a time in call order. The request
    /// timeout starts now, not at dispatch.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<String, SearchError> {
        let shared = &self.shared;
        let id = shared.lock_queue().issue_id();
        let (reply, receiver) = oneshot::channel();
        let now = Instant::now();
        let mut request = PendingRequest::new(
            id.clone(),
            query.to_string(),
            options,
            now,
            now + shared.config.request_timeout,
            reply,
        );
        request.set_timer(shared.spawn_request_timer(id.clone()));
        shared.lock_queue().push(request);
        debug!(request_id = %id, "Queued MCP search");

        shared.kick_drain();
        receiver
            .await
            .unwrap_or_else(|_| Err(SearchError::connection_closed()))
    }

    /// Connects now instead of on the first search.
    ///
    /// This is also the only way out of the terminal error state.
    pub async fn connect(&self) -> Result<(), SearchError> {
        {
            let mut link = self.shared.lock_link();
            if matches!(link.link, Link::Error { retry: None }) {
                debug!("Resetting terminal MCP connection state");
                link.attempts = 0;
                link.last_error = None;
                link.replace(Link::Disconnected, &self.shared.state_tx);
            }
        }
        self.shared.ensure_connected().await?;
        self.shared.kick_drain();
        Ok(())
    }

    /// Closes the connection and rejects every queued and in-flight search.
    /// Safe to call repeatedly. A terminal error state is kept.
    pub async fn disconnect(&self) {
        debug!("Disconnecting MCP search client");
        self.shared.close(SearchError::connection_closed());
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn get_status(&self) -> ClientStatus {
        ClientStatus {
            name: self.shared.config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            enabled: self.is_enabled(),
            connection_state: self.get_connection_state(),
        }
    }

    /// Observes state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Drop for SearchClient {
    fn drop(&mut self) {
        self.shared.close(SearchError::connection_closed());
    }
}
