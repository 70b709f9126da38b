use super::{Link, LinkState, Shared};
use crate::mcp::error::SearchError;
use crate::mcp::frame::FrameBuffer;
use crate::mcp::handshake::{handshake_steps, run_handshake};
use crate::mcp::protocol::encode_request;
use crate::mcp::session::Session;
use crate::mcp::transport::EventStream;
use futures_util::StreamExt;
use reqwest::Url;
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::RequestId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum Readiness {
    Ready,
    Failed(SearchError),
    Establish(u64, CancellationToken),
    /// Another attempt is in progress or scheduled; the value is the
    /// generation whose outcome we are waiting for.
    Wait(u64),
}

impl Shared {
    /// Resolves once the link is connected and initialized.
    ///
    /// Starts an attempt when disconnected. When an attempt is already in
    /// flight or scheduled, waits for its outcome instead of opening a second
    /// transport, bounded by the connect timeout.
    pub(super) async fn ensure_connected(self: &Arc<Self>) -> Result<(), SearchError> {
        let mut state_rx = self.state_tx.subscribe();
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut waiting_on: Option<u64> = None;

        loop {
            let readiness = {
                let mut link = self.lock_link();
                let observed = match &link.link {
                    Link::Connected { session, .. } if session.initialized => {
                        Some(Readiness::Ready)
                    }
                    Link::Connected { .. } | Link::Connecting { .. } => {
                        Some(Readiness::Wait(link.generation))
                    }
                    Link::Error { retry: None } => Some(Readiness::Failed(terminal_error(&link))),
                    Link::Error { retry: Some(_) } => match waiting_on {
                        Some(generation) if link.generation >= generation => {
                            Some(Readiness::Failed(last_error(&link)))
                        }
                        _ => Some(Readiness::Wait(link.generation + 1)),
                    },
                    Link::Disconnected if waiting_on.is_some() => {
                        Some(Readiness::Failed(SearchError::connection_closed()))
                    }
                    Link::Disconnected => None,
                };
                observed.unwrap_or_else(|| {
                    let (generation, cancel) = self.begin_attempt(&mut link);
                    Readiness::Establish(generation, cancel)
                })
            };

            match readiness {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(err) => return Err(err),
                Readiness::Establish(generation, cancel) => {
                    return self.establish(generation, cancel).await;
                }
                Readiness::Wait(generation) => {
                    waiting_on.get_or_insert(generation);
                    match timeout_at(deadline, state_rx.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(SearchError::connection_closed()),
                        Err(_) => {
                            return Err(SearchError::Timeout {
                                operation: "connect",
                                after: self.config.connect_timeout,
                            })
                        }
                    }
                }
            }
        }
    }

    fn begin_attempt(&self, link: &mut LinkState) -> (u64, CancellationToken) {
        link.generation += 1;
        let cancel = CancellationToken::new();
        // The previous link is either idle or the retry task running this.
        drop(link.replace(
            Link::Connecting {
                cancel: cancel.clone(),
            },
            &self.state_tx,
        ));
        debug!(
            generation = link.generation,
            attempts = link.attempts,
            "Opening MCP connection"
        );
        (link.generation, cancel)
    }

    /// Runs one connection attempt under the connect timeout.
    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<(), SearchError> {
        let limit = self.config.connect_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SearchError::connection(
                "event stream closed before the handshake finished",
            )),
            result = tokio::time::timeout(limit, self.open_session(generation, cancel.clone())) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(SearchError::Timeout {
                        operation: "connect",
                        after: limit,
                    }),
                }
            }
        };

        match outcome {
            Ok(session) => self.mark_connected(generation, session, cancel),
            Err(err) => {
                debug!(generation, error = %err, "MCP connection attempt failed");
                self.fail_connection(generation, err.clone());
                Err(err)
            }
        }
    }

    async fn open_session(
        self: &Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<Session, SearchError> {
        let stream = self.transport.open().await?;
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).read_events(generation, stream, endpoint_tx, cancel));

        let endpoint = endpoint_rx.await.map_err(|_| {
            SearchError::connection("event stream closed before endpoint discovery")
        })?;
        let mut session = Session::from_endpoint(&self.transport.origin(), &endpoint)?;
        debug!(
            session_id = %session.session_id,
            endpoint = %session.message_endpoint,
            "Discovered MCP session"
        );

        let steps = handshake_steps(&self.config, || self.next_control_id())?;
        run_handshake(
            self.transport.as_ref(),
            &mut session,
            steps,
            self.config.handshake_delay,
        )
        .await?;
        Ok(session)
    }

    fn mark_connected(
        self: &Arc<Self>,
        generation: u64,
        session: Session,
        cancel: CancellationToken,
    ) -> Result<(), SearchError> {
        let endpoint = session.message_endpoint.clone();
        {
            let mut link = self.lock_link();
            if link.generation != generation || !matches!(link.link, Link::Connecting { .. }) {
                cancel.cancel();
                return Err(SearchError::connection_closed());
            }
            debug!(
                generation,
                session_id = %session.session_id,
                "MCP connection established"
            );
            link.attempts = 0;
            link.last_error = None;
            drop(link.replace(
                Link::Connected {
                    session,
                    cancel: cancel.clone(),
                },
                &self.state_tx,
            ));
        }
        self.spawn_heartbeat(generation, endpoint, cancel);
        Ok(())
    }

    /// Moves a failed attempt (or a broken live connection) to `Error`.
    ///
    /// Schedules the next attempt with backoff, or goes terminal and rejects
    /// everything outstanding once attempts are exhausted. A live connection
    /// that breaks this way puts its in-flight search back on the queue.
    pub(super) fn fail_connection(self: &Arc<Self>, generation: u64, err: SearchError) {
        let (terminal, was_connected) = {
            let mut link = self.lock_link();
            if link.generation != generation
                || !matches!(link.link, Link::Connecting { .. } | Link::Connected { .. })
            {
                return;
            }
            let was_connected = matches!(link.link, Link::Connected { .. });

            let policy = &self.config.reconnect;
            if link.attempts < policy.max_attempts {
                link.attempts += 1;
                let delay = policy.delay_for(link.attempts);
                debug!(
                    generation,
                    attempt = link.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling MCP reconnect"
                );
                let retry = self.schedule_reconnect(generation, delay);
                link.last_error = Some(err);
                link.replace(Link::Error { retry: Some(retry) }, &self.state_tx)
                    .shutdown();
                (None, was_connected)
            } else {
                let terminal = SearchError::Terminal {
                    attempts: link.attempts,
                    last_error: err.to_string(),
                };
                debug!(generation, error = %terminal, "MCP reconnect attempts exhausted");
                link.last_error = Some(terminal.clone());
                link.replace(Link::Error { retry: None }, &self.state_tx)
                    .shutdown();
                (Some(terminal), was_connected)
            }
        };

        if let Some(terminal) = terminal {
            self.reject_all(terminal);
        } else if was_connected {
            if let Some(id) = self.lock_queue().requeue_current() {
                debug!(generation, request_id = %id, "Requeued in-flight MCP search");
            }
        }
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        failed_generation: u64,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt = {
                let mut link = shared.lock_link();
                if link.generation != failed_generation
                    || !matches!(link.link, Link::Error { retry: Some(_) })
                {
                    None
                } else {
                    Some(shared.begin_attempt(&mut link))
                }
            };
            if let Some((generation, cancel)) = attempt {
                // Failures reschedule themselves through fail_connection.
                let _ = shared.establish(generation, cancel).await;
            }
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64, endpoint: Url, cancel: CancellationToken) {
        let shared = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let sent = match encode_request(
                    RequestFromClient::PingRequest(None),
                    RequestId::Integer(shared.next_control_id()),
                ) {
                    Ok(payload) => shared.transport.post(&endpoint, payload).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    if cancel.is_cancelled() {
                        return;
                    }
                    debug!(generation, error = %err, "MCP heartbeat failed");
                    shared.fail_connection(generation, err);
                    return;
                }
            }
        });
    }

    /// Pumps the event stream into frames until it ends or `cancel` fires.
    ///
    /// The first `endpoint` frame is handed to the connecting task; every
    /// other frame goes to the correlator.
    async fn read_events(
        self: Arc<Self>,
        generation: u64,
        mut stream: EventStream,
        endpoint_tx: oneshot::Sender<String>,
        cancel: CancellationToken,
    ) {
        let mut buffer = FrameBuffer::default();
        let mut endpoint_tx = Some(endpoint_tx);

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in buffer.push(&bytes) {
                            let frame = match frame {
                                Ok(frame) => frame,
                                Err(err) => {
                                    self.fail_current(err);
                                    continue;
                                }
                            };
                            if frame.is_event("endpoint") {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(frame.data.unwrap_or_default());
                                    continue;
                                }
                            }
                            self.handle_frame(frame);
                        }
                    }
                    Some(Err(err)) => {
                        break SearchError::connection(format!("event stream failed: {err}"));
                    }
                    None => break SearchError::connection("event stream ended"),
                },
            }
        };

        let dropped = buffer.finish();
        debug!(generation, dropped_bytes = dropped, reason = %reason, "MCP event stream closed");
        self.on_transport_closed(generation, reason);
    }

    /// A live connection lost its stream: go back to `Disconnected` and fail
    /// the in-flight search. Queued searches reconnect lazily.
    fn on_transport_closed(self: &Arc<Self>, generation: u64, reason: SearchError) {
        {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            match &link.link {
                Link::Connecting { cancel } => {
                    cancel.cancel();
                    return;
                }
                Link::Connected { .. } => {}
                Link::Disconnected | Link::Error { .. } => return,
            }
            link.last_error = Some(reason);
            link.replace(Link::Disconnected, &self.state_tx).shutdown();
        }

        if let Some(request) = self.lock_queue().take_current() {
            request.settle(Err(SearchError::connection("connection lost")));
        }
    }

    pub(super) fn message_endpoint(&self) -> Option<Url> {
        match &self.lock_link().link {
            Link::Connected { session, .. } if session.initialized => {
                Some(session.message_endpoint.clone())
            }
            _ => None,
        }
    }
}

fn last_error(link: &LinkState) -> SearchError {
    link.last_error
        .clone()
        .unwrap_or_else(|| SearchError::connection("connection attempt failed"))
}

fn terminal_error(link: &LinkState) -> SearchError {
    match &link.last_error {
        Some(err @ SearchError::Terminal { .. }) => err.clone(),
        other => SearchError::Terminal {
            attempts: link.attempts,
            last_error: other
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "connection failed".to_string()),
        },
    }
}
