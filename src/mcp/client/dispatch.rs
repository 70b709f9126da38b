use super::Shared;
use crate::mcp::error::SearchError;
use crate::mcp::frame::Frame;
use crate::mcp::protocol::{decode_inbound, encode_request, search_request, Inbound, WireId};
use crate::mcp::queue::{Correlation, SearchOutcome};
use rust_mcp_schema::RequestId;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

impl Shared {
    /// Starts the drain loop unless one is already running.
    pub(super) fn kick_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                shared.drain_queue().await;
                shared.draining.store(false, Ordering::Release);

                // Searches queued after the last emptiness check would
                // otherwise sit until the next kick.
                if shared.lock_queue().queued_len() == 0
                    || shared.draining.swap(true, Ordering::AcqRel)
                {
                    return;
                }
            }
        });
    }

    /// Dispatches queued searches one at a time until the queue is empty.
    async fn drain_queue(self: &Arc<Self>) {
        loop {
            if self.lock_queue().queued_len() == 0 {
                return;
            }

            if let Err(err) = self.ensure_connected().await {
                let head = self.lock_queue().pop_queued();
                if let Some(request) = head {
                    debug!(request_id = %request.id, error = %err, "MCP search could not connect");
                    request.settle(Err(err));
                }
                continue;
            }

            let Some(dispatch) = self.lock_queue().begin_next() else {
                return;
            };

            let sent = match self.message_endpoint() {
                Some(endpoint) => {
                    debug!(request_id = %dispatch.id, query = %dispatch.query, "Dispatching MCP search");
                    match encode_request(
                        search_request(&self.config.tool_name, &dispatch.query, &dispatch.options),
                        RequestId::String(dispatch.id.clone()),
                    ) {
                        Ok(payload) => self.transport.post(&endpoint, payload).await,
                        Err(err) => Err(err),
                    }
                }
                None => Err(SearchError::connection("connection lost before dispatch")),
            };
            if let Err(err) = sent {
                self.settle_request(&dispatch.id, Err(err));
            }

            dispatch.settled.notified().await;
        }
    }

    pub(super) fn spawn_request_timer(self: &Arc<Self>, id: String) -> AbortHandle {
        let shared = Arc::clone(self);
        let after = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let expired = shared.lock_queue().take(&id);
            if let Some(request) = expired {
                debug!(request_id = %id, "MCP search timed out");
                request.settle(Err(SearchError::Timeout {
                    operation: "request",
                    after,
                }));
            }
        })
        .abort_handle()
    }

    fn settle_request(&self, id: &str, outcome: SearchOutcome) {
        let request = self.lock_queue().take(id);
        if let Some(request) = request {
            request.settle(outcome);
        }
    }

    /// Routes one frame from the event stream.
    pub(super) fn handle_frame(&self, frame: Frame) {
        if frame.is_event("endpoint") {
            debug!("Ignoring repeated MCP endpoint frame");
            return;
        }
        let Some(data) = frame.data else {
            return;
        };

        match decode_inbound(&data) {
            Ok(Inbound::ServerTraffic(kind)) => {
                debug!(kind = %kind, "Ignoring server-initiated MCP message");
            }
            Ok(Inbound::Response {
                id: Some(WireId::Control(id)),
                ..
            }) => {
                debug!(control_id = id, "Received MCP control response");
            }
            Ok(Inbound::Response { id, outcome }) => {
                let wire_id = match &id {
                    Some(WireId::Search(id)) => Some(id.as_str()),
                    _ => None,
                };
                self.correlate(wire_id, outcome);
            }
            Err(err) => self.fail_current(err),
        }
    }

    /// Fails the in-flight search with a frame-level error, if there is one.
    pub(super) fn fail_current(&self, err: SearchError) {
        let current = self.lock_queue().take_current();
        match current {
            Some(request) => {
                debug!(request_id = %request.id, error = %err, "Malformed MCP frame");
                request.settle(Err(err));
            }
            None => debug!(error = %err, "Dropping malformed MCP frame"),
        }
    }

    fn correlate(&self, wire_id: Option<&str>, outcome: SearchOutcome) {
        let correlation = self.lock_queue().correlate(wire_id, Instant::now());
        match correlation {
            Correlation::Matched(request) => {
                debug!(
                    request_id = %request.id,
                    wire_id = wire_id.unwrap_or("-"),
                    ok = outcome.is_ok(),
                    "Settling MCP search"
                );
                request.settle(outcome);
            }
            Correlation::Settled(id) => {
                debug!(request_id = %id, "Dropping late response for settled MCP search");
            }
            Correlation::Unmatched => {
                debug!(
                    wire_id = wire_id.unwrap_or("-"),
                    "Dropping MCP response with no pending search"
                );
            }
        }
    }
}
