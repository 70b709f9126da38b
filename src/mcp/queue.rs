//! FIFO of outstanding searches and the response correlator.
//!
//! A request lives in exactly one place: `queued` until dispatch, then
//! `pending` until it settles. At most one pending request is `current`.
//!
//! Search ids are minted here as `search-N` with `N` strictly increasing, so
//! any issued id that is no longer pending belongs to a settled request.

use super::error::SearchError;
use super::protocol::SearchOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;

const SEARCH_ID_PREFIX: &str = "search-";

fn search_sequence(id: &str) -> Option<u64> {
    id.strip_prefix(SEARCH_ID_PREFIX)?.parse().ok()
}

pub type SearchOutcome = Result<String, SearchError>;

pub struct PendingRequest {
    pub id: String,
    pub query: String,
    pub options: SearchOptions,
    pub enqueued_at: Instant,
    pub expires_at: Instant,
    reply: oneshot::Sender<SearchOutcome>,
    settled: Arc<Notify>,
    timer: Option<AbortHandle>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    pub fn new(
        id: String,
        query: String,
        options: SearchOptions,
        enqueued_at: Instant,
        expires_at: Instant,
        reply: oneshot::Sender<SearchOutcome>,
    ) -> Self {
        Self {
            id,
            query,
            options,
            enqueued_at,
            expires_at,
            reply,
            settled: Arc::new(Notify::new()),
            timer: None,
        }
    }

    pub fn set_timer(&mut self, timer: AbortHandle) {
        self.timer = Some(timer);
    }

    /// Delivers the outcome, stops the timer and wakes the dispatcher.
    pub fn settle(mut self, outcome: SearchOutcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.reply.send(outcome);
        self.settled.notify_one();
    }
}

/// What the dispatcher needs to put one request on the wire.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: String,
    pub query: String,
    pub options: SearchOptions,
    pub settled: Arc<Notify>,
}

#[derive(Debug)]
pub enum Correlation {
    Matched(PendingRequest),
    /// The id was issued by this queue but its request already settled.
    Settled(String),
    Unmatched,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    queued: VecDeque<PendingRequest>,
    pending: HashMap<String, PendingRequest>,
    current: Option<String>,
    last_issued: u64,
}

impl RequestQueue {
    /// Mints the next search id. Ids are never reused.
    pub fn issue_id(&mut self) -> String {
        self.last_issued += 1;
        format!("{SEARCH_ID_PREFIX}{}", self.last_issued)
    }

    pub fn was_issued(&self, id: &str) -> bool {
        search_sequence(id).is_some_and(|sequence| (1..=self.last_issued).contains(&sequence))
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.queued.push_back(request);
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Moves the queue head into flight. Returns `None` while another
    /// request is current or nothing is waiting.
    pub fn begin_next(&mut self) -> Option<Dispatch> {
        if self.current.is_some() {
            return None;
        }
        let request = self.queued.pop_front()?;
        let dispatch = Dispatch {
            id: request.id.clone(),
            query: request.query.clone(),
            options: request.options.clone(),
            settled: Arc::clone(&request.settled),
        };
        self.current = Some(request.id.clone());
        self.pending.insert(request.id.clone(), request);
        Some(dispatch)
    }

    /// Removes the head without dispatching it.
    pub fn pop_queued(&mut self) -> Option<PendingRequest> {
        self.queued.pop_front()
    }

    /// Removes a request wherever it sits.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        if let Some(request) = self.pending.remove(id) {
            return Some(request);
        }
        let index = self.queued.iter().position(|request| request.id == id)?;
        self.queued.remove(index)
    }

    pub fn take_current(&mut self) -> Option<PendingRequest> {
        let id = self.current.clone()?;
        self.take(&id)
    }

    /// Puts the in-flight request back at the head of the queue so it is
    /// sent again on the next connection. Wakes the dispatcher waiting on it.
    pub fn requeue_current(&mut self) -> Option<String> {
        let id = self.current.take()?;
        let request = self.pending.remove(&id)?;
        request.settled.notify_one();
        self.queued.push_front(request);
        Some(id)
    }

    /// Matches an inbound response to a pending request.
    ///
    /// An exact id wins. Any other id this queue issued belongs to a request
    /// that already settled and is dropped. A missing or foreign id goes to
    /// the current request, or failing that the oldest pending request whose
    /// deadline has not passed.
    pub fn correlate(&mut self, wire_id: Option<&str>, now: Instant) -> Correlation {
        if let Some(id) = wire_id {
            if self.pending.contains_key(id) {
                if let Some(request) = self.take(id) {
                    return Correlation::Matched(request);
                }
            }
            if self.was_issued(id) {
                return Correlation::Settled(id.to_string());
            }
        }

        if let Some(request) = self.take_current() {
            return Correlation::Matched(request);
        }

        let oldest = self
            .pending
            .values()
            .filter(|request| request.expires_at > now)
            .min_by_key(|request| request.enqueued_at)
            .map(|request| request.id.clone());
        match oldest.and_then(|id| self.take(&id)) {
            Some(request) => Correlation::Matched(request),
            None => Correlation::Unmatched,
        }
    }

    /// Empties the queue and the pending map, oldest first.
    pub fn take_all(&mut self) -> Vec<PendingRequest> {
        self.current = None;
        let mut pending: Vec<PendingRequest> = self.pending.drain().map(|(_, r)| r).collect();
        pending.sort_by_key(|request| request.enqueued_at);
        pending.extend(self.queued.drain(..));
        pending
    }
}
