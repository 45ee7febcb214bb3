//! Bookkeeping for in-flight correlated requests
//!
//! All state sits behind one synchronous mutex that is never held across an
//! await point. Removing a `PendingRequest` from the table is what grants the
//! right to resolve it, so reply, timeout and connection loss can race without
//! resolving a request twice.

use super::RequestKind;
use crate::error::ClientError;
use crate::protocol::Reply;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How many resolved or expired keys are remembered for discarding late replies
pub const RETIRED_KEY_CAPACITY: usize = 256;

/// Result delivered to the caller waiting on a correlated request
pub type RequestOutcome = Result<Reply, ClientError>;

/// Where the correlation key of a reply on a response topic comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// The `cid` field of the reply payload
    PayloadField,
    /// Every reply on the topic belongs to this key
    Fixed(String),
}

/// A request waiting for its reply
#[derive(Debug)]
pub struct PendingRequest {
    pub key: String,
    pub seq: u64,
    pub kind: RequestKind,
    pub response_topic: String,
    pub deadline: Instant,
    responder: oneshot::Sender<RequestOutcome>,
}

impl PendingRequest {
    /// Deliver the outcome; false if the caller stopped waiting
    pub fn resolve(self, outcome: RequestOutcome) -> bool {
        self.responder.send(outcome).is_ok()
    }
}

/// Handle returned by [`RequestTable::register`]
#[derive(Debug)]
pub struct Registration {
    pub seq: u64,
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<RequestOutcome>,
}

#[derive(Debug)]
struct ResponseRoute {
    source: KeySource,
    refs: usize,
}

#[derive(Debug)]
struct RetiredKey {
    key: String,
    topic: String,
    source: KeySource,
}

#[derive(Debug, Default)]
struct TableState {
    pending: HashMap<String, PendingRequest>,
    routes: HashMap<String, ResponseRoute>,
    retired: VecDeque<RetiredKey>,
    retired_set: HashSet<String>,
    enrolling: HashSet<String>,
    next_seq: u64,
}

impl TableState {
    fn retire(&mut self, key: &str, topic: &str) {
        let Some(source) = self.routes.get(topic).map(|route| route.source.clone()) else {
            return;
        };
        if !self.retired_set.insert(key.to_string()) {
            return;
        }
        self.retired.push_back(RetiredKey {
            key: key.to_string(),
            topic: topic.to_string(),
            source,
        });
        while self.retired.len() > RETIRED_KEY_CAPACITY {
            if let Some(oldest) = self.retired.pop_front() {
                self.retired_set.remove(&oldest.key);
            }
        }
    }

    fn release_route(&mut self, topic: &str) {
        if let Some(route) = self.routes.get_mut(topic) {
            route.refs = route.refs.saturating_sub(1);
            if route.refs == 0 {
                self.routes.remove(topic);
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<PendingRequest> {
        let pending = self.pending.remove(key)?;
        self.retire(key, &pending.response_topic);
        self.release_route(&pending.response_topic);
        Some(pending)
    }
}

/// In-flight requests, response topic routes and recently retired keys
#[derive(Debug, Default)]
pub struct RequestTable {
    state: Mutex<TableState>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a request before it is published
    pub fn register(
        &self,
        key: &str,
        kind: RequestKind,
        response_topic: &str,
        source: KeySource,
        timeout: Duration,
    ) -> Result<Registration, ClientError> {
        let mut state = self.lock();

        if state.pending.contains_key(key) {
            return Err(ClientError::validation(format!(
                "a {kind} request with key '{key}' is already in flight"
            )));
        }
        if let Some(route) = state.routes.get(response_topic) {
            if route.source != source {
                return Err(ClientError::validation(format!(
                    "response topic '{response_topic}' is already correlated differently"
                )));
            }
        }

        state
            .routes
            .entry(response_topic.to_string())
            .or_insert(ResponseRoute { source, refs: 0 })
            .refs += 1;

        if state.retired_set.remove(key) {
            state.retired.retain(|retired| retired.key != key);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = Instant::now() + timeout;

        let (responder, receiver) = oneshot::channel();
        state.pending.insert(
            key.to_string(),
            PendingRequest {
                key: key.to_string(),
                seq,
                kind,
                response_topic: response_topic.to_string(),
                deadline,
                responder,
            },
        );

        Ok(Registration {
            seq,
            deadline,
            receiver,
        })
    }

    /// Claim the request a reply on `topic` belongs to
    pub fn take(&self, key: &str, topic: &str) -> Option<PendingRequest> {
        let mut state = self.lock();
        let belongs = state
            .pending
            .get(key)
            .is_some_and(|pending| pending.response_topic == topic);
        if belongs {
            state.remove(key)
        } else {
            None
        }
    }

    /// Claim a request for timeout or abort, only if it is still the same registration
    pub fn expire(&self, key: &str, seq: u64) -> Option<PendingRequest> {
        let mut state = self.lock();
        let current = state
            .pending
            .get(key)
            .is_some_and(|pending| pending.seq == seq);
        if current {
            state.remove(key)
        } else {
            None
        }
    }

    /// Claim every pending request
    pub fn drain(&self) -> Vec<PendingRequest> {
        let mut state = self.lock();
        let keys: Vec<String> = state.pending.keys().cloned().collect();
        keys.iter().filter_map(|key| state.remove(key)).collect()
    }

    /// How replies on `topic` are correlated, if any request is waiting on it
    pub fn key_source(&self, topic: &str) -> Option<KeySource> {
        self.lock()
            .routes
            .get(topic)
            .map(|route| route.source.clone())
    }

    /// How replies on `topic` were correlated for a recently retired request
    pub fn retired_key_source(&self, topic: &str) -> Option<KeySource> {
        self.lock()
            .retired
            .iter()
            .rev()
            .find(|retired| retired.topic == topic)
            .map(|retired| retired.source.clone())
    }

    pub fn has_route(&self, topic: &str) -> bool {
        self.lock().routes.contains_key(topic)
    }

    /// True for keys that were resolved or expired recently
    pub fn is_retired(&self, key: &str) -> bool {
        self.lock().retired_set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve `hwid` for one enrollment; released when the claim drops
    pub fn claim_enrollment(self: &Arc<Self>, hwid: &str) -> Result<EnrollmentClaim, ClientError> {
        if !self.lock().enrolling.insert(hwid.to_string()) {
            return Err(ClientError::AlreadyEnrolling {
                hwid: hwid.to_string(),
            });
        }
        Ok(EnrollmentClaim {
            table: Arc::clone(self),
            hwid: hwid.to_string(),
        })
    }
}

/// Exclusive right to enroll one hardware id
#[derive(Debug)]
pub struct EnrollmentClaim {
    table: Arc<RequestTable>,
    hwid: String,
}

impl EnrollmentClaim {
    pub fn hwid(&self) -> &str {
        &self.hwid
    }
}

impl Drop for EnrollmentClaim {
    fn drop(&mut self) {
        self.table.lock().enrolling.remove(&self.hwid);
    }
}
