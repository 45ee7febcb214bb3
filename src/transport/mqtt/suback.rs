//! Matching SUBACKs to the subscribe calls waiting on them
//!
//! rumqttc assigns packet ids inside the event loop, so a caller of
//! `AsyncClient::subscribe` never learns its pkid. Requests leave the
//! request channel in the order they were queued, and the event loop reports
//! each one as `Outgoing::Subscribe(pkid)`. Waiters are therefore queued in
//! issue order, bound to a pkid when the SUBSCRIBE goes out, and completed by
//! the SUBACK carrying that pkid.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct Waiters {
    queued: VecDeque<oneshot::Sender<bool>>,
    in_flight: HashMap<u16, oneshot::Sender<bool>>,
}

/// Waiters for SUBACKs of one broker session
///
/// Each waiter receives `true` when every requested filter was granted and
/// `false` when the broker answered with a failure code. A waiter whose
/// sender is dropped saw the session end first.
#[derive(Default)]
pub struct SubAckTracker {
    waiters: Mutex<Waiters>,
}

impl SubAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a waiter for the next SUBSCRIBE to be sent
    pub fn enqueue(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.lock().queued.push_back(tx);
        rx
    }

    /// Remove the most recently queued waiter when its SUBSCRIBE was never handed over
    pub fn withdraw_last(&self) {
        self.lock().queued.pop_back();
    }

    /// Bind the oldest queued waiter to the packet id its SUBSCRIBE went out with
    pub fn sent(&self, packet_id: u16) {
        let mut waiters = self.lock();
        match waiters.queued.pop_front() {
            Some(tx) => {
                waiters.in_flight.insert(packet_id, tx);
            }
            None => debug!(packet_id, "SUBSCRIBE sent without a waiting caller"),
        }
    }

    /// Complete the waiter for `packet_id`; false when nobody was waiting
    pub fn acknowledged(&self, packet_id: u16, granted: bool) -> bool {
        let waiter = self.lock().in_flight.remove(&packet_id);
        match waiter {
            Some(tx) => tx.send(granted).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe the session ending
    pub fn clear(&self) {
        let mut waiters = self.lock();
        waiters.queued.clear();
        waiters.in_flight.clear();
    }

    pub fn len(&self) -> usize {
        let waiters = self.lock();
        waiters.queued.len() + waiters.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
