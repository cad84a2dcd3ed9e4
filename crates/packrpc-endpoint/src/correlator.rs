//! Pending-request bookkeeping for calls that expect a response.
//!
//! Each in-flight call owns a [`PendingRequest`] with its own mutex and
//! condition variable, so blocked callers never contend with each other.
//! The correlator's map lock is only held to insert or remove records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use packrpc_codec::Value;
use packrpc_frame::MAX_REQUEST_ID;
use tracing::debug;

use crate::error::{Result, RpcError};

#[derive(Debug)]
enum Slot {
    Waiting,
    Resolved(Value),
    Taken,
    Expired,
    Interrupted,
}

/// One in-flight call awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    request_id: u32,
    expiry: Option<Duration>,
    deadline: Option<Instant>,
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl PendingRequest {
    fn new(request_id: u32, expiry: Option<Duration>) -> Self {
        Self {
            request_id,
            expiry,
            deadline: expiry.map(|after| Instant::now() + after),
            slot: Mutex::new(Slot::Waiting),
            ready: Condvar::new(),
        }
    }

    /// The id carried in the request frame.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// When the call gives up waiting, if it ever does.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once a response, expiry or interruption has been recorded.
    pub fn is_complete(&self) -> bool {
        !matches!(*self.lock(), Slot::Waiting)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Store the outcome and wake the waiter. Only the first completion wins.
    fn complete(&self, outcome: Slot) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Waiting) {
            return false;
        }
        *slot = outcome;
        self.ready.notify_all();
        true
    }

    fn expired_error(&self) -> RpcError {
        RpcError::Expired {
            request_id: self.request_id,
            after: self.expiry.unwrap_or_default(),
        }
    }

    /// Block until the request completes.
    ///
    /// The slot is checked under its lock before every wait, so a response
    /// that lands before the caller starts waiting is never missed.
    fn wait(&self) -> Result<Value> {
        let mut slot = self.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Resolved(value) => return Ok(value),
                Slot::Expired => {
                    *slot = Slot::Expired;
                    return Err(self.expired_error());
                }
                Slot::Interrupted => {
                    *slot = Slot::Interrupted;
                    return Err(RpcError::Interrupted(self.request_id));
                }
                Slot::Taken => return Err(RpcError::Interrupted(self.request_id)),
                Slot::Waiting => *slot = Slot::Waiting,
            }

            slot = match self.deadline {
                None => self.ready.wait(slot).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *slot = Slot::Expired;
                        continue;
                    }
                    self.ready
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

/// Allocates request ids and matches responses to waiting callers.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<PendingRequest>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<PendingRequest>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next request id. Ids run from 1 to `MAX_REQUEST_ID` and then wrap
    /// back to 1; 0 is never issued.
    pub fn next_request_id(&self) -> u32 {
        let step = |id: u32| Some(if id >= MAX_REQUEST_ID { 1 } else { id + 1 });
        match self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, step)
        {
            Ok(id) | Err(id) => id,
        }
    }

    /// Allocate an id and record a pending request for it.
    ///
    /// Expired records are swept first. After a wrap, ids still in flight
    /// are skipped.
    pub fn register(&self, expiry: Option<Duration>) -> Arc<PendingRequest> {
        self.sweep_expired();

        let mut pending = self.lock();
        let mut request_id = self.next_request_id();
        while pending.contains_key(&request_id) {
            request_id = self.next_request_id();
        }

        let request = Arc::new(PendingRequest::new(request_id, expiry));
        pending.insert(request_id, Arc::clone(&request));
        request
    }

    /// Deliver a response. Returns false when no call is waiting on
    /// `request_id` (late, duplicate or unknown responses).
    pub fn resolve(&self, request_id: u32, content: Value) -> bool {
        let Some(request) = self.lock().remove(&request_id) else {
            debug!(request_id, "dropping response with no pending request");
            return false;
        };
        request.complete(Slot::Resolved(content))
    }

    /// Forget a pending request without waking anyone. Used when the
    /// request frame could not be sent.
    pub fn cancel(&self, request_id: u32) -> bool {
        self.lock().remove(&request_id).is_some()
    }

    /// Block until `request` completes, expires or is interrupted.
    pub fn wait(&self, request: &PendingRequest) -> Result<Value> {
        let result = request.wait();
        if matches!(result, Err(RpcError::Expired { .. })) {
            self.cancel(request.request_id);
        }
        result
    }

    /// Expire every record whose deadline has passed and wake its waiter.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<PendingRequest>> = {
            let mut pending = self.lock();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, request)| request.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        for request in &expired {
            debug!(request_id = request.request_id, "pending request expired");
            request.complete(Slot::Expired);
        }
        expired.len()
    }

    /// Wake every waiter with `Interrupted` and clear the table.
    pub fn interrupt_all(&self) -> usize {
        let drained: Vec<Arc<PendingRequest>> = self.lock().drain().map(|(_, r)| r).collect();
        for request in &drained {
            request.complete(Slot::Interrupted);
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "interrupted pending requests");
        }
        drained.len()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let correlator = Correlator::new();
        assert_eq!(correlator.register(None).request_id(), 1);
        assert_eq!(correlator.register(None).request_id(), 2);
        assert_eq!(correlator.next_request_id(), 3);
        assert_eq!(correlator.pending_count(), 2);
    }

    #[test]
    fn ids_wrap_to_one_and_skip_zero() {
        let correlator = Correlator::new();
        correlator.set_next_id(MAX_REQUEST_ID);
        assert_eq!(correlator.next_request_id(), MAX_REQUEST_ID);
        assert_eq!(correlator.next_request_id(), 1);
    }

    #[test]
    fn wrapped_ids_skip_requests_still_in_flight() {
        let correlator = Correlator::new();
        let first = correlator.register(None);
        assert_eq!(first.request_id(), 1);

        correlator.set_next_id(MAX_REQUEST_ID);
        assert_eq!(correlator.register(None).request_id(), MAX_REQUEST_ID);
        assert_eq!(correlator.register(None).request_id(), 2);
    }

    #[test]
    fn response_before_wait_is_not_lost() {
        let correlator = Correlator::new();
        let request = correlator.register(None);
        assert!(correlator.resolve(request.request_id(), Value::from("early")));
        assert!(request.is_complete());

        assert_eq!(correlator.wait(&request).unwrap(), Value::from("early"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn response_wakes_blocked_waiter() {
        let correlator = Arc::new(Correlator::new());
        let request = correlator.register(None);

        let waiter = {
            let correlator = Arc::clone(&correlator);
            let request = Arc::clone(&request);
            thread::spawn(move || correlator.wait(&request))
        };

        thread::sleep(Duration::from_millis(20));
        correlator.resolve(request.request_id(), Value::Int(42));
        assert_eq!(waiter.join().unwrap().unwrap(), Value::Int(42));
    }

    #[test]
    fn unknown_and_duplicate_responses_are_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(99, Value::Null));

        let request = correlator.register(None);
        assert!(correlator.resolve(request.request_id(), Value::Int(1)));
        assert!(!correlator.resolve(request.request_id(), Value::Int(2)));
        assert_eq!(correlator.wait(&request).unwrap(), Value::Int(1));
    }

    #[test]
    fn waiter_expires_lazily() {
        let correlator = Correlator::new();
        let request = correlator.register(Some(Duration::from_millis(20)));

        let started = Instant::now();
        let err = correlator.wait(&request).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(matches!(err, RpcError::Expired { request_id: 1, .. }));
        assert_eq!(correlator.pending_count(), 0);

        // A response that arrives after expiry finds nothing to resolve.
        assert!(!correlator.resolve(1, Value::Null));
    }

    #[test]
    fn sweep_expires_overdue_records_only() {
        let correlator = Correlator::new();
        let short = correlator.register(Some(Duration::from_millis(1)));
        let open = correlator.register(None);
        let long = correlator.register(Some(Duration::from_secs(60)));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(correlator.sweep_expired(), 1);
        assert!(short.is_complete());
        assert!(!open.is_complete());
        assert!(!long.is_complete());
        assert_eq!(correlator.pending_count(), 2);

        assert!(matches!(
            correlator.wait(&short),
            Err(RpcError::Expired { .. })
        ));
    }

    #[test]
    fn register_sweeps_expired_records() {
        let correlator = Correlator::new();
        let stale = correlator.register(Some(Duration::from_millis(1)));
        thread::sleep(Duration::from_millis(10));

        let _fresh = correlator.register(None);
        assert!(stale.is_complete());
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn interrupt_all_wakes_every_waiter() {
        let correlator = Arc::new(Correlator::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                let request = correlator.register(None);
                thread::spawn(move || correlator.wait(&request))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(correlator.interrupt_all(), 4);

        for waiter in waiters {
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, RpcError::Interrupted(_)));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn cancel_removes_without_completing() {
        let correlator = Correlator::new();
        let request = correlator.register(None);
        assert!(correlator.cancel(request.request_id()));
        assert!(!request.is_complete());
        assert!(!correlator.cancel(request.request_id()));
    }

    #[test]
    fn concurrent_waiters_resolved_out_of_order() {
        let correlator = Arc::new(Correlator::new());
        let requests: Vec<_> = (0..16).map(|_| correlator.register(None)).collect();

        let waiters: Vec<_> = requests
            .iter()
            .map(|request| {
                let correlator = Arc::clone(&correlator);
                let request = Arc::clone(request);
                thread::spawn(move || (request.request_id(), correlator.wait(&request)))
            })
            .collect();

        for request in requests.iter().rev() {
            let id = request.request_id();
            correlator.resolve(id, Value::Long(i64::from(id) * 10));
        }

        for waiter in waiters {
            let (id, result) = waiter.join().unwrap();
            assert_eq!(result.unwrap(), Value::Long(i64::from(id) * 10));
        }
    }
}
