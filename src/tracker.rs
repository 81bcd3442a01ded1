//! Correlation of outgoing GETs with the frames that answer them
//!
//! At most one request per [`QueryKey`] is ever in flight. A second GET for
//! a key that is already pending attaches to the existing entry instead of
//! going out on the wire again, so a safety poll overlapping a user refresh
//! costs one frame, not two.

use crate::codec::DeviceEvent;
use crate::protocol::QueryKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default window for a GET to be answered
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How a pending request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Resolved(DeviceEvent),
    Timeout,
    Cancelled,
}

struct PendingRequest {
    issued_at: Instant,
    timeout: Duration,
    waiters: Vec<oneshot::Sender<RequestOutcome>>,
}

impl PendingRequest {
    fn deadline(&self) -> Instant {
        self.issued_at + self.timeout
    }

    fn finish(self, outcome: RequestOutcome) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Handle to await the outcome of an issued GET
#[derive(Debug)]
pub struct PendingHandle {
    key: QueryKey,
    deadline: Instant,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl PendingHandle {
    pub fn key(&self) -> QueryKey {
        self.key
    }

    /// Wait for the response or cancellation, giving up at the request's
    /// deadline. The sweeper only removes the stale entry afterwards.
    pub async fn wait(self) -> RequestOutcome {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::Timeout,
        }
    }
}

/// Result of [`RequestTracker::issue`]
#[derive(Debug)]
pub struct Issued {
    pub handle: PendingHandle,
    /// False when the key was already pending; the caller must not transmit
    pub is_new: bool,
}

/// Table of in-flight GETs keyed by [`QueryKey`]
pub struct RequestTracker {
    pending: Mutex<HashMap<QueryKey, PendingRequest>>,
    default_timeout: Duration,
}

impl RequestTracker {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register interest in `key`, joining an existing request if there is one
    pub fn issue(&self, key: QueryKey, timeout: Duration) -> Issued {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut pending = self.pending.lock();

        // Nobody swept this one; its waiters have already given up
        if pending.get(&key).is_some_and(|request| request.deadline() <= now) {
            if let Some(stale) = pending.remove(&key) {
                stale.finish(RequestOutcome::Timeout);
            }
        }

        if let Some(existing) = pending.get_mut(&key) {
            tracing::debug!("Joining in-flight request {:?}", key);
            existing.waiters.push(tx);
            return Issued {
                handle: PendingHandle {
                    key,
                    deadline: existing.deadline(),
                    rx,
                },
                is_new: false,
            };
        }

        let request = PendingRequest {
            issued_at: now,
            timeout,
            waiters: vec![tx],
        };
        let deadline = request.deadline();
        pending.insert(key, request);
        Issued {
            handle: PendingHandle { key, deadline, rx },
            is_new: true,
        }
    }

    /// Wake every waiter on `key` with `event`. Returns how many were woken.
    pub fn resolve(&self, key: &QueryKey, event: &DeviceEvent) -> usize {
        let request = self.pending.lock().remove(key);
        match request {
            Some(request) => request.finish(RequestOutcome::Resolved(event.clone())),
            None => 0,
        }
    }

    /// Time out every request past its deadline
    pub fn expire(&self) -> usize {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&self, now: Instant) -> usize {
        let expired: Vec<(QueryKey, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<QueryKey> = pending
                .iter()
                .filter(|(_, request)| request.deadline() <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|request| (key, request)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(key, request)| {
                tracing::warn!("Request {:?} timed out after {:?}", key, request.timeout);
                request.finish(RequestOutcome::Timeout)
            })
            .sum()
    }

    /// Drop a single request, e.g. when its frame could not be written
    pub fn cancel(&self, key: &QueryKey) -> usize {
        let request = self.pending.lock().remove(key);
        request.map_or(0, |request| request.finish(RequestOutcome::Cancelled))
    }

    /// Cancel everything; used on connection teardown
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        drained
            .into_iter()
            .map(|request| request.finish(RequestOutcome::Cancelled))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::Address;

    fn level_key() -> QueryKey {
        QueryKey::Level(Address::new(0, 0))
    }

    fn level_event(level: u8) -> DeviceEvent {
        DeviceEvent::Level {
            address: Address::new(0, 0),
            level,
        }
    }

    #[tokio::test]
    async fn duplicate_issue_joins_existing_request() {
        let tracker = RequestTracker::default();
        let first = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);
        let second = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.resolve(&level_key(), &level_event(9)), 2);
        assert_eq!(first.handle.wait().await, RequestOutcome::Resolved(level_event(9)));
        assert_eq!(second.handle.wait().await, RequestOutcome::Resolved(level_event(9)));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn resolve_only_touches_matching_key() {
        let tracker = RequestTracker::default();
        let mute_key = QueryKey::Mute(Address::new(0, 0));
        let mute = tracker.issue(mute_key, DEFAULT_REQUEST_TIMEOUT);
        let _level = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);

        assert_eq!(tracker.resolve(&level_key(), &level_event(1)), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.cancel(&mute_key), 1);
        assert_eq!(mute.handle.wait().await, RequestOutcome::Cancelled);
    }

    #[tokio::test]
    async fn expired_requests_time_out() {
        let tracker = RequestTracker::default();
        let issued = tracker.issue(level_key(), Duration::from_millis(500));

        assert_eq!(tracker.expire_at(Instant::now()), 0);
        assert_eq!(tracker.expire_at(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(issued.handle.wait().await, RequestOutcome::Timeout);
        assert!(tracker.is_empty());

        // A late response finds nothing to resolve
        assert_eq!(tracker.resolve(&level_key(), &level_event(3)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gives_up_without_a_sweeper() {
        let tracker = RequestTracker::default();
        let issued = tracker.issue(level_key(), Duration::from_millis(200));
        assert_eq!(issued.handle.wait().await, RequestOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_never_outlasts_its_timeout() {
        let tracker = RequestTracker::default();
        let started = Instant::now();
        let issued = tracker.issue(level_key(), Duration::from_millis(1000));
        assert_eq!(issued.handle.wait().await, RequestOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn unswept_stale_request_is_replaced_on_reissue() {
        let tracker = RequestTracker::default();
        let first = tracker.issue(level_key(), Duration::from_millis(200));
        assert_eq!(first.handle.wait().await, RequestOutcome::Timeout);
        assert_eq!(tracker.len(), 1);

        let again = tracker.issue(level_key(), Duration::from_millis(200));
        assert!(again.is_new);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_wakes_everyone() {
        let tracker = RequestTracker::default();
        let a = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);
        let b = tracker.issue(QueryKey::Name(Address::new(1, 1)), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(tracker.cancel_all(), 2);
        assert_eq!(a.handle.wait().await, RequestOutcome::Cancelled);
        assert_eq!(b.handle.wait().await, RequestOutcome::Cancelled);
    }

    #[tokio::test]
    async fn key_can_be_reissued_after_resolution() {
        let tracker = RequestTracker::default();
        let first = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);
        tracker.resolve(&level_key(), &level_event(1));
        drop(first);
        let again = tracker.issue(level_key(), DEFAULT_REQUEST_TIMEOUT);
        assert!(again.is_new);
    }
}
