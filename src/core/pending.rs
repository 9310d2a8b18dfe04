use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::request::TrackedRequest;
use super::types::{CorrelationKey, LinkError, LinkResult, RequestId, RequestKind};

/// Where a pending request currently is in its lifecycle.
#[derive(Debug)]
pub enum RequestPhase {
    /// Accepted but not yet handed to the transport.
    Queued,
    /// Exactly one transport attempt is outstanding.
    InFlight {
        correlation: CorrelationKey,
        started_at: Instant,
        abort: AbortHandle,
    },
    /// Waiting for its retry to come due. No transport attempt is outstanding.
    AwaitingRetry { due: Instant },
}

#[derive(Debug)]
pub struct PendingRequest {
    pub request: TrackedRequest,
    pub phase: RequestPhase,
}

impl PendingRequest {
    /// Abort the outstanding transport attempt, if any.
    pub fn abort(&self) {
        if let RequestPhase::InFlight { abort, .. } = &self.phase {
            abort.abort();
        }
    }
}

/// Result of matching a transport completion back to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedAttempt {
    pub request_id: RequestId,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AgeItem {
    created_at: Instant,
    request_id: RequestId,
}

/// Pending-request table plus correlation map.
///
/// Owns every accepted request until it succeeds, fails terminally, is cancelled or expires.
/// A request keeps its slot (and counts against `max_pending`) while it waits for a retry.
#[derive(Debug)]
pub struct PendingTable {
    max_pending: usize,
    entries: HashMap<RequestId, PendingRequest>,
    by_correlation: HashMap<CorrelationKey, RequestId>,
    ages: BinaryHeap<Reverse<AgeItem>>,
}

impl PendingTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            entries: HashMap::new(),
            by_correlation: HashMap::new(),
            ages: BinaryHeap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn ensure_capacity(&self) -> LinkResult<()> {
        self.ensure_room(1)
    }

    /// Fails unless `slots` more requests fit.
    pub fn ensure_room(&self, slots: usize) -> LinkResult<()> {
        if self.entries.len().saturating_add(slots) > self.max_pending {
            return Err(LinkError::CapacityExceeded {
                max: self.max_pending,
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, request: TrackedRequest) -> LinkResult<()> {
        self.ensure_capacity()?;
        if self.entries.contains_key(&request.id) {
            return Err(LinkError::InvalidState(format!(
                "request {} is already pending",
                request.id
            )));
        }

        self.ages.push(Reverse(AgeItem {
            created_at: request.created_at,
            request_id: request.id,
        }));
        self.entries.insert(
            request.id,
            PendingRequest {
                request,
                phase: RequestPhase::Queued,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record that a transport attempt was started for `id`.
    pub fn begin_attempt(
        &mut self,
        id: RequestId,
        correlation: CorrelationKey,
        started_at: Instant,
        abort: AbortHandle,
    ) -> LinkResult<()> {
        let Some(entry) = self.entries.get_mut(&id) else {
            abort.abort();
            return Err(LinkError::InvalidState(format!("request {id} is not pending")));
        };
        if let RequestPhase::InFlight { correlation, .. } = &entry.phase {
            abort.abort();
            return Err(LinkError::InvalidState(format!(
                "request {id} already has attempt {correlation} in flight"
            )));
        }
        entry.phase = RequestPhase::InFlight {
            correlation,
            started_at,
            abort,
        };
        self.by_correlation.insert(correlation, id);
        Ok(())
    }

    /// Match a completion to its request and detach the attempt. Unknown keys (cancelled, swept
    /// or superseded attempts) return `None`.
    pub fn finish_attempt(
        &mut self,
        correlation: CorrelationKey,
        now: Instant,
    ) -> Option<FinishedAttempt> {
        let id = self.by_correlation.remove(&correlation)?;
        let entry = self.entries.get_mut(&id)?;
        let started_at = match &entry.phase {
            RequestPhase::InFlight {
                correlation: current,
                started_at,
                ..
            } if *current == correlation => *started_at,
            _ => return None,
        };
        entry.phase = RequestPhase::Queued;
        Some(FinishedAttempt {
            request_id: id,
            latency: now.saturating_duration_since(started_at),
        })
    }

    /// Park `id` until `due`, bumping its retry count. Returns the new retry count.
    pub fn schedule_retry(&mut self, id: RequestId, due: Instant) -> LinkResult<u32> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(LinkError::InvalidState(format!("request {id} is not pending")));
        };
        if entry.request.retry_count >= entry.request.max_retries {
            return Err(LinkError::InvalidState(format!(
                "request {id} exhausted its {} retries",
                entry.request.max_retries
            )));
        }
        if let RequestPhase::InFlight { correlation, .. } = &entry.phase {
            self.by_correlation.remove(correlation);
            entry.abort();
        }
        entry.request.retry_count += 1;
        entry.phase = RequestPhase::AwaitingRetry { due };
        Ok(entry.request.retry_count)
    }

    /// True when `id` is still parked for exactly this `due` time.
    pub fn is_awaiting_retry(&self, id: RequestId, due: Instant) -> bool {
        matches!(
            self.entries.get(&id).map(|e| &e.phase),
            Some(RequestPhase::AwaitingRetry { due: d }) if *d == due
        )
    }

    /// Remove `id`, aborting its outstanding attempt.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let entry = self.entries.remove(&id)?;
        if let RequestPhase::InFlight { correlation, .. } = &entry.phase {
            self.by_correlation.remove(correlation);
        }
        entry.abort();
        Some(entry)
    }

    /// Remove every request of `kind`, aborting outstanding attempts.
    pub fn remove_kind(&mut self, kind: RequestKind) -> Vec<PendingRequest> {
        let mut ids: Vec<RequestId> = self
            .entries
            .values()
            .filter(|entry| entry.request.kind == kind)
            .map(|entry| entry.request.id)
            .collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove every request older than `max_age`, aborting outstanding attempts.
    pub fn expire_older_than(&mut self, now: Instant, max_age: Duration) -> Vec<PendingRequest> {
        let mut out = Vec::new();
        while let Some(Reverse(item)) = self.ages.peek().copied() {
            if now.saturating_duration_since(item.created_at) <= max_age {
                break;
            }
            let _ = self.ages.pop();
            // Stale heap item: request already completed.
            if let Some(entry) = self.remove(item.request_id) {
                out.push(entry);
            }
        }
        out
    }

    /// Remove everything, aborting outstanding attempts.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.by_correlation.clear();
        self.ages.clear();
        let mut out: Vec<PendingRequest> = self.entries.drain().map(|(_, entry)| entry).collect();
        out.sort_by_key(|entry| entry.request.id);
        for entry in &out {
            entry.abort();
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.by_correlation.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::RequestContext;
    use std::sync::Arc;

    fn request(id: u64, created_at: Instant, max_retries: u32) -> TrackedRequest {
        TrackedRequest {
            id: RequestId::new(id),
            kind: RequestKind::Application,
            operation: Arc::from("op"),
            endpoint: Arc::from("/op"),
            method: http::Method::GET,
            uri: http::Uri::from_static("http://localhost/api/v1/op"),
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
            context: Arc::new(RequestContext::new()),
            created_at,
            retry_count: 0,
            max_retries,
            timeout: Duration::from_secs(30),
        }
    }

    fn idle_abort_handle() -> AbortHandle {
        tokio::spawn(std::future::pending::<()>()).abort_handle()
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_rejects_without_mutating() {
        let mut table = PendingTable::new(2);
        let now = Instant::now();
        table.insert(request(1, now, 3)).unwrap();
        table.insert(request(2, now, 3)).unwrap();

        let err = table.insert(request(3, now, 3)).unwrap_err();
        assert_eq!(err, LinkError::CapacityExceeded { max: 2 });
        assert_eq!(table.len(), 2);
        assert!(!table.contains(RequestId::new(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_is_matched_once_by_correlation() {
        let mut table = PendingTable::new(10);
        let now = Instant::now();
        table.insert(request(1, now, 3)).unwrap();
        table
            .begin_attempt(RequestId::new(1), CorrelationKey::new(7), now, idle_abort_handle())
            .unwrap();
        assert_eq!(table.in_flight(), 1);

        let later = now + Duration::from_millis(40);
        let finished = table.finish_attempt(CorrelationKey::new(7), later).unwrap();
        assert_eq!(finished.request_id, RequestId::new(1));
        assert_eq!(finished.latency, Duration::from_millis(40));

        assert!(table.finish_attempt(CorrelationKey::new(7), later).is_none());
        assert_eq!(table.in_flight(), 0);
        assert!(table.contains(RequestId::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_while_in_flight_is_rejected() {
        let mut table = PendingTable::new(10);
        let now = Instant::now();
        table.insert(request(1, now, 3)).unwrap();
        table
            .begin_attempt(RequestId::new(1), CorrelationKey::new(1), now, idle_abort_handle())
            .unwrap();
        let err = table
            .begin_attempt(RequestId::new(1), CorrelationKey::new(2), now, idle_abort_handle())
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidState(_)));
        assert_eq!(table.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_never_exceeds_budget() {
        let mut table = PendingTable::new(10);
        let now = Instant::now();
        table.insert(request(1, now, 2)).unwrap();

        assert_eq!(table.schedule_retry(RequestId::new(1), now).unwrap(), 1);
        assert!(table.is_awaiting_retry(RequestId::new(1), now));
        assert_eq!(table.schedule_retry(RequestId::new(1), now).unwrap(), 2);
        assert!(table.schedule_retry(RequestId::new(1), now).is_err());
        assert_eq!(
            table.get(RequestId::new(1)).unwrap().request.retry_count,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_only_old_requests_and_skips_completed_ones() {
        let mut table = PendingTable::new(10);
        let t0 = Instant::now();
        table.insert(request(1, t0, 0)).unwrap();
        table.insert(request(2, t0, 0)).unwrap();
        table
            .insert(request(3, t0 + Duration::from_secs(200), 0))
            .unwrap();
        table.remove(RequestId::new(2));

        let expired = table.expire_older_than(t0 + Duration::from_secs(301), Duration::from_secs(300));
        let ids: Vec<RequestId> = expired.iter().map(|e| e.request.id).collect();
        assert_eq!(ids, vec![RequestId::new(1)]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(RequestId::new(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_empties_every_index() {
        let mut table = PendingTable::new(10);
        let now = Instant::now();
        for id in 1..=5 {
            table.insert(request(id, now, 3)).unwrap();
        }
        table
            .begin_attempt(RequestId::new(3), CorrelationKey::new(3), now, idle_abort_handle())
            .unwrap();

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert!(table.is_empty());
        assert_eq!(table.in_flight(), 0);
        assert!(table.finish_attempt(CorrelationKey::new(3), now).is_none());
        assert!(
            table
                .expire_older_than(now + Duration::from_secs(999), Duration::ZERO)
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remove_kind_leaves_other_kinds_alone() {
        let mut table = PendingTable::new(10);
        let now = Instant::now();
        table.insert(request(1, now, 3)).unwrap();
        for id in [2, 3] {
            let mut probe = request(id, now, 0);
            probe.kind = RequestKind::Heartbeat;
            table.insert(probe).unwrap();
        }
        table
            .begin_attempt(RequestId::new(3), CorrelationKey::new(30), now, idle_abort_handle())
            .unwrap();

        let removed: Vec<RequestId> = table
            .remove_kind(RequestKind::Heartbeat)
            .iter()
            .map(|e| e.request.id)
            .collect();
        assert_eq!(removed, vec![RequestId::new(2), RequestId::new(3)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.in_flight(), 0);
        assert!(table.finish_attempt(CorrelationKey::new(30), now).is_none());
        assert!(table.contains(RequestId::new(1)));
    }
}
