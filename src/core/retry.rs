use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use super::types::{FailureReason, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-submit the same request after `delay`.
    Retry { delay: Duration },
    /// Give up and surface the failure.
    Terminal,
}

/// Retry policy boundary.
///
/// The actor owns the bookkeeping (retry counts, the due queue); the policy only decides whether
/// and when. Delays returned for increasing `retry_count` must be non-decreasing.
pub trait RetryPolicy: Send + 'static {
    fn decide(&self, retry_count: u32, max_retries: u32, reason: &FailureReason) -> RetryDecision;
}

/// `delay = base * (retry_count + 1)`: 1s, 2s, 3s... at the default base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoffRetry {
    base: Duration,
}

impl LinearBackoffRetry {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base.saturating_mul(retry_count.saturating_add(1))
    }
}

impl Default for LinearBackoffRetry {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl RetryPolicy for LinearBackoffRetry {
    fn decide(&self, retry_count: u32, max_retries: u32, reason: &FailureReason) -> RetryDecision {
        if !reason.is_retryable() || retry_count >= max_retries {
            return RetryDecision::Terminal;
        }
        RetryDecision::Retry {
            delay: self.delay_for(retry_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DueItem {
    due: Instant,
    seq: u64,
    request_id: RequestId,
}

/// Min-heap of scheduled retries.
///
/// Entries are never removed eagerly: cancelling or sweeping a request leaves its heap item
/// behind, and the caller's liveness check discards it when it surfaces.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<Reverse<DueItem>>,
    seq: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, request_id: RequestId, due: Instant) {
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Reverse(DueItem {
            due,
            seq: self.seq,
            request_id,
        }));
    }

    /// Earliest live due time.
    pub fn next_due<F>(&mut self, mut is_live: F) -> Option<Instant>
    where
        F: FnMut(RequestId, Instant) -> bool,
    {
        while let Some(Reverse(item)) = self.heap.peek().copied() {
            if is_live(item.request_id, item.due) {
                return Some(item.due);
            }
            let _ = self.heap.pop();
        }
        None
    }

    /// Release at most one live retry that is due at `now`.
    pub fn pop_due<F>(&mut self, now: Instant, mut is_live: F) -> Option<RequestId>
    where
        F: FnMut(RequestId, Instant) -> bool,
    {
        while let Some(Reverse(item)) = self.heap.peek().copied() {
            if !is_live(item.request_id, item.due) {
                let _ = self.heap.pop();
                continue;
            }
            if item.due > now {
                return None;
            }
            let _ = self.heap.pop();
            return Some(item.request_id);
        }
        None
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
