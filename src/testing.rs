//! Reusable test utilities for driving the link actor without a real network.
//!
//! Intended for integration tests (here and in downstream crates) that need deterministic
//! transport outcomes. Combine with `#[tokio::test(start_paused = true)]` to step through
//! heartbeat, retry and sweep timing without waiting on the wall clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;

use crate::client::{LinkEvent, LinkObserver};
use crate::core::ReconnectStrategy;
use crate::transport::{
    LinkTransport, TransportCall, TransportFailure, TransportFuture, TransportResponse,
};

/// What a [`ScriptedTransport`] does with one call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Respond(TransportResponse),
    Fail(TransportFailure),
    /// Never completes. The request timeout (or a cancel) ends it.
    Hang,
    /// Wait, then resolve the inner outcome.
    After(Duration, Box<ScriptedOutcome>),
}

impl ScriptedOutcome {
    pub fn ok_json(body: &'static str) -> Self {
        ScriptedOutcome::Respond(TransportResponse::ok_json(Bytes::from_static(body.as_bytes())))
    }

    pub fn status(status: u16) -> Self {
        ScriptedOutcome::Respond(TransportResponse::new(status, Bytes::new()))
    }

    pub fn refused() -> Self {
        ScriptedOutcome::Fail(TransportFailure::ConnectionRefused(
            "scripted refusal".to_string(),
        ))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        ScriptedOutcome::After(delay, Box::new(self))
    }
}

type Script = dyn Fn(&TransportCall) -> ScriptedOutcome + Send + Sync;

/// Transport whose outcomes come from a closure over each [`TransportCall`]. Every call is
/// recorded so tests can assert on invocation counts and the exact headers sent.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&TransportCall) -> ScriptedOutcome + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every call answers `200 {}`.
    pub fn always_ok() -> Self {
        Self::new(|_| ScriptedOutcome::ok_json("{}"))
    }

    pub fn always_fail(failure: TransportFailure) -> Self {
        Self::new(move |_| ScriptedOutcome::Fail(failure.clone()))
    }

    pub fn never_complete() -> Self {
        Self::new(|_| ScriptedOutcome::Hang)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn invocations(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Calls whose URI path equals `path`.
    pub fn invocations_for(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|call| call.uri.path() == path)
            .count()
    }
}

impl LinkTransport for ScriptedTransport {
    fn invoke(&self, call: TransportCall) -> TransportFuture {
        let outcome = (self.script)(&call);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);

        async move {
            let mut outcome = outcome;
            loop {
                match outcome {
                    ScriptedOutcome::Respond(response) => return Ok(response),
                    ScriptedOutcome::Fail(failure) => return Err(failure),
                    ScriptedOutcome::Hang => return std::future::pending().await,
                    ScriptedOutcome::After(delay, next) => {
                        tokio::time::sleep(delay).await;
                        outcome = *next;
                    }
                }
            }
        }
        .boxed()
    }
}

/// Never reconnect automatically.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&mut self) -> Duration {
        Duration::from_secs(0)
    }

    fn reset(&mut self) {}

    fn should_retry(&self) -> bool {
        false
    }

    fn attempts(&self) -> u32 {
        0
    }
}

/// Observer that keeps every event it sees, in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<LinkEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, pred: impl Fn(&LinkEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| pred(event))
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl LinkObserver for RecordingObserver {
    fn on_event(&self, event: &LinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
