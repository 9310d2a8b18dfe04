use std::sync::Arc;
use std::time::Duration;

use sonic_rs::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{ConnectionState, FailureReason, QualityLevel, RequestContext, RequestId};

/// Everything the link reports to subscribers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    RequestSucceeded {
        request_id: RequestId,
        operation: Arc<str>,
        payload: Value,
        latency: Duration,
        context: Arc<RequestContext>,
    },
    RequestFailed {
        request_id: RequestId,
        operation: Arc<str>,
        reason: FailureReason,
        is_terminal: bool,
        context: Arc<RequestContext>,
    },
    ConnectionStateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    QualityChanged {
        level: QualityLevel,
        score: u8,
    },
    QualityWarning {
        level: QualityLevel,
        message: &'static str,
    },
    HeartbeatSent {
        request_id: RequestId,
    },
    HeartbeatReceived {
        request_id: RequestId,
        latency: Duration,
    },
    HeartbeatMissed {
        request_id: RequestId,
        reason: FailureReason,
    },
}

/// Subscriber interface.
///
/// Called from inside the link actor's handlers: implementations must not block. Override the
/// typed hooks you care about, or [`LinkObserver::on_event`] to see everything.
pub trait LinkObserver: Send + Sync + 'static {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::RequestSucceeded { .. } | LinkEvent::RequestFailed { .. } => {
                self.on_request_completed(event)
            }
            LinkEvent::ConnectionStateChanged { old, new } => self.on_state_changed(*old, *new),
            LinkEvent::QualityChanged { level, score } => self.on_quality_changed(*level, *score),
            LinkEvent::QualityWarning { level, message } => {
                self.on_quality_warning(*level, message)
            }
            LinkEvent::HeartbeatSent { .. }
            | LinkEvent::HeartbeatReceived { .. }
            | LinkEvent::HeartbeatMissed { .. } => self.on_heartbeat(event),
        }
    }

    /// `RequestSucceeded` or `RequestFailed`.
    #[inline]
    fn on_request_completed(&self, _event: &LinkEvent) {}

    #[inline]
    fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {}

    #[inline]
    fn on_quality_changed(&self, _level: QualityLevel, _score: u8) {}

    #[inline]
    fn on_quality_warning(&self, _level: QualityLevel, _message: &str) {}

    #[inline]
    fn on_heartbeat(&self, _event: &LinkEvent) {}
}

pub type LinkObserverHandle = Arc<dyn LinkObserver>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Forwards every event into an unbounded channel. Dropping the receiver silently detaches.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl LinkObserver for ChannelObserver {
    fn on_event(&self, event: &LinkEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Explicit subscriber registry owned by the link actor.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, LinkObserverHandle)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: LinkObserverHandle) -> SubscriptionId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = SubscriptionId(self.next_id);
        self.subscribers.push((id, observer));
        debug!(
            subscription = id.get(),
            subscribers = self.subscribers.len(),
            "observer subscribed"
        );
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        before != self.subscribers.len()
    }

    pub fn publish(&self, event: LinkEvent) {
        for (_, observer) in &self.subscribers {
            observer.on_event(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StateCounter {
        changes: AtomicUsize,
    }

    impl LinkObserver for StateCounter {
        fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn typed_hooks_receive_only_their_events() {
        let counter = Arc::new(StateCounter::default());
        let mut bus = EventBus::new();
        bus.subscribe(counter.clone());

        bus.publish(LinkEvent::ConnectionStateChanged {
            old: ConnectionState::Disconnected,
            new: ConnectionState::Connecting,
        });
        bus.publish(LinkEvent::QualityChanged {
            level: QualityLevel::Good,
            score: 80,
        });

        assert_eq!(counter.changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_detaches_observer() {
        let (observer, mut rx) = ChannelObserver::new();
        let mut bus = EventBus::new();
        let id = bus.subscribe(Arc::new(observer));

        bus.publish(LinkEvent::HeartbeatSent {
            request_id: RequestId::new(1),
        });
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::HeartbeatSent { .. })));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(LinkEvent::HeartbeatSent {
            request_id: RequestId::new(2),
        });
        assert!(rx.try_recv().is_err());
        assert!(bus.is_empty());
    }
}
