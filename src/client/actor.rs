//! Link actor.
//!
//! Single owner of every piece of mutable link state: the pending table, the retry queue, the
//! connection state machine and the quality monitor. Transport attempts and timers run as
//! tokio tasks outside kameo and report back through messages, so nothing here needs a lock.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use sonic_rs::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{EventBus, LinkEvent, LinkObserverHandle, SubscriptionId};
use crate::core::{
    ConnectionState, ConnectionStateMachine, CorrelationKey, Credentials, FailureReason,
    FixedIntervalReconnect, HeartbeatMonitor, HistoryWindow, LinearBackoffRetry, LinkConfig,
    LinkError, LinkHealthMonitor, LinkResult, LinkSettings, LinkStats, Payload, PendingTable,
    QualityMonitor, QualitySample, QualityScorer, QualityStats, ReconnectStrategy, RequestContext,
    RequestId, RequestKind, RequestSpec, RetryDecision, RetryPolicy, RetryQueue, TrackedRequest,
    UrlResolver, default_headers,
};
use crate::transport::{LinkTransport, TransportCall, TransportResponse};

const PROTOCOL_MESSAGE_MAX_BYTES: usize = 256;

/// Arguments passed when constructing a link actor.
pub struct LinkActorArgs<T: LinkTransport> {
    pub config: LinkConfig,
    pub transport: T,
    /// Defaults to [`LinearBackoffRetry`] over `config.retry_base_delay_ms`.
    pub retry_policy: Option<Box<dyn RetryPolicy>>,
    /// Defaults to [`FixedIntervalReconnect`] over the config's reconnect settings.
    pub reconnect_strategy: Option<Box<dyn ReconnectStrategy>>,
}

impl<T: LinkTransport> LinkActorArgs<T> {
    pub fn new(config: LinkConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            retry_policy: None,
            reconnect_strategy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry_policy = Some(Box::new(policy));
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect_strategy = Some(Box::new(strategy));
        self
    }
}

struct RetryTimer {
    due: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct LinkActor<T: LinkTransport> {
    config: LinkConfig,
    resolver: Option<UrlResolver>,
    transport: Arc<T>,
    self_ref: WeakActorRef<Self>,
    state: ConnectionStateMachine,
    pending: PendingTable,
    retry_policy: Box<dyn RetryPolicy>,
    retry_queue: RetryQueue,
    retry_timer: Option<RetryTimer>,
    retry_generation: u64,
    reconnect: Box<dyn ReconnectStrategy>,
    reconnect_timer: Option<JoinHandle<()>>,
    heartbeat: HeartbeatMonitor,
    quality: QualityMonitor,
    health: LinkHealthMonitor,
    credentials: Option<Credentials>,
    events: EventBus,
    next_request_id: u64,
    next_correlation: u64,
    connect_probe: Option<RequestId>,
    check_probe: Option<RequestId>,
    session: u64,
    session_tx: watch::Sender<bool>,
    heartbeat_task: Option<JoinHandle<()>>,
    check_task: Option<JoinHandle<()>>,
    sweep_tx: watch::Sender<bool>,
    sweep_task: Option<JoinHandle<()>>,
}

fn build_resolver(config: &LinkConfig) -> LinkResult<Option<UrlResolver>> {
    config
        .server_url
        .as_deref()
        .map(|url| UrlResolver::new(url, &config.api_base_path, &config.passthrough_endpoints))
        .transpose()
}

/// Validate a configuration the same way actor startup does.
pub fn prepare_config(mut config: LinkConfig) -> LinkResult<LinkConfig> {
    config.normalize();
    config.validate()?;
    build_resolver(&config)?;
    Ok(config)
}

impl<T: LinkTransport> Actor for LinkActor<T> {
    type Args = LinkActorArgs<T>;
    type Error = LinkError;

    fn name() -> &'static str {
        "LinkActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> LinkResult<Self> {
        let LinkActorArgs {
            config,
            transport,
            retry_policy,
            reconnect_strategy,
        } = args;

        let config = prepare_config(config)?;
        let resolver = build_resolver(&config)?;
        let retry_policy = retry_policy
            .unwrap_or_else(|| Box::new(LinearBackoffRetry::new(config.retry_base_delay())));
        let reconnect = reconnect_strategy.unwrap_or_else(|| {
            Box::new(
                FixedIntervalReconnect::new(config.reconnect_delay(), config.max_reconnect_attempts)
                    .with_jitter(config.reconnect_jitter),
            )
        });

        let quality = QualityMonitor::new(
            QualityScorer::new(config.quality.bands.clone(), config.quality.thresholds),
            HistoryWindow::new(config.quality.history_retention()),
        );
        let heartbeat = HeartbeatMonitor::new(
            config.quality.loss_window,
            config.max_missed_heartbeats,
            config.quality.assumed_bandwidth_kbps,
        );
        let (session_tx, _) = watch::channel(false);
        let (sweep_tx, _) = watch::channel(false);

        let mut actor = Self {
            pending: PendingTable::new(config.max_pending),
            config,
            resolver,
            transport: Arc::new(transport),
            self_ref: actor_ref.downgrade(),
            state: ConnectionStateMachine::new(),
            retry_policy,
            retry_queue: RetryQueue::new(),
            retry_timer: None,
            retry_generation: 0,
            reconnect,
            reconnect_timer: None,
            heartbeat,
            quality,
            health: LinkHealthMonitor::new(),
            credentials: None,
            events: EventBus::new(),
            next_request_id: 0,
            next_correlation: 0,
            connect_probe: None,
            check_probe: None,
            session: 0,
            session_tx,
            heartbeat_task: None,
            check_task: None,
            sweep_tx,
            sweep_task: None,
        };
        actor.start_sweeper();
        debug!(
            server = actor.connection_label(),
            "link actor started"
        );
        Ok(actor)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> LinkResult<()> {
        debug!(reason = ?reason, "link actor stopping");
        self.stop_all_tasks();
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "LinkActor panicked");
            Ok(std::ops::ControlFlow::Break(ActorStopReason::Panicked(err)))
        }
    }
}

// ---------------------------------------------------------------------------
// Public messages
// ---------------------------------------------------------------------------

/// Partial runtime reconfiguration.
pub struct Configure(pub LinkSettings);

/// Begin connecting, optionally switching to a new server URL first.
pub struct Connect {
    pub server_url: Option<String>,
}

pub struct Disconnect;

pub struct Submit(pub RequestSpec);

/// Cancel an application request. Replies `false` for unknown or internal requests.
pub struct Cancel(pub RequestId);

pub struct SetCredentials(pub Credentials);

pub struct ClearCredentials;

/// Feed an externally measured sample into the quality monitor.
pub struct RecordSample {
    pub latency_ms: u64,
    pub packet_loss_pct: f64,
    pub bandwidth_kbps: u64,
}

pub struct Subscribe(pub LinkObserverHandle);

pub struct Unsubscribe(pub SubscriptionId);

pub struct GetConnectionState;

pub struct GetQuality;

pub struct GetHistory {
    pub minutes: u64,
}

pub struct GetQualityStats;

pub struct ResetQualityStats;

pub struct GetLinkStats;

pub struct GetPendingCount;

// ---------------------------------------------------------------------------
// Internal messages
// ---------------------------------------------------------------------------

pub(crate) struct TransportCompleted {
    correlation: CorrelationKey,
    outcome: Result<TransportResponse, FailureReason>,
}

pub(crate) struct HeartbeatTick {
    session: u64,
}

pub(crate) struct ConnectionCheckTick {
    session: u64,
}

pub(crate) struct SweepTick;

pub(crate) struct RetryTick {
    generation: u64,
}

pub(crate) struct ReconnectFire {
    session: u64,
}

impl<T: LinkTransport> KameoMessage<Configure> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: Configure,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.configure(msg.0)
    }
}

impl<T: LinkTransport> KameoMessage<Connect> for LinkActor<T> {
    type Reply = LinkResult<bool>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.connect(msg.server_url)
    }
}

impl<T: LinkTransport> KameoMessage<Disconnect> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.disconnect("requested");
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<Submit> for LinkActor<T> {
    type Reply = LinkResult<RequestId>;

    async fn handle(&mut self, msg: Submit, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.submit(msg.0)
    }
}

impl<T: LinkTransport> KameoMessage<Cancel> for LinkActor<T> {
    type Reply = LinkResult<bool>;

    async fn handle(&mut self, msg: Cancel, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let id = msg.0;
        match self.pending.get(id).map(|entry| entry.request.kind) {
            Some(RequestKind::Application) => {}
            _ => return Ok(false),
        }
        let removed = self.pending.remove(id).is_some();
        if removed {
            self.health.record_cancelled(1);
            debug!(request = %id, "request cancelled");
            self.arm_retry_timer();
        }
        Ok(removed)
    }
}

impl<T: LinkTransport> KameoMessage<SetCredentials> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: SetCredentials,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(credentials = ?msg.0, "credentials updated");
        self.credentials = Some(msg.0);
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<ClearCredentials> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        _msg: ClearCredentials,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.credentials = None;
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<RecordSample> for LinkActor<T> {
    type Reply = LinkResult<QualitySample>;

    async fn handle(
        &mut self,
        msg: RecordSample,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.record_quality(
            Instant::now(),
            msg.latency_ms,
            msg.packet_loss_pct,
            msg.bandwidth_kbps,
        ))
    }
}

impl<T: LinkTransport> KameoMessage<Subscribe> for LinkActor<T> {
    type Reply = LinkResult<SubscriptionId>;

    async fn handle(
        &mut self,
        msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.events.subscribe(msg.0))
    }
}

impl<T: LinkTransport> KameoMessage<Unsubscribe> for LinkActor<T> {
    type Reply = LinkResult<bool>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.events.unsubscribe(msg.0))
    }
}

impl<T: LinkTransport> KameoMessage<GetConnectionState> for LinkActor<T> {
    type Reply = LinkResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state.state())
    }
}

impl<T: LinkTransport> KameoMessage<GetQuality> for LinkActor<T> {
    type Reply = LinkResult<Option<QualitySample>>;

    async fn handle(
        &mut self,
        _msg: GetQuality,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.quality.current().cloned())
    }
}

impl<T: LinkTransport> KameoMessage<GetHistory> for LinkActor<T> {
    type Reply = LinkResult<Vec<QualitySample>>;

    async fn handle(
        &mut self,
        msg: GetHistory,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let window = Duration::from_secs(msg.minutes.saturating_mul(60));
        Ok(self.quality.history().since(Instant::now(), window))
    }
}

impl<T: LinkTransport> KameoMessage<GetQualityStats> for LinkActor<T> {
    type Reply = LinkResult<QualityStats>;

    async fn handle(
        &mut self,
        _msg: GetQualityStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.quality.stats(Instant::now()))
    }
}

impl<T: LinkTransport> KameoMessage<ResetQualityStats> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        _msg: ResetQualityStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.quality.reset_stats(Instant::now());
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<GetLinkStats> for LinkActor<T> {
    type Reply = LinkResult<LinkStats>;

    async fn handle(
        &mut self,
        _msg: GetLinkStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut stats =
            self.health
                .get_stats(Instant::now(), self.pending.len(), self.pending.in_flight());
        stats.heartbeats_sent = self.heartbeat.sent();
        stats.heartbeats_received = self.heartbeat.received();
        Ok(stats)
    }
}

impl<T: LinkTransport> KameoMessage<GetPendingCount> for LinkActor<T> {
    type Reply = LinkResult<usize>;

    async fn handle(
        &mut self,
        _msg: GetPendingCount,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.pending.len())
    }
}

impl<T: LinkTransport> KameoMessage<TransportCompleted> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: TransportCompleted,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.on_transport_completed(msg.correlation, msg.outcome);
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<HeartbeatTick> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: HeartbeatTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.session != self.session || !self.state.is(ConnectionState::Connected) {
            return Ok(());
        }
        self.send_heartbeat();
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<ConnectionCheckTick> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: ConnectionCheckTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.session != self.session || !self.state.is(ConnectionState::Connected) {
            return Ok(());
        }
        if self.check_probe.is_some() {
            debug!("connection check still in flight; skipping tick");
            return Ok(());
        }
        let endpoint = self.config.health_endpoint.clone();
        match self.issue(RequestKind::Availability, "checkConnection", &endpoint) {
            Ok(id) => self.check_probe = Some(id),
            Err(err) => warn!(error = %err, "connection check could not be issued"),
        }
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<SweepTick> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        _msg: SweepTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.sweep_expired();
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<RetryTick> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: RetryTick,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let current = self
            .retry_timer
            .as_ref()
            .is_some_and(|timer| timer.generation == msg.generation);
        if !current {
            return Ok(());
        }
        self.retry_timer = None;

        let now = Instant::now();
        let pending = &self.pending;
        if let Some(id) = self
            .retry_queue
            .pop_due(now, |id, due| pending.is_awaiting_retry(id, due))
        {
            debug!(request = %id, "dispatching retry");
            self.dispatch(id);
        }
        self.arm_retry_timer();
        Ok(())
    }
}

impl<T: LinkTransport> KameoMessage<ReconnectFire> for LinkActor<T> {
    type Reply = LinkResult<()>;

    async fn handle(
        &mut self,
        msg: ReconnectFire,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.session != self.session || !self.state.is(ConnectionState::Reconnecting) {
            return Ok(());
        }
        self.reconnect_timer = None;
        if let Err(err) = self.begin_connecting() {
            warn!(error = %err, "reconnect attempt could not start");
            self.enter_error(&err.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

fn spawn_ticker<A, M, F>(
    actor: WeakActorRef<A>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    make: F,
) -> JoinHandle<()>
where
    A: Actor + KameoMessage<M>,
    M: Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        // First tick one full period after start.
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                }
                _ = ticker.tick() => {
                    let Some(actor_ref) = actor.upgrade() else { break; };
                    if actor_ref.tell(make()).send().await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn decode_payload(body: &[u8]) -> Result<Value, FailureReason> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::new());
    }
    sonic_rs::from_slice(body).map_err(|err| FailureReason::Decode(err.to_string()))
}

fn protocol_message(response: &TransportResponse) -> String {
    if response.body.is_empty() {
        return format!("HTTP status {}", response.status);
    }
    let text = String::from_utf8_lossy(&response.body);
    let mut end = text.len().min(PROTOCOL_MESSAGE_MAX_BYTES);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[derive(Debug)]
struct Decoded {
    payload: Value,
    bandwidth_kbps: Option<u64>,
}

/// 2xx is success; application bodies must decode as JSON. Probe and heartbeat bodies are
/// ignored.
fn interpret_response(
    kind: RequestKind,
    response: TransportResponse,
) -> Result<Decoded, FailureReason> {
    if !response.is_success() {
        return Err(FailureReason::Protocol {
            status: response.status,
            message: protocol_message(&response),
        });
    }
    let payload = match kind {
        RequestKind::Application => decode_payload(&response.body)?,
        RequestKind::Availability | RequestKind::Heartbeat => Value::new(),
    };
    Ok(Decoded {
        payload,
        bandwidth_kbps: response.bandwidth_kbps,
    })
}

fn log_api_call(request: &TrackedRequest, success: bool, latency: Duration) {
    let response_time_ms = latency.as_millis() as u64;
    match request.kind {
        RequestKind::Application => info!(
            operation = %request.operation,
            endpoint = %request.endpoint,
            method = %request.method,
            success,
            response_time_ms,
            retries = request.retry_count,
            "api call"
        ),
        kind => debug!(
            kind = kind.as_str(),
            endpoint = %request.endpoint,
            success,
            response_time_ms,
            "link probe"
        ),
    }
}

impl<T: LinkTransport> LinkActor<T> {
    fn connection_label(&self) -> &str {
        self.config.server_url.as_deref().unwrap_or("<unset>")
    }

    fn allocate_request_id(&mut self) -> RequestId {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        RequestId::new(self.next_request_id)
    }

    fn allocate_correlation(&mut self) -> CorrelationKey {
        self.next_correlation = self.next_correlation.wrapping_add(1);
        CorrelationKey::new(self.next_correlation)
    }

    fn publish(&self, event: LinkEvent) {
        self.events.publish(event);
    }

    fn transition(&mut self, to: ConnectionState) -> LinkResult<bool> {
        match self.state.transition(to)? {
            Some(change) => {
                info!(
                    connection = %self.connection_label(),
                    old = %change.old,
                    new = %change.new,
                    "connection state changed"
                );
                self.publish(LinkEvent::ConnectionStateChanged {
                    old: change.old,
                    new: change.new,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- configuration -----------------------------------------------------

    fn configure(&mut self, settings: LinkSettings) -> LinkResult<()> {
        let updated = settings.apply_to(&self.config)?;
        let resolver = build_resolver(&updated)?;

        let url_changed = updated.server_url != self.config.server_url;
        let intervals_changed = updated.heartbeat_interval_ms != self.config.heartbeat_interval_ms
            || updated.connection_check_interval_ms != self.config.connection_check_interval_ms;

        self.config = updated;
        self.resolver = resolver;
        self.quality
            .history_mut()
            .set_retention(self.config.quality.history_retention());
        info!(
            connection = %self.connection_label(),
            timeout_ms = self.config.timeout_ms,
            max_retries = self.config.max_retries,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            connection_check_interval_ms = self.config.connection_check_interval_ms,
            "link configured"
        );

        if url_changed && !self.state.is(ConnectionState::Disconnected) {
            self.disconnect("server url changed");
            self.connect(None)?;
        } else if intervals_changed && self.state.is(ConnectionState::Connected) {
            self.start_session_timers();
        }
        Ok(())
    }

    // -- connection lifecycle ----------------------------------------------

    fn connect(&mut self, server_url: Option<String>) -> LinkResult<bool> {
        if let Some(url) = server_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
        {
            if self.config.server_url.as_deref() != Some(url.as_str()) {
                let resolver = UrlResolver::new(
                    &url,
                    &self.config.api_base_path,
                    &self.config.passthrough_endpoints,
                )?;
                if !self.state.is(ConnectionState::Disconnected) {
                    self.disconnect("server url changed");
                }
                self.config.server_url = Some(url);
                self.resolver = Some(resolver);
            }
        }

        if self.resolver.is_none() {
            warn!("connect requested without a server URL");
            return Ok(false);
        }

        match self.state.state() {
            ConnectionState::Connecting | ConnectionState::Connected => Ok(true),
            ConnectionState::Disconnected
            | ConnectionState::Error
            | ConnectionState::Reconnecting => {
                self.reconnect.reset();
                self.begin_connecting()?;
                Ok(true)
            }
        }
    }

    /// Enter Connecting and issue the availability probe.
    fn begin_connecting(&mut self) -> LinkResult<()> {
        self.cancel_reconnect_timer();
        self.pending.ensure_capacity()?;
        self.transition(ConnectionState::Connecting)?;

        let endpoint = self.config.health_endpoint.clone();
        match self.issue(RequestKind::Availability, "checkServerAvailability", &endpoint) {
            Ok(id) => {
                self.connect_probe = Some(id);
                Ok(())
            }
            Err(err) => {
                self.enter_error(&format!("availability probe failed to start: {err}"));
                Err(err)
            }
        }
    }

    fn on_connected(&mut self) {
        self.reconnect.reset();
        self.heartbeat.reset();
        self.start_session_timers();
    }

    /// Move to Error and, if allowed, schedule an automatic reconnect.
    fn enter_error(&mut self, reason: &str) {
        self.stop_session_timers();
        self.connect_probe = None;
        self.check_probe = None;
        self.abort_internal_requests();
        match self.transition(ConnectionState::Error) {
            Ok(true) => self.schedule_reconnect(reason),
            Ok(false) => {}
            Err(err) => warn!(error = %err, reason, "could not enter error state"),
        }
    }

    /// Probes and heartbeats belong to the session that issued them.
    fn abort_internal_requests(&mut self) {
        let mut aborted = self.pending.remove_kind(RequestKind::Availability);
        aborted.extend(self.pending.remove_kind(RequestKind::Heartbeat));
        if !aborted.is_empty() {
            debug!(aborted = aborted.len(), "aborted probes and heartbeats of the failed session");
        }
    }

    fn schedule_reconnect(&mut self, reason: &str) {
        if !self.config.auto_reconnect {
            info!(connection = %self.connection_label(), reason, "auto-reconnect disabled");
            return;
        }
        if !self.reconnect.should_retry() {
            warn!(
                connection = %self.connection_label(),
                attempts = self.reconnect.attempts(),
                reason,
                "reconnect attempts exhausted; staying in error state"
            );
            return;
        }

        let delay = self.reconnect.next_delay();
        let attempt = self.reconnect.attempts();
        if let Err(err) = self.transition(ConnectionState::Reconnecting) {
            warn!(error = %err, "could not enter reconnecting state");
            return;
        }
        self.health.increment_reconnect();
        warn!(
            connection = %self.connection_label(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "reconnect scheduled"
        );

        self.cancel_reconnect_timer();
        let actor = self.self_ref.clone();
        let session = self.session;
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(actor_ref) = actor.upgrade() {
                let _ = actor_ref.tell(ReconnectFire { session }).send().await;
            }
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
    }

    /// Tear everything down: timers, retries, pending requests and credentials.
    fn disconnect(&mut self, reason: &str) {
        self.stop_session_timers();
        self.cancel_reconnect_timer();
        self.cancel_retry_timer();
        self.retry_queue.clear();
        self.connect_probe = None;
        self.check_probe = None;

        let drained = self.pending.drain();
        let cancelled = drained.len();
        for entry in drained {
            let request = entry.request;
            if request.kind == RequestKind::Application {
                self.publish(LinkEvent::RequestFailed {
                    request_id: request.id,
                    operation: request.operation,
                    reason: FailureReason::Cancelled("disconnected".to_string()),
                    is_terminal: true,
                    context: request.context,
                });
            }
        }
        self.health.record_cancelled(cancelled as u64);
        self.credentials = None;
        self.heartbeat.reset();

        if let Err(err) = self.transition(ConnectionState::Disconnected) {
            warn!(error = %err, "could not enter disconnected state");
        }
        info!(
            connection = %self.connection_label(),
            reason,
            cancelled,
            "link disconnected"
        );
    }

    fn start_session_timers(&mut self) {
        self.stop_session_timers();
        let (session_tx, session_rx) = watch::channel(false);
        self.session_tx = session_tx;
        let session = self.session;

        self.heartbeat_task = Some(spawn_ticker(
            self.self_ref.clone(),
            self.config.heartbeat_interval(),
            session_rx.clone(),
            move || HeartbeatTick { session },
        ));
        self.check_task = Some(spawn_ticker(
            self.self_ref.clone(),
            self.config.connection_check_interval(),
            session_rx,
            move || ConnectionCheckTick { session },
        ));
    }

    /// Stop heartbeat and connection-check timers. Bumping the session invalidates ticks that are
    /// already queued in the mailbox.
    fn stop_session_timers(&mut self) {
        let _ = self.session_tx.send(true);
        if let Some(handle) = self.heartbeat_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.check_task.take() {
            handle.abort();
        }
        self.session = self.session.wrapping_add(1);
    }

    fn start_sweeper(&mut self) {
        let (sweep_tx, sweep_rx) = watch::channel(false);
        self.sweep_tx = sweep_tx;
        self.sweep_task = Some(spawn_ticker(
            self.self_ref.clone(),
            self.config.sweep_interval(),
            sweep_rx,
            || SweepTick,
        ));
    }

    fn stop_all_tasks(&mut self) {
        self.stop_session_timers();
        let _ = self.sweep_tx.send(true);
        if let Some(handle) = self.sweep_task.take() {
            handle.abort();
        }
        self.cancel_reconnect_timer();
        self.cancel_retry_timer();
        self.retry_queue.clear();
        let aborted = self.pending.drain().len();
        if aborted > 0 {
            debug!(aborted, "aborted pending requests on shutdown");
        }
    }

    // -- request path --------------------------------------------------------

    fn submit(&mut self, spec: RequestSpec) -> LinkResult<RequestId> {
        spec.validate()?;

        let RequestSpec {
            operation,
            endpoint,
            method,
            payload,
            context,
            require_connection,
            max_retries,
        } = spec;

        let connect_first = require_connection && self.state.is(ConnectionState::Disconnected);
        // The availability probe needs a slot of its own.
        if connect_first {
            if let Err(err) = self.pending.ensure_room(2) {
                self.health.record_rejected();
                warn!(
                    operation = %operation,
                    pending = self.pending.len(),
                    "no room for request and availability probe"
                );
                return Err(err);
            }
        }

        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let id = self.enqueue(
            RequestKind::Application,
            Arc::from(operation),
            &endpoint,
            method,
            payload,
            context,
            max_retries,
        )?;

        if connect_first {
            if let Err(err) = self.begin_connecting() {
                warn!(request = %id, error = %err, "could not start connecting for request");
            }
        }
        Ok(id)
    }

    /// Internal probe or heartbeat. These never retry: a failure is the signal.
    fn issue(
        &mut self,
        kind: RequestKind,
        operation: &str,
        endpoint: &str,
    ) -> LinkResult<RequestId> {
        self.enqueue(
            kind,
            Arc::from(operation),
            endpoint,
            Method::GET,
            Payload::Empty,
            RequestContext::new(),
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &mut self,
        kind: RequestKind,
        operation: Arc<str>,
        endpoint: &str,
        method: Method,
        payload: Payload,
        context: RequestContext,
        max_retries: u32,
    ) -> LinkResult<RequestId> {
        let Some(resolver) = self.resolver.as_ref() else {
            return Err(LinkError::Validation("server URL is not configured".to_string()));
        };
        let uri = resolver.resolve(endpoint)?;

        if let Err(err) = self.pending.ensure_capacity() {
            self.health.record_rejected();
            warn!(
                operation = %operation,
                pending = self.pending.len(),
                "pending request table is full"
            );
            return Err(err);
        }

        let body = payload.into_body()?;
        let now = Instant::now();
        let mut headers = default_headers();
        if let Some(credentials) = self.credentials.as_ref() {
            credentials.apply(&mut headers, now)?;
        }

        let id = self.allocate_request_id();
        self.pending.insert(TrackedRequest {
            id,
            kind,
            operation,
            endpoint: Arc::from(endpoint),
            method,
            uri,
            headers,
            body,
            context: Arc::new(context),
            created_at: now,
            retry_count: 0,
            max_retries,
            timeout: self.config.timeout(),
        })?;
        self.dispatch(id);
        Ok(id)
    }

    /// Start one transport attempt for a pending request.
    fn dispatch(&mut self, id: RequestId) {
        let correlation = self.allocate_correlation();
        let Some(actor_ref) = self.self_ref.upgrade() else {
            warn!(request = %id, "link actor is shutting down; not dispatching");
            return;
        };
        let Some(entry) = self.pending.get(id) else {
            return;
        };

        let request = &entry.request;
        let call = TransportCall {
            correlation,
            request_id: id,
            kind: request.kind,
            attempt: request.retry_count + 1,
            method: request.method.clone(),
            uri: request.uri.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        let timeout = request.timeout;
        let future = self.transport.invoke(call);

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, future).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(failure)) => Err(FailureReason::from(failure)),
                Err(_) => Err(FailureReason::Timeout { after: timeout }),
            };
            let _ = actor_ref
                .tell(TransportCompleted {
                    correlation,
                    outcome,
                })
                .send()
                .await;
        });

        self.health.record_attempt();
        if let Err(err) =
            self.pending
                .begin_attempt(id, correlation, Instant::now(), handle.abort_handle())
        {
            warn!(request = %id, error = %err, "could not record transport attempt");
        }
    }

    fn on_transport_completed(
        &mut self,
        correlation: CorrelationKey,
        outcome: Result<TransportResponse, FailureReason>,
    ) {
        let Some(finished) = self.pending.finish_attempt(correlation, Instant::now()) else {
            debug!(correlation = %correlation, "dropping completion for unknown attempt");
            return;
        };
        let id = finished.request_id;
        let Some(kind) = self.pending.get(id).map(|entry| entry.request.kind) else {
            return;
        };

        match outcome.and_then(|response| interpret_response(kind, response)) {
            Ok(decoded) => self.complete_success(id, decoded, finished.latency),
            Err(reason) => self.handle_attempt_failure(id, reason, finished.latency),
        }
    }

    fn complete_success(&mut self, id: RequestId, decoded: Decoded, latency: Duration) {
        let now = Instant::now();
        let Some(entry) = self.pending.remove(id) else {
            return;
        };
        let request = entry.request;
        self.health.record_success(now, latency);
        log_api_call(&request, true, latency);

        match request.kind {
            RequestKind::Application => self.publish(LinkEvent::RequestSucceeded {
                request_id: id,
                operation: request.operation,
                payload: decoded.payload,
                latency,
                context: request.context,
            }),
            RequestKind::Availability => self.on_probe_outcome(id, Ok(())),
            RequestKind::Heartbeat => {
                self.on_heartbeat_outcome(id, Ok((latency, decoded.bandwidth_kbps)))
            }
        }
    }

    fn handle_attempt_failure(&mut self, id: RequestId, reason: FailureReason, latency: Duration) {
        let now = Instant::now();
        let Some(entry) = self.pending.get(id) else {
            return;
        };
        let retry_count = entry.request.retry_count;
        let max_retries = entry.request.max_retries;
        let kind = entry.request.kind;
        let operation = entry.request.operation.clone();
        let context = entry.request.context.clone();

        self.health.record_failure(now, &operation, &reason);

        let delay = match self.retry_policy.decide(retry_count, max_retries, &reason) {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::Terminal => {
                self.fail_terminal(id, reason, latency);
                return;
            }
        };

        let due = now + delay;
        let retry = match self.pending.schedule_retry(id, due) {
            Ok(retry) => retry,
            Err(err) => {
                warn!(request = %id, error = %err, "retry could not be scheduled");
                self.fail_terminal(id, reason, latency);
                return;
            }
        };

        self.health.record_retry();
        warn!(
            request = %id,
            operation = %operation,
            retry,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "request failed; retry scheduled"
        );
        if kind == RequestKind::Application {
            self.publish(LinkEvent::RequestFailed {
                request_id: id,
                operation,
                reason,
                is_terminal: false,
                context,
            });
        }
        self.retry_queue.schedule(id, due);
        self.arm_retry_timer();
    }

    fn fail_terminal(&mut self, id: RequestId, reason: FailureReason, latency: Duration) {
        let Some(entry) = self.pending.remove(id) else {
            return;
        };
        let request = entry.request;
        log_api_call(&request, false, latency);

        match request.kind {
            RequestKind::Application => {
                warn!(
                    request = %id,
                    operation = %request.operation,
                    retries = request.retry_count,
                    reason = %reason,
                    "request failed"
                );
                self.publish(LinkEvent::RequestFailed {
                    request_id: id,
                    operation: request.operation,
                    reason,
                    is_terminal: true,
                    context: request.context,
                });
            }
            RequestKind::Availability => self.on_probe_outcome(id, Err(reason)),
            RequestKind::Heartbeat => self.on_heartbeat_outcome(id, Err(reason)),
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.handle.abort();
        }
    }

    /// Keep exactly one retry timer armed for the earliest live due time.
    fn arm_retry_timer(&mut self) {
        let pending = &self.pending;
        let Some(due) = self
            .retry_queue
            .next_due(|id, due| pending.is_awaiting_retry(id, due))
        else {
            self.cancel_retry_timer();
            return;
        };

        if self.retry_timer.as_ref().is_some_and(|timer| timer.due <= due) {
            return;
        }
        self.cancel_retry_timer();

        self.retry_generation = self.retry_generation.wrapping_add(1);
        let generation = self.retry_generation;
        let actor = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            if let Some(actor_ref) = actor.upgrade() {
                let _ = actor_ref.tell(RetryTick { generation }).send().await;
            }
        });
        self.retry_timer = Some(RetryTimer {
            due,
            generation,
            handle,
        });
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired = self
            .pending
            .expire_older_than(now, self.config.max_request_age());
        if expired.is_empty() {
            return;
        }

        info!(
            count = expired.len(),
            max_age_ms = self.config.max_request_age_ms,
            "evicting expired requests"
        );
        for entry in expired {
            let request = entry.request;
            let reason = FailureReason::Expired {
                age: request.age(now),
            };
            self.health.record_expired(now, &request.operation, &reason);
            match request.kind {
                RequestKind::Application => self.publish(LinkEvent::RequestFailed {
                    request_id: request.id,
                    operation: request.operation,
                    reason,
                    is_terminal: true,
                    context: request.context,
                }),
                RequestKind::Availability => self.on_probe_outcome(request.id, Err(reason)),
                RequestKind::Heartbeat => self.on_heartbeat_outcome(request.id, Err(reason)),
            }
        }
        self.arm_retry_timer();
    }

    // -- probes, heartbeats and quality ------------------------------------

    fn on_probe_outcome(&mut self, id: RequestId, result: Result<(), FailureReason>) {
        let was_connect_probe = self.connect_probe == Some(id);
        if was_connect_probe {
            self.connect_probe = None;
        }
        let was_check_probe = self.check_probe == Some(id);
        if was_check_probe {
            self.check_probe = None;
        }

        match (self.state.state(), result) {
            (ConnectionState::Connecting, Ok(())) if was_connect_probe => {
                match self.transition(ConnectionState::Connected) {
                    Ok(_) => self.on_connected(),
                    Err(err) => warn!(error = %err, "could not enter connected state"),
                }
            }
            (ConnectionState::Connecting, Err(reason)) if was_connect_probe => {
                warn!(
                    connection = %self.connection_label(),
                    reason = %reason,
                    "server availability probe failed"
                );
                self.enter_error(&reason.to_string());
            }
            (ConnectionState::Connected, Err(reason)) if was_check_probe => {
                warn!(
                    connection = %self.connection_label(),
                    reason = %reason,
                    "connection check failed"
                );
                self.enter_error(&reason.to_string());
            }
            (state, result) => debug!(
                request = %id,
                state = %state,
                ok = result.is_ok(),
                "ignoring probe outcome"
            ),
        }
    }

    fn send_heartbeat(&mut self) {
        let now = Instant::now();
        let trimmed = self.quality.trim(now);
        if trimmed > 0 {
            debug!(trimmed, "trimmed quality history");
        }

        let endpoint = self.config.heartbeat_endpoint.clone();
        match self.issue(RequestKind::Heartbeat, "heartbeat", &endpoint) {
            Ok(id) => {
                self.heartbeat.record_sent();
                self.publish(LinkEvent::HeartbeatSent { request_id: id });
            }
            Err(err) => warn!(error = %err, "heartbeat could not be issued"),
        }
    }

    fn on_heartbeat_outcome(
        &mut self,
        id: RequestId,
        result: Result<(Duration, Option<u64>), FailureReason>,
    ) {
        if !self.state.is(ConnectionState::Connected) {
            debug!(request = %id, "ignoring heartbeat outcome outside connected state");
            return;
        }

        let observation = match result {
            Ok((latency, bandwidth_kbps)) => {
                self.publish(LinkEvent::HeartbeatReceived {
                    request_id: id,
                    latency,
                });
                self.heartbeat.record_success(latency, bandwidth_kbps)
            }
            Err(reason) => {
                warn!(
                    request = %id,
                    reason = %reason,
                    missed = self.heartbeat.missed_streak() + 1,
                    "heartbeat missed"
                );
                self.publish(LinkEvent::HeartbeatMissed {
                    request_id: id,
                    reason,
                });
                self.heartbeat.record_failure(self.config.timeout())
            }
        };

        self.record_quality(
            Instant::now(),
            observation.latency_ms,
            observation.packet_loss_pct,
            observation.bandwidth_kbps,
        );

        if self.heartbeat.threshold_reached() {
            let reason = format!("{} consecutive heartbeats missed", observation.missed_streak);
            self.enter_error(&reason);
        }
    }

    fn record_quality(
        &mut self,
        now: Instant,
        latency_ms: u64,
        packet_loss_pct: f64,
        bandwidth_kbps: u64,
    ) -> QualitySample {
        let update = self
            .quality
            .record(now, latency_ms, packet_loss_pct, bandwidth_kbps);
        let level = update.sample.level;

        if update.level_changed() {
            info!(
                level = %level,
                score = update.sample.score,
                latency_ms,
                packet_loss_pct,
                bandwidth_kbps,
                "link quality changed"
            );
            self.publish(LinkEvent::QualityChanged {
                level,
                score: update.sample.score,
            });
        }
        if update.degraded() {
            let message = level.degradation_message();
            warn!(level = %level, "{message}");
            self.publish(LinkEvent::QualityWarning { level, message });
        }
        update.sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sonic_rs::JsonValueTrait;

    #[test]
    fn application_bodies_decode_and_probe_bodies_are_ignored() {
        let ok = TransportResponse::ok_json(Bytes::from_static(br#"{"id":7}"#));
        let decoded = interpret_response(RequestKind::Application, ok).unwrap();
        assert_eq!(decoded.payload, sonic_rs::json!({"id": 7}));

        let garbage = TransportResponse::ok_json(Bytes::from_static(b"<html>"));
        assert!(matches!(
            interpret_response(RequestKind::Application, garbage.clone()),
            Err(FailureReason::Decode(_))
        ));
        assert!(interpret_response(RequestKind::Heartbeat, garbage).is_ok());

        let empty = TransportResponse::new(204, Bytes::new());
        let decoded = interpret_response(RequestKind::Application, empty).unwrap();
        assert!(decoded.payload.is_null());
    }

    #[test]
    fn non_2xx_becomes_a_protocol_failure() {
        let err = interpret_response(
            RequestKind::Application,
            TransportResponse::new(503, Bytes::from_static(b"maintenance")),
        )
        .unwrap_err();
        assert_eq!(
            err,
            FailureReason::Protocol {
                status: 503,
                message: "maintenance".to_string(),
            }
        );

        let err = interpret_response(
            RequestKind::Availability,
            TransportResponse::new(404, Bytes::new()),
        )
        .unwrap_err();
        assert_eq!(
            err,
            FailureReason::Protocol {
                status: 404,
                message: "HTTP status 404".to_string(),
            }
        );
    }

    #[test]
    fn protocol_message_is_truncated_on_a_char_boundary() {
        let body = "é".repeat(PROTOCOL_MESSAGE_MAX_BYTES);
        let message = protocol_message(&TransportResponse::new(500, body));
        assert!(message.len() <= PROTOCOL_MESSAGE_MAX_BYTES);
        assert!(message.chars().all(|c| c == 'é'));
    }
}
