use std::sync::Arc;

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use tokio::sync::mpsc;

use super::actor::{
    Cancel, ClearCredentials, Configure, Connect, Disconnect, GetConnectionState, GetHistory,
    GetLinkStats, GetPendingCount, GetQuality, GetQualityStats, LinkActor, LinkActorArgs,
    RecordSample, ResetQualityStats, SetCredentials, Submit, Subscribe, Unsubscribe,
    prepare_config,
};
use super::events::{ChannelObserver, LinkEvent, LinkObserverHandle, SubscriptionId};
use crate::core::{
    ConnectionState, Credentials, LinkConfig, LinkError, LinkResult, LinkSettings, LinkStats,
    QualityLevel, QualitySample, QualityStats, RequestId, RequestSpec,
};
use crate::transport::LinkTransport;

fn unavailable<M>(err: SendError<M, LinkError>) -> LinkError {
    match err {
        SendError::HandlerError(err) => err,
        _ => LinkError::ActorError("link actor unavailable".to_string()),
    }
}

/// Cloneable façade over a running [`LinkActor`].
///
/// Every method is a round trip through the actor mailbox, so calls from different clones are
/// serialized against each other and against transport completions.
pub struct LinkClient<T: LinkTransport = Arc<dyn LinkTransport>> {
    actor: ActorRef<LinkActor<T>>,
}

impl<T: LinkTransport> Clone for LinkClient<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl<T: LinkTransport> LinkClient<T> {
    /// Validate `config` and spawn a link actor with the default retry and reconnect policies.
    pub fn spawn(config: LinkConfig, transport: T) -> LinkResult<Self> {
        Self::spawn_with(LinkActorArgs::new(config, transport))
    }

    /// Spawn with explicit arguments. Configuration errors surface here, not on first use.
    pub fn spawn_with(mut args: LinkActorArgs<T>) -> LinkResult<Self> {
        args.config = prepare_config(args.config)?;
        Ok(Self {
            actor: LinkActor::spawn(args),
        })
    }

    pub fn actor_ref(&self) -> &ActorRef<LinkActor<T>> {
        &self.actor
    }

    pub async fn configure(&self, settings: LinkSettings) -> LinkResult<()> {
        self.actor.ask(Configure(settings)).await.map_err(unavailable)
    }

    /// Start connecting. Returns `false` when no server URL is known.
    pub async fn connect(&self, server_url: Option<String>) -> LinkResult<bool> {
        self.actor
            .ask(Connect { server_url })
            .await
            .map_err(unavailable)
    }

    /// Cancel everything in flight and drop credentials.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.actor.ask(Disconnect).await.map_err(unavailable)
    }

    pub async fn submit(&self, spec: RequestSpec) -> LinkResult<RequestId> {
        self.actor.ask(Submit(spec)).await.map_err(unavailable)
    }

    pub async fn cancel(&self, request_id: RequestId) -> LinkResult<bool> {
        self.actor.ask(Cancel(request_id)).await.map_err(unavailable)
    }

    pub async fn set_credentials(&self, credentials: Credentials) -> LinkResult<()> {
        self.actor
            .ask(SetCredentials(credentials))
            .await
            .map_err(unavailable)
    }

    pub async fn clear_credentials(&self) -> LinkResult<()> {
        self.actor.ask(ClearCredentials).await.map_err(unavailable)
    }

    pub async fn record_sample(
        &self,
        latency_ms: u64,
        packet_loss_pct: f64,
        bandwidth_kbps: u64,
    ) -> LinkResult<QualitySample> {
        self.actor
            .ask(RecordSample {
                latency_ms,
                packet_loss_pct,
                bandwidth_kbps,
            })
            .await
            .map_err(unavailable)
    }

    pub async fn connection_state(&self) -> LinkResult<ConnectionState> {
        self.actor.ask(GetConnectionState).await.map_err(unavailable)
    }

    pub async fn quality(&self) -> LinkResult<Option<QualitySample>> {
        self.actor.ask(GetQuality).await.map_err(unavailable)
    }

    pub async fn quality_level(&self) -> LinkResult<Option<QualityLevel>> {
        Ok(self.quality().await?.map(|sample| sample.level))
    }

    pub async fn quality_score(&self) -> LinkResult<Option<u8>> {
        Ok(self.quality().await?.map(|sample| sample.score))
    }

    /// Samples recorded in the last `minutes`, oldest first.
    pub async fn history(&self, minutes: u64) -> LinkResult<Vec<QualitySample>> {
        self.actor
            .ask(GetHistory { minutes })
            .await
            .map_err(unavailable)
    }

    pub async fn quality_stats(&self) -> LinkResult<QualityStats> {
        self.actor.ask(GetQualityStats).await.map_err(unavailable)
    }

    pub async fn reset_quality_stats(&self) -> LinkResult<()> {
        self.actor.ask(ResetQualityStats).await.map_err(unavailable)
    }

    pub async fn stats(&self) -> LinkResult<LinkStats> {
        self.actor.ask(GetLinkStats).await.map_err(unavailable)
    }

    pub async fn pending_count(&self) -> LinkResult<usize> {
        self.actor.ask(GetPendingCount).await.map_err(unavailable)
    }

    pub async fn subscribe(&self, observer: LinkObserverHandle) -> LinkResult<SubscriptionId> {
        self.actor.ask(Subscribe(observer)).await.map_err(unavailable)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> LinkResult<bool> {
        self.actor.ask(Unsubscribe(id)).await.map_err(unavailable)
    }

    /// Subscribe with a channel-backed observer.
    pub async fn subscribe_channel(
        &self,
    ) -> LinkResult<(SubscriptionId, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (observer, rx) = ChannelObserver::new();
        let id = self.subscribe(Arc::new(observer)).await?;
        Ok((id, rx))
    }

    /// Stop the actor and wait for its timers and in-flight attempts to be torn down.
    pub async fn shutdown(&self) {
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
    }
}
