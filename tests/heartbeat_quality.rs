use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shared_net::client::LinkActorArgs;
use shared_net::core::{ConnectionState, LinkConfig, LinkSettings, QualityLevel, RequestKind};
use shared_net::testing::{NoReconnect, RecordingObserver, ScriptedOutcome, ScriptedTransport};
use shared_net::transport::TransportResponse;
use shared_net::{LinkClient, LinkEvent};

fn config() -> LinkConfig {
    LinkConfig::default().with_server_url("https://api.example.org")
}

async fn connected(
    args: LinkActorArgs<ScriptedTransport>,
) -> (LinkClient<ScriptedTransport>, RecordingObserver) {
    let client = LinkClient::spawn_with(args).expect("valid config");
    let observer = RecordingObserver::new();
    client
        .subscribe(Arc::new(observer.clone()))
        .await
        .expect("subscribe");
    assert!(client.connect(None).await.unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        client.connection_state().await.unwrap(),
        ConnectionState::Connected
    );
    (client, observer)
}

fn heartbeats_sent(observer: &RecordingObserver) -> usize {
    observer.count(|event| matches!(event, LinkEvent::HeartbeatSent { .. }))
}

#[tokio::test(start_paused = true)]
async fn heartbeats_follow_the_configured_interval() {
    let transport = ScriptedTransport::always_ok();
    let (client, observer) = connected(LinkActorArgs::new(config(), transport.clone())).await;

    tokio::time::sleep(Duration::from_secs(185)).await;

    assert_eq!(heartbeats_sent(&observer), 3);
    assert_eq!(
        observer.count(|event| matches!(event, LinkEvent::HeartbeatReceived { .. })),
        3
    );
    assert_eq!(transport.invocations_for("/api/v1/ping"), 3);
    // Connection checks every 30s on top of the initial probe.
    assert_eq!(transport.invocations_for("/health"), 1 + 6);

    assert_eq!(
        client.quality_level().await.unwrap(),
        Some(QualityLevel::Excellent)
    );
    assert_eq!(client.history(60).await.unwrap().len(), 3);
    let stats = client.quality_stats().await.unwrap();
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.current_score, Some(100));

    let link = client.stats().await.unwrap();
    assert_eq!((link.heartbeats_sent, link.heartbeats_received), (3, 3));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_interval_can_be_changed_at_runtime() {
    let transport = ScriptedTransport::always_ok();
    let (client, observer) = connected(LinkActorArgs::new(config(), transport)).await;

    client
        .configure(LinkSettings::default().heartbeat_interval_ms(10_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(55)).await;

    assert_eq!(heartbeats_sent(&observer), 5);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_take_the_link_down() {
    let transport = ScriptedTransport::new(|call| match call.kind {
        RequestKind::Heartbeat => ScriptedOutcome::status(502),
        _ => ScriptedOutcome::ok_json("{}"),
    });
    let (client, observer) = connected(
        LinkActorArgs::new(config(), transport).with_reconnect_strategy(NoReconnect),
    )
    .await;

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert_eq!(
        client.connection_state().await.unwrap(),
        ConnectionState::Connected
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        client.connection_state().await.unwrap(),
        ConnectionState::Error
    );
    assert_eq!(
        observer.count(|event| matches!(event, LinkEvent::HeartbeatMissed { .. })),
        3
    );

    // Heartbeats stop with the session.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(heartbeats_sent(&observer), 3);
    let link = client.stats().await.unwrap();
    assert_eq!((link.heartbeats_sent, link.heartbeats_received), (3, 0));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn degrading_heartbeats_raise_quality_warnings() {
    let degraded = Arc::new(AtomicBool::new(false));
    let flag = degraded.clone();
    let transport = ScriptedTransport::new(move |call| match call.kind {
        RequestKind::Heartbeat if flag.load(Ordering::SeqCst) => ScriptedOutcome::Respond(
            TransportResponse::ok_json("{}").with_bandwidth(50),
        )
        .delayed(Duration::from_millis(700)),
        _ => ScriptedOutcome::Respond(TransportResponse::ok_json("{}").with_bandwidth(8000)),
    });
    let (client, observer) = connected(LinkActorArgs::new(config(), transport)).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(
        client.quality_level().await.unwrap(),
        Some(QualityLevel::Excellent)
    );

    degraded.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // 700ms latency and 50kbps: 100 - 40 - 30 = 30.
    assert_eq!(client.quality_score().await.unwrap(), Some(30));
    assert_eq!(
        client.quality_level().await.unwrap(),
        Some(QualityLevel::Poor)
    );
    let warnings: Vec<(QualityLevel, &'static str)> = observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LinkEvent::QualityWarning { level, message } => Some((level, message)),
            _ => None,
        })
        .collect();
    assert_eq!(
        warnings,
        vec![(
            QualityLevel::Poor,
            "Network quality is poor. You may experience connection issues."
        )]
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn recorded_samples_feed_the_same_monitor() {
    let client = LinkClient::spawn(config(), ScriptedTransport::always_ok()).unwrap();
    let observer = RecordingObserver::new();
    client
        .subscribe(Arc::new(observer.clone()))
        .await
        .unwrap();

    let sample = client.record_sample(30, 0.0, 5000).await.unwrap();
    assert_eq!((sample.score, sample.level), (100, QualityLevel::Excellent));

    let sample = client.record_sample(5000, 50.0, 10).await.unwrap();
    assert_eq!((sample.score, sample.level), (0, QualityLevel::VeryPoor));

    // Improvement changes the level but never warns.
    client.record_sample(30, 0.0, 5000).await.unwrap();

    let changes = observer.count(|event| matches!(event, LinkEvent::QualityChanged { .. }));
    let warnings = observer.count(|event| matches!(event, LinkEvent::QualityWarning { .. }));
    assert_eq!(changes, 3);
    assert_eq!(warnings, 1);

    client.reset_quality_stats().await.unwrap();
    assert_eq!(client.quality_stats().await.unwrap().samples, 0);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn history_is_limited_to_the_requested_window() {
    let client = LinkClient::spawn(config(), ScriptedTransport::always_ok()).unwrap();

    client.record_sample(20, 0.0, 5000).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    client.record_sample(20, 0.0, 5000).await.unwrap();

    assert_eq!(client.history(5).await.unwrap().len(), 1);
    assert_eq!(client.history(60).await.unwrap().len(), 2);
    client.shutdown().await;
}
