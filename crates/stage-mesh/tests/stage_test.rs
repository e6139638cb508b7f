//! Stage orchestrator integration tests
//!
//! Full sessions over the in-memory relay with simulated peer transports.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use harness::{init_logging, OpKind, SimNetwork};
use stage_mesh::{
    ConnectionStatus, Error, ErrorKind, InMemoryRelayHub, Result, SessionHook, Severity,
    StageConfig, StageEvent, StageOrchestrator, StaticMediaSource, TrackKind,
};

const STAGE: &str = "stage-1";

fn participant(hub: &InMemoryRelayHub, network: &SimNetwork, id: &str) -> StageOrchestrator {
    participant_with_media(hub, network, id, StaticMediaSource::new())
}

fn participant_with_media(
    hub: &InMemoryRelayHub,
    network: &SimNetwork,
    id: &str,
    media: StaticMediaSource,
) -> StageOrchestrator {
    StageOrchestrator::new(Arc::new(hub.relay()), network.factory(id), Arc::new(media))
}

/// Poll `check` until it holds
async fn wait_for<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Receive events until one matches
async fn next_matching<F>(
    events: &mut broadcast::Receiver<StageEvent>,
    within: Duration,
    mut matches: F,
) -> Option<StageEvent>
where
    F: FnMut(&StageEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn connected_pair(
    hub: &InMemoryRelayHub,
    network: &SimNetwork,
) -> (StageOrchestrator, StageOrchestrator) {
    let alice = participant(hub, network, "alice");
    let bob = participant(hub, network, "bob");
    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    bob.join(StageConfig::new(STAGE, "bob")).await.unwrap();

    let connected = wait_for(Duration::from_secs(5), || {
        alice.state().connected_peers == vec!["bob".to_string()]
            && bob.state().connected_peers == vec!["alice".to_string()]
    })
    .await;
    assert!(connected, "alice and bob should connect");
    (alice, bob)
}

#[tokio::test]
async fn test_two_participants_connect_and_leave() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();

    let alice = participant(&hub, &network, "alice");
    let mut alice_events = alice.subscribe();
    let (alice, bob) = {
        let bob = participant(&hub, &network, "bob");
        alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
        assert_eq!(alice.state().participant_count, 1);
        bob.join(StageConfig::new(STAGE, "bob")).await.unwrap();
        (alice, bob)
    };

    let added = next_matching(&mut alice_events, Duration::from_secs(5), |event| {
        matches!(event, StageEvent::RemoteStreamAdded { peer_id, .. } if peer_id == "bob")
    })
    .await;
    assert!(added.is_some(), "alice should receive bob's stream");

    assert!(
        wait_for(Duration::from_secs(5), || {
            let state = alice.state();
            state.is_connected
                && state.participant_count == 2
                && state.connected_peers == vec!["bob".to_string()]
        })
        .await
    );
    assert_eq!(bob.state().participant_count, 2);
    assert_eq!(alice.state().stage_id.as_deref(), Some(STAGE));

    // Glare between the two initial offers leaves one connection per side
    assert!(network.created_count("alice", "bob") <= 2);
    assert_eq!(network.created_count("bob", "alice"), 1);

    bob.leave().await.unwrap();
    let removed = next_matching(&mut alice_events, Duration::from_secs(5), |event| {
        matches!(event, StageEvent::PeerRemoved { peer_id } if peer_id == "bob")
    })
    .await;
    assert!(removed.is_some(), "alice should see bob leave");
    assert!(
        wait_for(Duration::from_secs(5), || {
            let state = alice.state();
            state.participant_count == 1 && state.connected_peers.is_empty()
        })
        .await
    );
    assert!(network.transport("alice", "bob").unwrap().is_closed());

    let bob_state = bob.state();
    assert_eq!(bob_state.connection_state, ConnectionStatus::Disconnected);
    assert_eq!(bob_state.participant_count, 0);
    assert!(bob_state.stage_id.is_none());
    assert!(!bob.is_joined().await);

    // Leaving twice is harmless
    bob.leave().await.unwrap();
    alice.leave().await.unwrap();
    alice.leave().await.unwrap();
    assert!(hub.members(STAGE).is_empty());
}

#[tokio::test]
async fn test_toggle_audio_twice_restores_state() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let alice = participant(&hub, &network, "alice");

    assert!(matches!(
        alice.toggle_audio().await,
        Err(Error::SessionError(_))
    ));

    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    let initial = alice.state().media_state;
    assert!(initial.audio_enabled);
    assert!(initial.video_enabled);

    assert!(!alice.toggle_audio().await.unwrap());
    assert!(!alice.state().media_state.audio_enabled);
    assert!(alice.state().media_state.video_enabled);

    assert!(alice.toggle_audio().await.unwrap());
    assert_eq!(alice.state().media_state, initial);

    assert!(!alice.toggle_video().await.unwrap());
    assert!(!alice.state().media_state.video_enabled);

    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_audience_joins_without_media() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let viewer = participant(&hub, &network, "viewer");

    viewer
        .join(StageConfig::audience(STAGE, "viewer"))
        .await
        .unwrap();
    let media = viewer.state().media_state;
    assert!(!media.audio_enabled);
    assert!(!media.video_enabled);
    assert!(viewer.toggle_audio().await.is_err());

    viewer.leave().await.unwrap();
}

#[tokio::test]
async fn test_switch_device_replaces_tracks_on_every_peer() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    let report = alice.switch_device(TrackKind::Video, "cam-usb").await.unwrap();
    assert_eq!(report.replaced, vec!["bob"]);
    assert!(report.restarted.is_empty());
    assert_eq!(
        alice.state().media_state.video_device_id.as_deref(),
        Some("cam-usb")
    );
    assert!(network
        .ops_between("alice", "bob")
        .iter()
        .any(|op| matches!(op.kind, OpKind::ReplacedTracks(_))));

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();
}

#[tokio::test]
async fn test_switch_to_unavailable_device_reports_error() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let alice = participant_with_media(
        &hub,
        &network,
        "alice",
        StaticMediaSource::new().with_unavailable_device("cam-broken"),
    );
    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    let before = alice.state().media_state;

    let result = alice.switch_device(TrackKind::Video, "cam-broken").await;
    assert!(matches!(result, Err(Error::MediaTrackError(_))));

    let state = alice.state();
    assert_eq!(state.media_state, before);
    assert!(state.errors.iter().any(|e| e.kind == ErrorKind::Media));
    // Device failures do not end the session
    assert!(state.is_connected);

    alice.leave().await.unwrap();
}

struct RejectingHook;

#[async_trait]
impl SessionHook for RejectingHook {
    async fn on_join(&self, _config: &StageConfig) -> Result<()> {
        Err(Error::SessionError("consent withheld".to_string()))
    }

    async fn on_leave(&self, _stage_id: &str) {}
}

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionHook for RecordingHook {
    async fn on_join(&self, config: &StageConfig) -> Result<()> {
        self.calls.lock().push(format!("join:{}", config.stage_id));
        Ok(())
    }

    async fn on_leave(&self, stage_id: &str) {
        self.calls.lock().push(format!("leave:{}", stage_id));
    }
}

#[tokio::test]
async fn test_rejected_join_fails_without_network_activity() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let alice = participant(&hub, &network, "alice").with_hook(Arc::new(RejectingHook));

    let result = alice.join(StageConfig::new(STAGE, "alice")).await;
    assert!(matches!(result, Err(Error::SessionError(_))));

    let state = alice.state();
    assert_eq!(state.connection_state, ConnectionStatus::Failed);
    assert!(!state.is_connected);
    assert!(state.errors.iter().any(|e| e.severity == Severity::Fatal));
    assert!(hub.members(STAGE).is_empty());
    assert!(!alice.is_joined().await);
}

#[tokio::test]
async fn test_hook_sees_join_and_leave() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let hook = Arc::new(RecordingHook::default());
    let alice = participant(&hub, &network, "alice").with_hook(hook.clone());

    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    alice.leave().await.unwrap();
    alice.leave().await.unwrap();

    assert_eq!(
        *hook.calls.lock(),
        vec![format!("join:{}", STAGE), format!("leave:{}", STAGE)]
    );
}

#[tokio::test]
async fn test_join_twice_and_invalid_config_fail() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let alice = participant(&hub, &network, "alice");

    assert!(matches!(
        alice.join(StageConfig::new("", "alice")).await,
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(alice.state().connection_state, ConnectionStatus::Disconnected);

    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    assert!(matches!(
        alice.join(StageConfig::new(STAGE, "alice")).await,
        Err(Error::SessionError(_))
    ));
    assert!(alice.state().is_connected);

    alice.leave().await.unwrap();

    // A left orchestrator can join again
    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    assert!(alice.is_joined().await);
    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_stats_and_peers() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    let stats = alice.stats().await;
    assert_eq!(stats.stage_id.as_deref(), Some(STAGE));
    assert_eq!(stats.local_id.as_deref(), Some("alice"));
    assert_eq!(stats.known_peers, 1);
    assert_eq!(stats.active_peers, 1);
    assert_eq!(stats.records, 1);
    assert_eq!(stats.connected_peers, 1);
    assert!(stats.circuits.iter().any(|c| c.name == "signaling"));

    let peers = alice.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "bob");
    assert!(peers[0].has_remote_stream);

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();

    let stats = alice.stats().await;
    assert!(stats.stage_id.is_none());
    assert!(alice.peers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sampling_updates_network_quality() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let (alice, bob) = connected_pair(&hub, &network).await;

    // Default sampling interval is 5s
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(
        wait_for(Duration::from_secs(10), || {
            alice.state().network_quality != stage_mesh::NetworkQuality::Unknown
        })
        .await
    );
    assert_ne!(
        alice.stats().await.network_quality,
        stage_mesh::NetworkQuality::Unknown
    );

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_relay_ends_session() {
    init_logging();
    let hub = InMemoryRelayHub::new();
    let network = SimNetwork::new();
    let hook = Arc::new(RecordingHook::default());
    let alice = participant(&hub, &network, "alice").with_hook(hook.clone());
    let mut events = alice.subscribe();
    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();

    hub.fail_next_connects(1_000);
    assert!(hub.drop_participant(STAGE, "alice"));

    let fatal = next_matching(&mut events, Duration::from_secs(600), |event| {
        matches!(event, StageEvent::Error(error) if error.is_fatal())
    })
    .await;
    assert!(fatal.is_some(), "relay exhaustion should surface a fatal error");

    assert!(
        wait_for(Duration::from_secs(5), || {
            alice.state().connection_state == ConnectionStatus::Failed
        })
        .await
    );
    assert!(!alice.state().is_connected);

    // The session was released without an explicit leave
    assert!(!alice.is_joined().await);
    assert!(alice.toggle_audio().await.is_err());
    assert!(hub.members(STAGE).is_empty());
    assert_eq!(
        *hook.calls.lock(),
        vec![format!("join:{}", STAGE), format!("leave:{}", STAGE)]
    );

    // Leaving acknowledges the failure without calling the hook again
    alice.leave().await.unwrap();
    assert_eq!(alice.state().connection_state, ConnectionStatus::Disconnected);
    assert_eq!(hook.calls.lock().len(), 2);

    hub.fail_next_connects(0);
    alice.join(StageConfig::new(STAGE, "alice")).await.unwrap();
    assert!(alice.is_joined().await);
    assert_eq!(hub.members(STAGE), vec!["alice"]);
    alice.leave().await.unwrap();
}
