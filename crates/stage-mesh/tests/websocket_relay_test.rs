//! WebSocket relay end-to-end tests
//!
//! Runs the relay server on an ephemeral port and talks to it through
//! [`WebSocketRelay`] clients.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{init_logging, SimNetwork};
use stage_mesh::signaling::{
    RelayEvent, RelaySubscription, SessionDescriptionPayload, TopologyUpdatePayload,
};
use stage_mesh::{
    RelayServer, SignalingMessage, SignalingRelay, StageConfig, StageOrchestrator,
    StaticMediaSource, WebSocketRelay,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn next_event<F>(events: &mut RelaySubscription, mut matches: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("relay subscription open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for relay event")
}

fn joined(id: &str) -> impl FnMut(&RelayEvent) -> bool + '_ {
    move |event| matches!(event, RelayEvent::PresenceJoined { participant_id, .. } if participant_id == id)
}

fn offer(to: &str) -> SignalingMessage {
    SignalingMessage::offer(
        "spoofed",
        to,
        &SessionDescriptionPayload {
            sdp: "v=0".to_string(),
            connection_id: "c1".to_string(),
            in_reply_to: None,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_presence_and_routing() {
    init_logging();
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let handle = server.start().unwrap();

    let alice = WebSocketRelay::new(handle.url());
    let bob = WebSocketRelay::new(handle.url());
    let carol = WebSocketRelay::new(handle.url());

    let mut alice_rx = alice.connect("stage", "alice").await.unwrap();
    next_event(&mut alice_rx, joined("alice")).await;

    let mut bob_rx = bob.connect("stage", "bob").await.unwrap();
    // Initial sync lists existing members, then alice hears about bob
    next_event(&mut bob_rx, joined("alice")).await;
    next_event(&mut bob_rx, |e| matches!(e, RelayEvent::PresenceSynced)).await;
    next_event(&mut alice_rx, joined("bob")).await;

    let mut carol_rx = carol.connect("stage", "carol").await.unwrap();
    next_event(&mut carol_rx, joined("bob")).await;
    next_event(&mut alice_rx, joined("carol")).await;
    next_event(&mut bob_rx, joined("carol")).await;
    assert_eq!(
        handle.state().members("stage").await,
        vec!["alice", "bob", "carol"]
    );

    // Addressed: only bob receives it, with the sender stamped by the relay
    alice.publish(&offer("bob")).await.unwrap();
    let delivered = next_event(&mut bob_rx, |e| matches!(e, RelayEvent::Message(_))).await;
    let RelayEvent::Message(message) = delivered else {
        unreachable!()
    };
    assert_eq!(message.from, "alice");
    assert_eq!(message.to.as_deref(), Some("bob"));

    // Broadcast: everyone but the sender
    let update = SignalingMessage::topology_update(
        "carol",
        &TopologyUpdatePayload {
            active_peers: vec!["alice".to_string(), "bob".to_string()],
            max_degree: 6,
        },
    )
    .unwrap();
    carol.publish(&update).await.unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        let event = next_event(rx, |e| matches!(e, RelayEvent::Message(_))).await;
        let RelayEvent::Message(message) = event else {
            unreachable!()
        };
        assert_eq!(message.from, "carol");
        assert!(message.is_broadcast());
    }

    // Carol gets neither the addressed offer nor her own broadcast
    assert!(timeout(Duration::from_millis(200), async {
        loop {
            match carol_rx.recv().await {
                Some(RelayEvent::Message(_)) => return,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err());

    bob.disconnect().await.unwrap();
    next_event(&mut alice_rx, |e| {
        matches!(e, RelayEvent::PresenceLeft { participant_id } if participant_id == "bob")
    })
    .await;
    assert_eq!(handle.state().members("stage").await, vec!["alice", "carol"]);

    alice.disconnect().await.unwrap();
    carol.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_publish_before_connect_fails() {
    init_logging();
    let relay = WebSocketRelay::new("ws://127.0.0.1:1");
    assert!(relay.publish(&offer("bob")).await.is_err());
    assert!(relay.connect("stage", "alice").await.is_err());
    relay.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stage_over_websocket_relay() {
    init_logging();
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let handle = server.start().unwrap();
    let network = SimNetwork::new();

    let participant = |id: &str| {
        StageOrchestrator::new(
            Arc::new(WebSocketRelay::new(handle.url())),
            network.factory(id),
            Arc::new(StaticMediaSource::new()),
        )
    };
    let alice = participant("alice");
    let bob = participant("bob");

    alice.join(StageConfig::new("ws-stage", "alice")).await.unwrap();
    bob.join(StageConfig::new("ws-stage", "bob")).await.unwrap();

    let connected = timeout(WAIT, async {
        loop {
            if alice.state().connected_peers == vec!["bob".to_string()]
                && bob.state().connected_peers == vec!["alice".to_string()]
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(connected.is_ok(), "peers should connect through the relay");
    assert_eq!(alice.state().participant_count, 2);

    bob.leave().await.unwrap();
    let left = timeout(WAIT, async {
        while alice.state().participant_count != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(left.is_ok(), "alice should see bob leave");

    alice.leave().await.unwrap();
    handle.shutdown().await;
}
