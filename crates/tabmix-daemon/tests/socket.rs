// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end tests over the Unix socket with hand-driven agent and panel
//! connections.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabmix_daemon::clock::ManualClock;
use tabmix_daemon::storage::MemoryArea;
use tabmix_daemon::store::{StorageTiers, Store};
use tabmix_daemon::{actor, server, AgentRegistry, Coordinator, CoordinatorHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::watch;

struct LineClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Answer one agent command, returning it.
    async fn ack(&mut self) -> Value {
        let command = self.recv().await;
        let correlation_id = command["correlationId"].clone();
        self.send(json!({ "ok": true, "data": { "applied": 1 }, "correlationId": correlation_id }))
            .await;
        command
    }
}

struct Daemon {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    handle: CoordinatorHandle,
    _shutdown: watch::Sender<bool>,
}

async fn start(synced: MemoryArea) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("tabmix.sock");

    let store = Store::new(StorageTiers {
        synced: Some(Arc::new(synced)),
        local: Some(Arc::new(MemoryArea::new("local"))),
        session: Some(Arc::new(MemoryArea::new("session"))),
    });
    let agents = Arc::new(AgentRegistry::new(Duration::from_secs(2)));
    let mut coordinator =
        Coordinator::new(store, agents.clone(), Arc::new(ManualClock::new(1_000_000)));
    coordinator.init().await;
    let (handle, _) = actor::spawn(coordinator, Duration::from_secs(60));

    let listener = server::bind(&socket).unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::run(
        listener,
        socket.clone(),
        handle.clone(),
        agents,
        shutdown_rx,
    ));

    Daemon {
        _dir: dir,
        socket,
        handle,
        _shutdown: shutdown,
    }
}

fn saved_profile(origin: &str, volume: u8) -> MemoryArea {
    let mut profiles = serde_json::Map::new();
    profiles.insert(
        origin.to_string(),
        json!({
            "origin": origin,
            "defaultVolume": volume,
            "isMuted": false,
            "lastUsedTimestamp": 10,
            "createdTimestamp": 10
        }),
    );
    MemoryArea::new("sync").with_contents(json!({ "originProfiles": profiles }))
}

#[tokio::test]
async fn test_agent_report_restores_then_acks() {
    let daemon = start(saved_profile("a.com", 65)).await;
    let mut agent = LineClient::connect(&daemon.socket).await;

    agent
        .send(json!({ "kind": "AgentHello", "payload": { "contextId": 1 }, "correlationId": "h" }))
        .await;
    let hello = agent.recv().await;
    assert_eq!(hello["ok"], true);
    assert_eq!(hello["correlationId"], "h");

    agent
        .send(json!({
            "kind": "ActivityReport",
            "payload": {
                "contextId": 1,
                "isActive": true,
                "mediaKinds": ["audio"],
                "url": "https://a.com/track",
                "title": "Track"
            },
            "correlationId": "r1"
        }))
        .await;

    let volume = agent.ack().await;
    assert_eq!(volume["kind"], "ApplyVolume");
    assert_eq!(volume["payload"]["level"], 65);
    let mute = agent.ack().await;
    assert_eq!(mute["kind"], "ApplyMute");

    let ack = agent.recv().await;
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["correlationId"], "r1");
}

#[tokio::test]
async fn test_panel_volume_round_trip_and_disconnect() {
    let daemon = start(MemoryArea::new("sync")).await;
    let mut agent = LineClient::connect(&daemon.socket).await;
    agent
        .send(json!({ "kind": "AgentHello", "payload": { "contextId": 2 } }))
        .await;
    agent.recv().await;
    agent
        .send(json!({
            "kind": "ActivityReport",
            "payload": { "contextId": 2, "isActive": true, "url": "https://b.com", "title": "B" }
        }))
        .await;
    agent.ack().await;
    agent.ack().await;
    agent.recv().await;

    let mut panel = LineClient::connect(&daemon.socket).await;
    panel
        .send(json!({ "kind": "SetVolume", "payload": { "contextId": 2, "level": 150 }, "correlationId": "p1" }))
        .await;
    let applied = agent.ack().await;
    assert_eq!(applied["payload"]["level"], 150);
    let reply = panel.recv().await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["correlationId"], "p1");

    panel
        .send(json!({ "kind": "ListActiveContexts", "payload": {} }))
        .await;
    let listed = panel.recv().await;
    assert_eq!(listed["data"]["contexts"][0]["volumeLevel"], 150);

    drop(agent);
    let mut gone = false;
    for _ in 0..50 {
        let response = daemon
            .handle
            .request(tabmix_ipc::CommandEnvelope::new(
                "GetContextState",
                json!({ "contextId": 2 }),
            ))
            .await
            .unwrap();
        if !response.ok {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "closed agent's context should be removed");
}

#[tokio::test]
async fn test_malformed_line_gets_validation_error() {
    let daemon = start(MemoryArea::new("sync")).await;
    let mut panel = LineClient::connect(&daemon.socket).await;

    panel.send(json!("not an envelope")).await;
    let reply = panel.recv().await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "ValidationError");

    panel
        .send(json!({ "kind": "SetMute", "payload": { "contextId": 9, "muted": true } }))
        .await;
    let reply = panel.recv().await;
    assert_eq!(reply["error"]["kind"], "NotFound");
    assert_eq!(reply["data"]["contextId"], 9);
}

#[tokio::test]
async fn test_subscriber_receives_active_set_changes() {
    let daemon = start(MemoryArea::new("sync")).await;
    let mut panel = LineClient::connect(&daemon.socket).await;
    panel.send(json!({ "kind": "Subscribe", "payload": {} })).await;
    assert_eq!(panel.recv().await["ok"], true);

    let mut agent = LineClient::connect(&daemon.socket).await;
    agent
        .send(json!({ "kind": "AgentHello", "payload": { "contextId": 3 } }))
        .await;
    agent.recv().await;
    // No valid origin, so no restore round trip.
    agent
        .send(json!({
            "kind": "ActivityReport",
            "payload": { "contextId": 3, "isActive": true, "url": "file:///tmp/a.ogg", "title": "Local" }
        }))
        .await;
    assert_eq!(agent.recv().await["ok"], true);

    let event = panel.recv().await;
    assert_eq!(event["kind"], "ActiveContextsChanged");
    assert_eq!(event["payload"]["contexts"][0]["contextId"], 3);
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let daemon = start(MemoryArea::new("sync")).await;
    let mut flooder = LineClient::connect(&daemon.socket).await;

    let flood = vec![b'x'; tabmix_ipc::MAX_FRAME_BYTES + 1];
    let _ = flooder.writer.write_all(&flood).await;
    let reply = flooder.recv().await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["kind"], "ValidationError");
    let next = tokio::time::timeout(Duration::from_secs(5), flooder.lines.next_line())
        .await
        .expect("connection left open");
    assert!(matches!(next, Ok(None) | Err(_)));

    // Other connections are unaffected.
    let mut panel = LineClient::connect(&daemon.socket).await;
    panel
        .send(json!({ "kind": "GetConfig", "payload": {}, "correlationId": "c" }))
        .await;
    assert_eq!(panel.recv().await["ok"], true);
}

#[tokio::test]
async fn test_second_hello_closes_previous_context() {
    let daemon = start(MemoryArea::new("sync")).await;
    let mut agent = LineClient::connect(&daemon.socket).await;
    agent
        .send(json!({ "kind": "AgentHello", "payload": { "contextId": 4 } }))
        .await;
    agent.recv().await;
    agent
        .send(json!({
            "kind": "ActivityReport",
            "payload": { "contextId": 4, "isActive": true, "url": "file:///tmp/a.ogg", "title": "A" }
        }))
        .await;
    assert_eq!(agent.recv().await["ok"], true);

    agent
        .send(json!({ "kind": "AgentHello", "payload": { "contextId": 5 } }))
        .await;
    assert_eq!(agent.recv().await["ok"], true);

    let state = |id: u32| {
        daemon.handle.request(tabmix_ipc::CommandEnvelope::new(
            "GetContextState",
            json!({ "contextId": id }),
        ))
    };
    let old = state(4).await.unwrap();
    assert!(!old.ok);
    assert_eq!(old.error.unwrap().kind, tabmix_ipc::ErrorKind::NotFound);
}
