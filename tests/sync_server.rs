use colabri_sync::db::{FileUpdateStoreProvider, FsContentStore};
use colabri_sync::models::messages::{sync_frame, SyncStep, RENAME_ACK, RENAME_SESSION, SYNC};
use colabri_sync::models::{Document, Source};
use colabri_sync::routes::create_app;
use colabri_sync::ws::{HubSettings, SyncHub};
use colabri_sync::AppState;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NOTEBOOK_ROOM: &str = "json:notebook:/nb.ipynb";

async fn start_server(root: &Path) -> (SocketAddr, Arc<SyncHub>) {
    start_server_with(root, false).await
}

async fn start_server_with(root: &Path, file_watch: bool) -> (SocketAddr, Arc<SyncHub>) {
    let settings = HubSettings {
        cleanup_delay: Duration::from_secs(60),
        save_delay: Duration::from_millis(100),
        poll_interval: Duration::ZERO,
        file_watch,
    };
    let hub = Arc::new(SyncHub::new(
        Arc::new(FsContentStore::new(root)),
        Arc::new(FileUpdateStoreProvider::new(root)),
        settings,
    ));
    let app = create_app(AppState::new(hub.clone(), None), None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

async fn open(addr: SocketAddr, room: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/api/yjs/{}", addr, room))
        .await
        .expect("websocket handshake");
    socket
}

async fn send(socket: &mut Socket, frame: Vec<u8>) {
    socket.send(Message::Binary(frame.into())).await.unwrap();
}

async fn recv(socket: &mut Socket) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Binary(data) = message {
            return data.to_vec();
        }
    }
}

async fn recv_sync(socket: &mut Socket, step: SyncStep) -> Vec<u8> {
    loop {
        let frame = recv(socket).await;
        if frame.len() >= 2 && frame[0] == SYNC && frame[1] == step.as_byte() {
            return frame[2..].to_vec();
        }
    }
}

async fn join(socket: &mut Socket) -> Document {
    let replica = Document::for_type("notebook");
    recv_sync(socket, SyncStep::Step1).await;
    send(socket, sync_frame(SyncStep::Step1, &replica.version())).await;
    replica
        .import_history(&recv_sync(socket, SyncStep::Step2).await)
        .unwrap();
    replica
}

fn notebook(source: &str) -> Value {
    json!({
        "cells": [{
            "cell_type": "code",
            "id": "c1",
            "metadata": {},
            "source": source,
            "outputs": [],
            "execution_count": null
        }],
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5
    })
}

#[tokio::test]
async fn edits_relay_between_clients_and_reach_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("nb.ipynb"), notebook("print(1)").to_string()).unwrap();
    let (addr, _hub) = start_server(dir.path()).await;

    let mut alice = open(addr, NOTEBOOK_ROOM).await;
    let alice_doc = join(&mut alice).await;
    assert_eq!(alice_doc.source().as_json().unwrap()["cells"][0]["source"], json!("print(1)"));

    let mut bob = open(addr, NOTEBOOK_ROOM).await;
    let bob_doc = join(&mut bob).await;
    // Bob's handshake request reaches Alice.
    recv_sync(&mut alice, SyncStep::Step1).await;

    let edit = sync_frame(
        SyncStep::Update,
        &alice_doc.set_source(&Source::Json(notebook("print(2)"))).unwrap(),
    );
    send(&mut alice, edit.clone()).await;
    assert_eq!(recv(&mut bob).await, edit);
    bob_doc.import_history(&edit[2..]).unwrap();
    assert_eq!(bob_doc.source().as_json().unwrap()["cells"][0]["source"], json!("print(2)"));

    let mut saved = Value::Null;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let raw = std::fs::read_to_string(dir.path().join("nb.ipynb")).unwrap();
        saved = serde_json::from_str(&raw).unwrap();
        if saved["cells"][0]["source"] == json!("print(2)") {
            break;
        }
    }
    assert_eq!(saved["cells"][0]["source"], json!("print(2)"));
    assert!(dir.path().join(".notebook:nb.ipynb.y").exists());
}

#[tokio::test]
async fn rename_is_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("nb.ipynb"), notebook("x = 1").to_string()).unwrap();
    let (addr, hub) = start_server(dir.path()).await;

    let mut client = open(addr, NOTEBOOK_ROOM).await;
    join(&mut client).await;

    let mut rename = vec![RENAME_SESSION];
    rename.extend_from_slice(b"json:notebook:/moved.ipynb");
    send(&mut client, rename).await;
    assert_eq!(recv(&mut client).await, RENAME_ACK.to_vec());

    assert!(hub.registry.get(NOTEBOOK_ROOM).is_none());
    assert!(hub.registry.get("json:notebook:/moved.ipynb").is_some());
}

#[tokio::test]
async fn awareness_is_relayed_in_transient_rooms() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, hub) = start_server(dir.path()).await;

    let mut a = open(addr, "awareness-room").await;
    let mut b = open(addr, "awareness-room").await;
    for _ in 0..100 {
        if hub.registry.get("awareness-room").map(|r| r.client_count()) == Some(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    send(&mut a, vec![1, 10, 20, 30]).await;
    assert_eq!(recv(&mut b).await, vec![1, 10, 20, 30]);
}

#[cfg(feature = "watch-notify")]
#[tokio::test]
async fn file_events_bring_external_edits_to_clients() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("nb.ipynb");
    std::fs::write(&file, notebook("before").to_string()).unwrap();
    let (addr, hub) = start_server_with(dir.path(), true).await;

    let mut client = open(addr, NOTEBOOK_ROOM).await;
    let replica = join(&mut client).await;
    assert!(hub.registry.get(NOTEBOOK_ROOM).unwrap().as_document().unwrap().is_ready());
    // Give the watcher time to register, and the new file a distinct mtime.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Replace the file the way editors do, through a rename.
    let staged = dir.path().join("nb.ipynb.tmp");
    std::fs::write(&staged, notebook("after").to_string()).unwrap();
    std::fs::rename(&staged, &file).unwrap();

    let cell_source = |doc: &Document| doc.source().as_json().unwrap()["cells"][0]["source"].clone();
    while cell_source(&replica) != json!("after") {
        let update = recv_sync(&mut client, SyncStep::Update).await;
        replica.import_history(&update).unwrap();
    }
    let server = hub.registry.get(NOTEBOOK_ROOM).unwrap();
    assert_eq!(
        cell_source(server.as_document().unwrap().document.as_ref()),
        json!("after")
    );
}
