//! End-to-end control-socket wire protocol: bind a real `CtrlSocket`,
//! connect a real `UnixStream` peer, and drive a handful of verbs over the
//! actual socket rather than through in-process unit fixtures (spec.md
//! §4.4, §6.1; Testable Property "S1 Dump handshake").

use nutdrv_core::ctrlsocket::{CtrlSocket, PeerEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn socket_path() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nutdrv-test.sock");
    std::mem::forget(dir); // keep the tempdir alive for the socket's lifetime
    path
}

#[tokio::test]
async fn dumpall_handshake_replies_with_stored_state_then_dumpdone() {
    let path = socket_path();
    let mut ctrlsocket = CtrlSocket::bind(&path).unwrap();

    let client = UnixStream::connect(&path).await.unwrap();
    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let event = ctrlsocket.next_event().await.unwrap();
    let PeerEvent::Connected { id, outbound_tx } = event else {
        panic!("expected Connected, got {event:?}");
    };
    ctrlsocket.register(id, outbound_tx);

    write_half.write_all(b"DUMPALL\n").await.unwrap();

    let event = ctrlsocket.next_event().await.unwrap();
    let PeerEvent::Line { line, .. } = event else {
        panic!("expected Line, got {event:?}");
    };
    assert_eq!(line, "DUMPALL");

    ctrlsocket
        .send_all(id, &["SETINFO ups.status \"OL\"".to_string(), "DUMPDONE".to_string()])
        .await
        .unwrap();

    let first = lines.next_line().await.unwrap().unwrap();
    let second = lines.next_line().await.unwrap().unwrap();
    assert_eq!(first, "SETINFO ups.status \"OL\"");
    assert_eq!(second, "DUMPDONE");
}

#[tokio::test]
async fn ping_over_the_real_socket_gets_pong() {
    let path = socket_path();
    let mut ctrlsocket = CtrlSocket::bind(&path).unwrap();

    let client = UnixStream::connect(&path).await.unwrap();
    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let event = ctrlsocket.next_event().await.unwrap();
    let PeerEvent::Connected { id, outbound_tx } = event else {
        panic!("expected Connected");
    };
    ctrlsocket.register(id, outbound_tx);

    write_half.write_all(b"PING\n").await.unwrap();
    let event = ctrlsocket.next_event().await.unwrap();
    assert!(matches!(event, PeerEvent::Line { line, .. } if line == "PING"));

    ctrlsocket.send_line(id, "PONG").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn closing_the_peer_is_observed_as_closed_event() {
    let path = socket_path();
    let mut ctrlsocket = CtrlSocket::bind(&path).unwrap();

    let client = UnixStream::connect(&path).await.unwrap();
    let event = ctrlsocket.next_event().await.unwrap();
    let PeerEvent::Connected { id, outbound_tx } = event else {
        panic!("expected Connected");
    };
    ctrlsocket.register(id, outbound_tx);

    drop(client);

    let event = ctrlsocket.next_event().await.unwrap();
    assert!(matches!(event, PeerEvent::Closed { id: closed_id } if closed_id == id));
}
