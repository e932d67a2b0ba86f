//! Answers whose audio is fetched from a URL instead of streamed

mod common;

use common::{server_config, wait_for, FakeTokens, Harness};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const SHORT: Duration = Duration::from_secs(5);

/// Serve `body` to the first HTTP request on a loopback port
async fn serve_once(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    format!("http://{}/answer.pcm", addr)
}

fn url_harness() -> Harness {
    let mut server = server_config();
    server.url_tts = true;
    Harness::with_server(server, FakeTokens::ok("tok-1"))
}

#[tokio::test]
async fn fetched_audio_replaces_streamed_audio() {
    let body = vec![10, 20, 30, 40, 50, 60, 70, 80];
    let url = serve_once(body.clone()).await;
    let h = url_harness();
    let session = &h.session;

    session
        .handle_inbound_action(&json!({"action": "text", "speech": "Here", "voice": url}).to_string())
        .await;
    session
        .handle_inbound_action(&json!({"action": "audio_start", "id": "U1"}).to_string())
        .await;
    session
        .handle_inbound_action(
            &json!({"action": "audio_data", "id": "U1", "data": {"data": [1, 1, 1, 1]}}).to_string(),
        )
        .await;
    assert_eq!(session.playback().counters().0, 0);

    session
        .handle_inbound_action(&json!({"action": "audio_end", "id": "U1"}).to_string())
        .await;

    assert!(wait_for(SHORT, || session.current_turn().is_none()).await);
    assert_eq!(h.devices.written(), body);
    assert!(session.wake_gate().is_allowed());
}

#[tokio::test]
async fn voice_url_is_ignored_without_url_tts() {
    let h = Harness::new(FakeTokens::ok("tok-1"));
    let session = &h.session;

    session
        .handle_inbound_action(
            &json!({"action": "text", "speech": "Here", "voice": "http://127.0.0.1:9/never"}).to_string(),
        )
        .await;
    session
        .handle_inbound_action(&json!({"action": "audio_start", "id": "S1"}).to_string())
        .await;
    session
        .handle_inbound_action(
            &json!({"action": "audio_data", "id": "S1", "data": {"data": [1, 2, 3, 4]}}).to_string(),
        )
        .await;
    session
        .handle_inbound_action(&json!({"action": "audio_end", "id": "S1"}).to_string())
        .await;

    assert!(wait_for(SHORT, || session.current_turn().is_none()).await);
    assert_eq!(h.devices.written(), vec![1, 2, 3, 4]);
}
