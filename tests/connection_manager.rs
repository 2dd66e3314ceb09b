//! Integration tests for the live stream connection
//!
//! The transport is in-memory (see `common::MockTransport`) and tokio time is
//! paused, so handshake timeouts and reconnect backoff run instantly and
//! deterministically.
//!
//! ```bash
//! cargo test --test connection_manager
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;

use speaking_test::audio::{AudioCapturePipeline, CaptureConfig};
use speaking_test::streaming::{
    ClientMessage, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionStatus, EventKind,
};

use common::{
    record_events, tone, wait_until, FakeMicrophone, MockTransport, ServerEnd, SESSION_ID,
    STREAM_TOKEN, USER_ID,
};

fn manager() -> (
    ConnectionManager,
    Arc<MockTransport>,
    tokio::sync::mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (transport, accepted) = MockTransport::new();
    let manager = ConnectionManager::new(ConnectionConfig::default(), transport.clone());
    (manager, transport, accepted)
}

/// Connect and complete the handshake; returns the server end
async fn connected(
    manager: &ConnectionManager,
    accepted: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEnd>,
) -> ServerEnd {
    let client = manager.clone();
    let connecting = tokio::spawn(async move { client.connect(SESSION_ID, STREAM_TOKEN).await });

    let mut server = accepted.recv().await.unwrap();
    server.authenticate(USER_ID).await;

    connecting.await.unwrap().unwrap();
    server
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test(start_paused = true)]
async fn handshake_sends_auth_and_authenticates() {
    let (manager, _transport, mut accepted) = manager();
    let events = record_events(
        &manager,
        &[EventKind::Connected, EventKind::Authenticated],
    );

    let client = manager.clone();
    let connecting = tokio::spawn(async move { client.connect(SESSION_ID, STREAM_TOKEN).await });

    let mut server = accepted.recv().await.unwrap();
    let auth = server.authenticate(USER_ID).await;
    assert_eq!(auth["token"], STREAM_TOKEN);
    assert_eq!(auth["session_id"], SESSION_ID);

    connecting.await.unwrap().unwrap();

    let state = manager.state();
    assert_eq!(state.status, ConnectionStatus::Authenticated);
    assert_eq!(state.session_id.as_deref(), Some(SESSION_ID));
    assert_eq!(state.user_id.as_deref(), Some(USER_ID));
    assert_eq!(state.reconnect_attempts, 0);

    assert_eq!(
        *events.lock(),
        vec![
            ConnectionEvent::Connected,
            ConnectionEvent::Authenticated {
                user_id: USER_ID.to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn auth_error_fails_connect() {
    let (manager, _transport, mut accepted) = manager();
    let errors = record_events(&manager, &[EventKind::Error]);

    let client = manager.clone();
    let connecting = tokio::spawn(async move { client.connect(SESSION_ID, "expired").await });

    let mut server = accepted.recv().await.unwrap();
    server.next_message().await.unwrap();
    server.reply(json!({"type": "auth_error", "message": "token expired"}));

    let result = connecting.await.unwrap();
    assert_eq!(
        result,
        Err(ConnectionError::AuthFailed("token expired".to_string()))
    );
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        *errors.lock(),
        vec![ConnectionEvent::Error {
            message: "token expired".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_without_reconnecting() {
    let (manager, transport, mut accepted) = manager();

    let client = manager.clone();
    let connecting = tokio::spawn(async move { client.connect(SESSION_ID, STREAM_TOKEN).await });

    // Read the auth message but never answer
    let mut server = accepted.recv().await.unwrap();
    server.next_message().await.unwrap();

    let started = tokio::time::Instant::now();
    let result = connecting.await.unwrap();
    assert_eq!(result, Err(ConnectionError::AuthTimeout));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);

    // The stream was closed and no retry follows a failed initial connect
    assert!(server.next_raw().await.is_none());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_reports_failure() {
    let (manager, transport, _accepted) = manager();
    transport.refuse_connections(true);

    let result = manager.connect(SESSION_ID, STREAM_TOKEN).await;

    assert!(matches!(result, Err(ConnectionError::ConnectionFailed(_))));
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn endpoint_change_applies_to_next_connect() {
    let (manager, transport, mut accepted) = manager();
    manager.set_endpoint("wss://stream.example.com/ws");

    let _server = connected(&manager, &mut accepted).await;

    assert_eq!(transport.urls(), vec!["wss://stream.example.com/ws"]);
}

// ============================================================================
// Sending and receiving
// ============================================================================

#[tokio::test(start_paused = true)]
async fn send_requires_authentication() {
    let (manager, _transport, mut accepted) = manager();
    let message = ClientMessage::audio_chunk(0, &[1, 2, 3, 4], 1_700_000_000_000);

    assert!(!manager.send(&message));

    let mut server = connected(&manager, &mut accepted).await;
    assert!(manager.send(&message));

    let received = server.next_message().await.unwrap();
    assert_eq!(received["type"], "audio_chunk");
    assert_eq!(received["data"]["chunk_id"], 0);
    assert_eq!(received["data"]["audio_buffer"], STANDARD.encode([1u8, 2, 3, 4]));

    manager.disconnect();
    assert!(!manager.send(&message));
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_subscribers() {
    let (manager, _transport, mut accepted) = manager();
    let events = record_events(
        &manager,
        &[
            EventKind::Transcription,
            EventKind::AiResponse,
            EventKind::Message,
            EventKind::ParseError,
        ],
    );
    let server = connected(&manager, &mut accepted).await;

    server.reply(json!({"type": "transcription", "data": {"text": "Hello", "is_final": true}}));
    server.reply(json!({"type": "ai_response", "data": {"text": "Go on."}}));
    server.reply(json!({"type": "grammar_hint", "data": {"word": "fewer"}}));
    let _ = server
        .to_client
        .send(speaking_test::streaming::InboundFrame::Text("{oops".to_string()));

    wait_until(|| events.lock().len() == 4).await;

    let events = events.lock();
    assert!(matches!(&events[0], ConnectionEvent::Transcription(t) if t.text == "Hello" && t.is_final));
    assert!(matches!(&events[1], ConnectionEvent::AiResponse(r) if r.text == "Go on."));
    assert!(matches!(&events[2], ConnectionEvent::Message(v) if v["type"] == "grammar_hint"));
    assert!(matches!(&events[3], ConnectionEvent::ParseError { raw, .. } if raw == "{oops"));
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_handler_stops_receiving() {
    let (manager, _transport, mut accepted) = manager();
    let seen = Arc::new(parking_lot::Mutex::new(0u32));
    let counter = seen.clone();
    let id = manager.on(
        EventKind::AiResponse,
        Arc::new(move |_: &ConnectionEvent| *counter.lock() += 1),
    );
    let witness = record_events(&manager, &[EventKind::AiResponse]);
    let server = connected(&manager, &mut accepted).await;

    server.reply(json!({"type": "ai_response", "data": {"text": "one"}}));
    wait_until(|| witness.lock().len() == 1).await;

    assert!(manager.off(id));
    server.reply(json!({"type": "ai_response", "data": {"text": "two"}}));
    wait_until(|| witness.lock().len() == 2).await;

    assert_eq!(*seen.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_and_records_pong() {
    let (manager, _transport, mut accepted) = manager();
    let acks = record_events(&manager, &[EventKind::HeartbeatAck]);
    let mut server = connected(&manager, &mut accepted).await;

    let started = tokio::time::Instant::now();
    let ping = server.next_raw().await.unwrap();
    assert_eq!(ping["type"], "ping");
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert!(manager.state().last_heartbeat_at.is_none());

    server.reply(json!({"type": "pong"}));
    wait_until(|| acks.lock().len() == 1).await;

    assert!(manager.state().last_heartbeat_at.is_some());
}

// ============================================================================
// Disconnects and reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn clean_close_does_not_reconnect() {
    let (manager, transport, mut accepted) = manager();
    let events = record_events(&manager, &[EventKind::Disconnected]);
    let server = connected(&manager, &mut accepted).await;

    server.close(true);
    wait_until(|| !events.lock().is_empty()).await;

    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        events.lock()[0],
        ConnectionEvent::Disconnected { clean: true, .. }
    ));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_is_clean_and_final() {
    let (manager, transport, mut accepted) = manager();
    let events = record_events(&manager, &[EventKind::Disconnected]);
    let mut server = connected(&manager, &mut accepted).await;

    manager.disconnect();

    assert_eq!(manager.state(), Default::default());
    assert!(server.next_raw().await.is_none());
    assert_eq!(
        *events.lock(),
        vec![ConnectionEvent::Disconnected {
            clean: true,
            reason: Some("client disconnect".to_string())
        }]
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_reconnects_and_reauthenticates() {
    let (manager, transport, mut accepted) = manager();
    let auths = record_events(&manager, &[EventKind::Authenticated]);
    let first = connected(&manager, &mut accepted).await;

    first.close(false);
    wait_until(|| manager.status() == ConnectionStatus::Reconnecting).await;
    assert_eq!(manager.state().reconnect_attempts, 1);

    let mut second = accepted.recv().await.unwrap();
    let auth = second.authenticate(USER_ID).await;
    assert_eq!(auth["token"], STREAM_TOKEN);
    assert_eq!(auth["session_id"], SESSION_ID);

    wait_until(|| manager.is_authenticated()).await;
    assert_eq!(manager.state().reconnect_attempts, 0);
    assert_eq!(transport.open_count(), 2);
    assert_eq!(auths.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_then_gives_up_once() {
    let (manager, transport, mut accepted) = manager();
    let failures = record_events(&manager, &[EventKind::ReconnectionFailed]);
    let server = connected(&manager, &mut accepted).await;

    transport.refuse_connections(true);
    let cut_at = tokio::time::Instant::now();
    server.close(false);

    tokio::time::sleep(Duration::from_secs(120)).await;

    // One initial connect plus five reconnect attempts
    let opens = transport.open_times();
    assert_eq!(opens.len(), 6);

    let mut previous = cut_at;
    let mut gaps = Vec::new();
    for at in &opens[1..] {
        gaps.push(*at - previous);
        previous = *at;
    }
    assert_eq!(
        gaps,
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );

    assert_eq!(manager.status(), ConnectionStatus::Failed);
    assert_eq!(
        *failures.lock(),
        vec![ConnectionEvent::ReconnectionFailed { attempts: 5 }]
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.open_count(), 6);
    assert_eq!(failures.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_connect_supersedes_pending_reconnect() {
    let (manager, transport, mut accepted) = manager();
    let first = connected(&manager, &mut accepted).await;

    first.close(false);
    wait_until(|| manager.status() == ConnectionStatus::Reconnecting).await;

    // A fresh connect before the backoff timer fires
    let _second = connected(&manager, &mut accepted).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(manager.is_authenticated());
    assert_eq!(transport.open_count(), 2);
}

// ============================================================================
// Audio chunks over the stream
// ============================================================================

#[tokio::test(start_paused = true)]
async fn chunks_arrive_in_capture_order() {
    let (manager, _transport, mut accepted) = manager();
    let mut server = connected(&manager, &mut accepted).await;

    let (mic, feed) = FakeMicrophone::new(0);
    let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));
    pipeline.set_connection(Some(manager.clone()));
    pipeline.initialize().unwrap();
    pipeline.start_recording().await.unwrap();

    for _ in 0..5 {
        feed.push(tone(16000));
    }
    let captured = pipeline.stop_recording().await.unwrap();

    assert_eq!(captured.stats.chunks, 5);
    assert_eq!(captured.stats.sent, 5);
    assert_eq!(captured.stats.dropped, 0);

    for expected in 0..5u64 {
        let message = server.next_message().await.unwrap();
        assert_eq!(message["type"], "audio_chunk");
        assert_eq!(message["data"]["chunk_id"], expected);

        let payload = STANDARD
            .decode(message["data"]["audio_buffer"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), 32000);
    }
}

#[tokio::test(start_paused = true)]
async fn chunks_buffered_across_reconnect_are_flushed_in_order() {
    let (manager, _transport, mut accepted) = manager();
    let first = connected(&manager, &mut accepted).await;

    let (mic, feed) = FakeMicrophone::new(0);
    let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));
    pipeline.set_connection(Some(manager.clone()));
    pipeline.initialize().unwrap();
    pipeline.start_recording().await.unwrap();

    first.close(false);
    wait_until(|| manager.status() == ConnectionStatus::Reconnecting).await;

    feed.push(tone(16000));
    feed.push(tone(16000));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = accepted.recv().await.unwrap();
    second.authenticate(USER_ID).await;
    wait_until(|| manager.is_authenticated()).await;

    feed.push(tone(16000));
    let captured = pipeline.stop_recording().await.unwrap();

    assert_eq!(captured.stats.buffered, 2);
    assert_eq!(captured.stats.sent, 3);
    assert_eq!(captured.stats.dropped, 0);

    for expected in 0..3u64 {
        let message = second.next_message().await.unwrap();
        assert_eq!(message["data"]["chunk_id"], expected);
    }
}

#[tokio::test(start_paused = true)]
async fn chunks_dropped_while_disconnected() {
    let (manager, _transport, _accepted) = manager();

    let (mic, feed) = FakeMicrophone::new(0);
    let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));
    pipeline.set_connection(Some(manager.clone()));
    pipeline.initialize().unwrap();
    pipeline.start_recording().await.unwrap();

    feed.push(tone(16000));
    let captured = pipeline.stop_recording().await.unwrap();

    assert_eq!(captured.stats.sent, 0);
    assert_eq!(captured.stats.dropped, 1);
    assert_eq!(captured.samples.len(), 16000);
}

#[tokio::test(start_paused = true)]
async fn rebinding_mid_recording_applies_from_next_chunk() {
    let (first, _first_transport, mut first_accepted) = manager();
    let (second, _second_transport, mut second_accepted) = manager();
    let mut first_server = connected(&first, &mut first_accepted).await;
    let mut second_server = connected(&second, &mut second_accepted).await;

    let (mic, feed) = FakeMicrophone::new(0);
    let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));
    pipeline.set_connection(Some(first.clone()));
    pipeline.initialize().unwrap();
    pipeline.start_recording().await.unwrap();

    feed.push(tone(16000));
    let message = first_server.next_message().await.unwrap();
    assert_eq!(message["data"]["chunk_id"], 0);

    pipeline.set_connection(Some(second.clone()));
    feed.push(tone(16000));
    let message = second_server.next_message().await.unwrap();
    assert_eq!(message["data"]["chunk_id"], 1);

    // Unbound: the next chunk is recorded but not sent anywhere
    pipeline.set_connection(None);
    feed.push(tone(16000));
    let captured = pipeline.stop_recording().await.unwrap();

    assert_eq!(captured.stats.chunks, 3);
    assert_eq!(captured.stats.sent, 2);
    assert_eq!(captured.stats.dropped, 1);
    assert_eq!(captured.samples.len(), 48000);

    let quiet = Duration::from_secs(1);
    assert!(tokio::time::timeout(quiet, first_server.next_message()).await.is_err());
    assert!(tokio::time::timeout(quiet, second_server.next_message()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn backlog_is_flushed_at_stop_once_reauthenticated() {
    let (manager, _transport, mut accepted) = manager();
    let first = connected(&manager, &mut accepted).await;

    let (mic, feed) = FakeMicrophone::new(0);
    let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));
    pipeline.set_connection(Some(manager.clone()));
    pipeline.initialize().unwrap();
    pipeline.start_recording().await.unwrap();

    first.close(false);
    wait_until(|| manager.status() == ConnectionStatus::Reconnecting).await;

    feed.push(tone(16000));
    feed.push(tone(16000));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = accepted.recv().await.unwrap();
    second.authenticate(USER_ID).await;
    wait_until(|| manager.is_authenticated()).await;

    // No further audio: the backlog only goes out when recording stops
    let captured = pipeline.stop_recording().await.unwrap();

    assert_eq!(captured.stats.buffered, 2);
    assert_eq!(captured.stats.sent, 2);
    assert_eq!(captured.stats.dropped, 0);

    for expected in 0..2u64 {
        let message = second.next_message().await.unwrap();
        assert_eq!(message["data"]["chunk_id"], expected);
    }
}
