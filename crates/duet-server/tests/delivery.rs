//! End-to-end delivery through the router and live sessions.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use duet_core::{PresenceStatus, RoomId, StreamEvent, UserId};
use duet_server::{build_router, AppState, DuetApp, SendMessage};
use duet_settings::DuetSettings;
use futures::StreamExt;
use serde_json::json;
use tower::ServiceExt;

fn settings() -> DuetSettings {
    let mut settings = DuetSettings::default();
    // Long enough that only the push path can deliver inside a test window.
    settings.delivery.cycle_interval_ms = 60_000;
    settings.delivery.connect_cooldown_ms = 0;
    settings
}

fn room() -> RoomId {
    RoomId::from("private")
}

fn text(t: &str) -> SendMessage {
    SendMessage {
        text: t.into(),
        ..SendMessage::default()
    }
}

async fn next_event(
    rx: &mut tokio::sync::mpsc::Receiver<StreamEvent>,
    pred: impl Fn(&StreamEvent) -> bool,
    within: Duration,
) -> Option<StreamEvent> {
    tokio::time::timeout(within, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test(start_paused = true)]
async fn pushed_message_arrives_before_next_cycle() {
    let app = DuetApp::from_settings(settings()).unwrap();
    let mut alice = app.sessions.open(room(), UserId::from("alice"), 0).unwrap();
    let _ = next_event(
        &mut alice.events,
        |e| matches!(e, StreamEvent::Presence { .. }),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let sent = app
        .service
        .send(&room(), &UserId::from("bob"), text("ping"))
        .await
        .unwrap()
        .into_message();
    assert!(sent.delivered_direct);

    let got = next_event(
        &mut alice.events,
        |e| matches!(e, StreamEvent::Messages { .. }),
        Duration::from_secs(1),
    )
    .await
    .expect("message should be pushed");
    assert_eq!(got, StreamEvent::Messages { messages: vec![sent] });

    app.shutdown(Vec::new()).await;
}

#[tokio::test(start_paused = true)]
async fn each_message_is_delivered_once() {
    let app = DuetApp::from_settings(DuetSettings::default()).unwrap();
    let mut alice = app.sessions.open(room(), UserId::from("alice"), 0).unwrap();
    let bob = UserId::from("bob");
    for i in 0..5 {
        let _ = app.service.send(&room(), &bob, text(&format!("m{i}"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let mut seen = Vec::new();
    let mut last = i64::MIN;
    while let Some(StreamEvent::Messages { messages }) = next_event(
        &mut alice.events,
        |e| matches!(e, StreamEvent::Messages { .. }),
        Duration::from_secs(5),
    )
    .await
    {
        for m in messages {
            assert!(m.timestamp > last, "watermark went backwards");
            last = m.timestamp;
            seen.push(m.text);
        }
    }
    assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);

    app.shutdown(Vec::new()).await;
}

#[tokio::test(start_paused = true)]
async fn closing_a_session_shows_offline_to_the_peer() {
    let app = DuetApp::from_settings(settings()).unwrap();
    let mut bob = app.sessions.open(room(), UserId::from("bob"), 0).unwrap();
    let alice = app.sessions.open(room(), UserId::from("alice"), 0).unwrap();
    let _ = next_event(
        &mut bob.events,
        |e| matches!(e, StreamEvent::Presence { users } if users.get(&UserId::from("alice")).is_some_and(|r| r.is_online())),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    assert!(app.sessions.close(&alice.session_id));
    let offline = next_event(
        &mut bob.events,
        |e| matches!(e, StreamEvent::Presence { users } if users.get(&UserId::from("alice")).is_some_and(|r| r.status == PresenceStatus::Offline)),
        Duration::from_secs(1),
    )
    .await;
    assert!(offline.is_some());

    app.shutdown(Vec::new()).await;
}

#[tokio::test(start_paused = true)]
async fn sse_stream_carries_named_events() {
    let app = DuetApp::from_settings(settings()).unwrap();
    let router = build_router(AppState::new(&app, None));

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/rooms/private/stream?since=0")
                .header("x-duet-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body().into_data_stream();

    let post = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/rooms/private/messages")
                .header("x-duet-user", "bob")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "text": "over sse" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(post.status(), StatusCode::CREATED);

    let mut raw = String::new();
    let found = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(chunk)) = body.next().await {
            raw.push_str(&String::from_utf8_lossy(&chunk));
            if raw.contains("event: messages") && raw.contains("over sse") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "stream so far: {raw}");
    assert!(raw.contains("event: connected"));

    drop(body);
    app.shutdown(Vec::new()).await;
}

#[tokio::test]
async fn retention_keeps_newest_thousand() {
    let app = DuetApp::from_settings(DuetSettings::default()).unwrap();
    let alice = UserId::from("alice");
    for i in 0..1_001 {
        let _ = app.service.send(&room(), &alice, text(&format!("n{i}"))).await.unwrap();
    }
    let all = app.service.store().all(&room()).await.unwrap();
    assert_eq!(all.len(), 1_000);
    assert_eq!(all[0].text, "n1");
    app.shutdown(Vec::new()).await;
}
