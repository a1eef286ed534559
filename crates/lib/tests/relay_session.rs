//! End-to-end relay session tests against an in-process fake Direct Line
//! service and a recording channel sink. Covers session start, watermark
//! threading, bot-identity filtering, idle/max-duration timeouts, failure
//! notices, supersession, and inbound forwarding.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use lib::activity::Activity;
use lib::channel::{ChannelSink, RoutingRef, SinkError};
use lib::directline::DirectLineClient;
use lib::relay::{SessionSettings, Supervisor};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- fake Direct Line service ---------------------------------------------

enum FetchStep {
    /// Full response body for one GET activities call.
    Page(Value),
    /// Respond with this HTTP status.
    Fail(u16),
}

struct FakeDirectLine {
    created: Mutex<usize>,
    /// (conversation id, posted activity)
    posted: Mutex<Vec<(String, Value)>>,
    /// (conversation id, watermark query param)
    fetches: Mutex<Vec<(String, String)>>,
    /// Scripted fetch responses; once drained, empty pages echoing the
    /// received watermark.
    script: Mutex<VecDeque<FetchStep>>,
    post_status: AtomicU16,
}

impl Default for FakeDirectLine {
    fn default() -> Self {
        Self {
            created: Mutex::new(0),
            posted: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            post_status: AtomicU16::new(200),
        }
    }
}

impl FakeDirectLine {
    fn created_count(&self) -> usize {
        *self.created.lock().unwrap()
    }

    fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    fn fetches(&self) -> Vec<(String, String)> {
        self.fetches.lock().unwrap().clone()
    }

    fn posted(&self) -> Vec<(String, Value)> {
        self.posted.lock().unwrap().clone()
    }

    fn push_page(&self, body: Value) {
        self.script.lock().unwrap().push_back(FetchStep::Page(body));
    }

    fn push_failure(&self, status: u16) {
        self.script.lock().unwrap().push_back(FetchStep::Fail(status));
    }
}

async fn create_conversation(State(state): State<Arc<FakeDirectLine>>) -> (StatusCode, Json<Value>) {
    *state.created.lock().unwrap() += 1;
    (StatusCode::OK, Json(json!({ "conversationId": "service-conv" })))
}

async fn post_conversation_activity(
    State(state): State<Arc<FakeDirectLine>>,
    Path(conversation_id): Path<String>,
    Json(activity): Json<Value>,
) -> StatusCode {
    state.posted.lock().unwrap().push((conversation_id, activity));
    StatusCode::from_u16(state.post_status.load(Ordering::SeqCst)).expect("post status")
}

async fn get_conversation_activities(
    State(state): State<Arc<FakeDirectLine>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let watermark = params.get("watermark").cloned().unwrap_or_default();
    state
        .fetches
        .lock()
        .unwrap()
        .push((conversation_id, watermark.clone()));
    match state.script.lock().unwrap().pop_front() {
        Some(FetchStep::Page(body)) => (StatusCode::OK, Json(body)),
        Some(FetchStep::Fail(status)) => (
            StatusCode::from_u16(status).expect("scripted status"),
            Json(json!({})),
        ),
        None => (
            StatusCode::OK,
            Json(json!({ "activities": [], "watermark": watermark })),
        ),
    }
}

async fn spawn_fake_directline(state: Arc<FakeDirectLine>) -> String {
    let app = Router::new()
        .route("/conversations", post(create_conversation))
        .route(
            "/conversations/:id/activities",
            post(post_conversation_activity).get(get_conversation_activities),
        )
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake service");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

// --- recording sink --------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    deliveries: Mutex<Vec<(RoutingRef, Vec<Activity>)>>,
}

#[async_trait]
impl ChannelSink for RecordingSink {
    async fn send_activities(
        &self,
        reference: &RoutingRef,
        activities: Vec<Activity>,
    ) -> Result<(), SinkError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((reference.clone(), activities));
        Ok(())
    }
}

impl RecordingSink {
    fn texts(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, batch)| batch.iter())
            .filter_map(|activity| activity.text.clone())
            .collect()
    }

    fn delivered(&self) -> Vec<Activity> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect()
    }

    fn cards(&self) -> Vec<Value> {
        self.delivered()
            .into_iter()
            .filter_map(|activity| activity.attachments)
            .flatten()
            .collect()
    }

    fn has_text(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }
}

// --- helpers ----------------------------------------------------------------

fn make_token(bot: &str, conv: &str) -> String {
    let segment = |value: &Value| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(value).expect("segment json"))
    };
    format!(
        "{}.{}.test-signature",
        segment(&json!({ "alg": "RS256", "typ": "JWT" })),
        segment(&json!({ "bot": bot, "conv": conv }))
    )
}

fn inbound(value: Value) -> Activity {
    serde_json::from_value(value).expect("inbound activity")
}

fn base_inbound(kind: &str) -> Value {
    json!({
        "type": kind,
        "channelId": "emulator",
        "serviceUrl": "http://127.0.0.1:1/channel",
        "conversation": { "id": "emu-1" },
        "from": { "id": "user-1" },
        "recipient": { "id": "bot-local" }
    })
}

fn message(text: &str) -> Activity {
    let mut value = base_inbound("message");
    value["text"] = json!(text);
    inbound(value)
}

fn members_added(ids: &[&str]) -> Activity {
    let mut value = base_inbound("conversationUpdate");
    value["membersAdded"] = json!(ids
        .iter()
        .map(|id| json!({ "id": id }))
        .collect::<Vec<_>>());
    inbound(value)
}

fn end_of_conversation() -> Activity {
    inbound(base_inbound("endOfConversation"))
}

fn card_submission(token: &str) -> Activity {
    let mut value = base_inbound("message");
    value["value"] = json!({ "id": "StartConversation", "token": token });
    inbound(value)
}

struct Harness {
    service: Arc<FakeDirectLine>,
    sink: Arc<RecordingSink>,
    supervisor: Supervisor,
}

async fn harness(settings: SessionSettings) -> Harness {
    let service = Arc::new(FakeDirectLine::default());
    let base_url = spawn_fake_directline(Arc::clone(&service)).await;
    let sink = Arc::new(RecordingSink::default());
    let supervisor = Supervisor::new(
        DirectLineClient::new(Some(base_url)),
        Arc::clone(&sink) as Arc<dyn ChannelSink>,
        settings,
        None,
    );
    Harness {
        service,
        sink,
        supervisor,
    }
}

fn fast_settings() -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(10),
        idle_timeout: Duration::from_secs(2),
        max_duration: Duration::from_secs(10),
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

const WAIT: Duration = Duration::from_secs(2);

// --- tests -------------------------------------------------------------------

#[tokio::test]
async fn token_message_starts_session_and_relays_bot_output() {
    let h = harness(fast_settings()).await;
    h.service.push_page(json!({
        "activities": [
            {
                "type": "message",
                "id": "remote-1",
                "timestamp": "2024-05-01T12:00:00Z",
                "channelId": "directline",
                "conversation": { "id": "C1" },
                "from": { "id": "B1" },
                "text": "hi"
            },
            {
                "type": "message",
                "from": { "id": "user-remote", "role": "user" },
                "text": "echo of my own message"
            }
        ],
        "watermark": "5"
    }));

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("hi")).await,
        "bot output was not relayed; notices: {:?}",
        h.sink.texts()
    );
    assert!(h.sink.has_text("Relay started for conversation ID \"C1\"."));
    assert_eq!(h.supervisor.active_conversation_id().await.as_deref(), Some("C1"));

    // Only the bot-originated activity crosses outward, sanitized.
    assert!(!h.sink.has_text("echo of my own message"));
    let relayed = h
        .sink
        .delivered()
        .into_iter()
        .find(|a| a.text.as_deref() == Some("hi"))
        .expect("relayed activity");
    assert!(relayed.channel_id.is_none());
    assert!(relayed.conversation.is_none());
    assert!(relayed.id.is_none());
    assert!(relayed.service_url.is_none());
    assert!(relayed.timestamp.is_none());

    // Fetch N+1 carries the watermark returned by fetch N.
    assert!(wait_until(WAIT, || h.service.fetch_count() >= 2).await);
    let fetches = h.service.fetches();
    assert_eq!(fetches[0], ("C1".to_string(), String::new()));
    assert_eq!(fetches[1], ("C1".to_string(), "5".to_string()));

    h.supervisor.end_session().await;
    assert!(h.sink.has_text("Conversation is closed."));
}

#[tokio::test]
async fn fetch_failure_ends_session_with_error_then_closing_notice() {
    let h = harness(fast_settings()).await;
    h.service.push_failure(503);

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("Conversation is closed.")).await,
        "session did not close; notices: {:?}",
        h.sink.texts()
    );
    let texts = h.sink.texts();
    let error_at = texts
        .iter()
        .position(|t| t.starts_with("Failed to relay message.") && t.contains("503"))
        .expect("error notice naming the status");
    let closed_at = texts
        .iter()
        .position(|t| t == "Conversation is closed.")
        .expect("closing notice");
    assert!(error_at < closed_at, "error notice must precede the close");

    // The poll loop is dead: no further fetches.
    let fetched = h.service.fetch_count();
    assert_eq!(fetched, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.fetch_count(), fetched);
}

#[tokio::test]
async fn idle_timeout_closes_quiet_session() {
    let mut settings = fast_settings();
    settings.idle_timeout = Duration::from_millis(50);
    let h = harness(settings).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("Conversation is closed.")).await,
        "session did not close; notices: {:?}",
        h.sink.texts()
    );
    assert!(h.sink.has_text("Idle timeout."));
    assert!(!h.sink.has_text("Maximum duration exceeded."));
    assert!(!h.sink.has_text("Failed to relay message."));

    let fetched = h.service.fetch_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.fetch_count(), fetched);
}

#[tokio::test]
async fn deliveries_keep_resetting_idle_timer() {
    let mut settings = fast_settings();
    settings.idle_timeout = Duration::from_millis(400);
    let h = harness(settings).await;
    // Script far more polling time than one idle period's worth of pages,
    // each page carrying bot output.
    for n in 0..60 {
        h.service.push_page(json!({
            "activities": [
                { "type": "message", "from": { "id": "B1" }, "text": format!("tick-{}", n) }
            ],
            "watermark": n.to_string()
        }));
    }

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;

    // tick-50 arrives well past the idle duration; the session only gets
    // there because every non-empty delivery reset the clock.
    assert!(
        wait_until(WAIT, || h.sink.has_text("tick-50")).await,
        "deliveries stopped early; notices: {:?}",
        h.sink.texts()
    );
    assert!(!h.sink.has_text("Idle timeout."));

    // Once the scripted output dries up, the idle path closes the session.
    assert!(wait_until(WAIT, || h.sink.has_text("Idle timeout.")).await);
    assert!(wait_until(WAIT, || h.sink.has_text("Conversation is closed.")).await);
}

#[tokio::test]
async fn max_duration_ends_with_clean_notice() {
    let mut settings = fast_settings();
    settings.idle_timeout = Duration::from_secs(10);
    settings.max_duration = Duration::from_millis(60);
    let h = harness(settings).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("Conversation is closed.")).await,
        "session did not close; notices: {:?}",
        h.sink.texts()
    );
    assert!(h.sink.has_text("Maximum duration exceeded."));
    assert!(!h.sink.has_text("Idle timeout."));
    assert!(!h.sink.has_text("Failed to relay message."));
}

#[tokio::test]
async fn new_token_supersedes_running_session() {
    let h = harness(fast_settings()).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;
    assert!(
        wait_until(WAIT, || h
            .sink
            .has_text("Relay started for conversation ID \"C1\"."))
        .await
    );

    h.supervisor
        .handle_activity(card_submission(&make_token("B2", "C2")))
        .await;
    assert!(
        wait_until(WAIT, || h
            .sink
            .has_text("Relay started for conversation ID \"C2\"."))
        .await,
        "second session did not start; notices: {:?}",
        h.sink.texts()
    );

    // The superseded session closed before the new one announced itself.
    let texts = h.sink.texts();
    let closed_at = texts
        .iter()
        .position(|t| t == "Conversation is closed.")
        .expect("old session closing notice");
    let second_started_at = texts
        .iter()
        .position(|t| t == "Relay started for conversation ID \"C2\".")
        .expect("new session start notice");
    assert!(closed_at < second_started_at);

    assert_eq!(h.service.created_count(), 2);
    assert_eq!(h.supervisor.active_conversation_id().await.as_deref(), Some("C2"));

    // Exactly one poll loop remains: everything fetched from here on
    // belongs to the new conversation.
    let seen = h.service.fetch_count();
    assert!(wait_until(WAIT, || h.service.fetch_count() > seen + 3).await);
    for (conversation_id, _) in h.service.fetches().into_iter().skip(seen) {
        assert_eq!(conversation_id, "C2");
    }
}

#[tokio::test]
async fn plain_message_without_session_prompts_for_token() {
    let h = harness(fast_settings()).await;

    h.supervisor.handle_activity(message("hello?")).await;

    assert!(
        wait_until(WAIT, || !h.sink.cards().is_empty()).await,
        "prompt card was not sent"
    );
    let cards = h.sink.cards();
    let body = cards[0]["content"]["body"].as_array().expect("card body");
    assert!(body
        .iter()
        .any(|b| b["type"] == "Input.Text" && b["id"] == "token"));
    assert_eq!(h.service.created_count(), 0);
}

#[tokio::test]
async fn members_added_greets_only_other_members() {
    let h = harness(fast_settings()).await;

    // The bot being added to its own conversation is not greeted.
    h.supervisor
        .handle_activity(members_added(&["bot-local"]))
        .await;
    assert!(h.sink.cards().is_empty());

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    assert!(wait_until(WAIT, || h.sink.cards().len() == 1).await);
}

#[tokio::test]
async fn inbound_message_forwards_into_conversation() {
    let h = harness(fast_settings()).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;
    assert!(
        wait_until(WAIT, || h
            .sink
            .has_text("Relay started for conversation ID \"C1\"."))
        .await
    );

    h.supervisor.handle_activity(message("hello bot")).await;

    assert!(
        wait_until(WAIT, || !h.service.posted().is_empty()).await,
        "inbound message was not forwarded"
    );
    let (conversation_id, forwarded) = h.service.posted().remove(0);
    assert_eq!(conversation_id, "C1");
    assert_eq!(forwarded["text"], "hello bot");
    // Routing metadata is stripped before crossing the boundary.
    for field in [
        "channelId",
        "conversation",
        "from",
        "id",
        "recipient",
        "serviceUrl",
        "timestamp",
    ] {
        assert!(
            forwarded.get(field).is_none(),
            "{} leaked into the forwarded activity",
            field
        );
    }

    // Forwarding did not disturb the poll loop.
    let seen = h.service.fetch_count();
    assert!(wait_until(WAIT, || h.service.fetch_count() > seen).await);
}

#[tokio::test]
async fn forward_failure_notifies_but_keeps_session_alive() {
    let h = harness(fast_settings()).await;
    h.service.post_status.store(500, Ordering::SeqCst);

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;
    assert!(
        wait_until(WAIT, || h
            .sink
            .has_text("Relay started for conversation ID \"C1\"."))
        .await
    );

    h.supervisor.handle_activity(message("hello bot")).await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("Failed to relay message to the bot.")).await,
        "forward failure was not reported; notices: {:?}",
        h.sink.texts()
    );
    assert!(h
        .sink
        .texts()
        .iter()
        .any(|t| t.contains("Failed to relay message to the bot.") && t.contains("500")));

    // The session survives a forwarding failure.
    assert!(!h.sink.has_text("Conversation is closed."));
    let seen = h.service.fetch_count();
    assert!(wait_until(WAIT, || h.service.fetch_count() > seen).await);
}

#[tokio::test]
async fn end_of_conversation_cancels_session() {
    let h = harness(fast_settings()).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message(&make_token("B1", "C1")))
        .await;
    assert!(
        wait_until(WAIT, || h
            .sink
            .has_text("Relay started for conversation ID \"C1\"."))
        .await
    );

    h.supervisor.handle_activity(end_of_conversation()).await;

    assert!(h.sink.has_text("Conversation is closed."));
    assert!(h.supervisor.active_conversation_id().await.is_none());

    let fetched = h.service.fetch_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.service.fetch_count(), fetched);

    // Ending again is a no-op.
    h.supervisor.handle_activity(end_of_conversation()).await;
}

#[tokio::test]
async fn undecodable_token_fails_with_notice_and_closes() {
    let h = harness(fast_settings()).await;

    h.supervisor.handle_activity(members_added(&["user-1"])).await;
    h.supervisor
        .handle_activity(message("eyJhb-not-actually-a-jwt"))
        .await;

    assert!(
        wait_until(WAIT, || h.sink.has_text("Conversation is closed.")).await,
        "session did not close; notices: {:?}",
        h.sink.texts()
    );
    assert!(h.sink.has_text("Failed to relay message."));
    assert_eq!(h.service.created_count(), 0);
}
