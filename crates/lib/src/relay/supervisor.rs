//! Session supervisor: the single decision point for what an inbound
//! channel event means for relay session lifecycle.
//!
//! Owns the two pieces of shared mutable state — the current reply
//! address and the current session handle — and is their only writer.

use crate::activity::{clean_activity, Activity};
use crate::channel::{conversation_reference, ChannelSink, RoutingRef};
use crate::directline::DirectLineClient;
use crate::relay::card::submit_token_card;
use crate::relay::session::{self, SessionContext, SessionSettings};
use crate::token::{self, TokenClaims};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The currently-running relay session.
struct SessionHandle {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    token: String,
    claims: Option<TokenClaims>,
}

impl SessionHandle {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Routes inbound channel events to session lifecycle actions: start a
/// new session, forward into the current one, prompt for a token, or end.
pub struct Supervisor {
    client: DirectLineClient,
    sink: Arc<dyn ChannelSink>,
    settings: SessionSettings,
    /// Prefill for the prompt card's token input.
    card_prefill: Option<String>,
    /// Reply address of the most recent inbound event, whatever its kind.
    reference: Arc<RwLock<Option<RoutingRef>>>,
    current: Mutex<Option<SessionHandle>>,
}

impl Supervisor {
    pub fn new(
        client: DirectLineClient,
        sink: Arc<dyn ChannelSink>,
        settings: SessionSettings,
        card_prefill: Option<String>,
    ) -> Self {
        Self {
            client,
            sink,
            settings,
            card_prefill,
            reference: Arc::new(RwLock::new(None)),
            current: Mutex::new(None),
        }
    }

    /// Conversation id of the active session, when one is running.
    pub async fn active_conversation_id(&self) -> Option<String> {
        let guard = self.current.lock().await;
        guard
            .as_ref()
            .filter(|handle| handle.is_active())
            .and_then(|handle| handle.claims.as_ref())
            .map(|claims| claims.conv.clone())
    }

    /// Handle one inbound channel event. Never fails: errors are logged
    /// and reported back through the channel, so the caller's event
    /// pipeline always continues.
    pub async fn handle_activity(&self, activity: Activity) {
        // The reply address follows the latest inbound event of any kind,
        // so outbound delivery always targets the most recent valid
        // destination.
        if let Some(reference) = conversation_reference(&activity) {
            *self.reference.write().await = Some(reference);
        }

        match activity.kind() {
            "message" => self.on_message(activity).await,
            "conversationUpdate" => self.on_members_added(activity).await,
            "endOfConversation" => self.end_session().await,
            other => log::debug!("ignoring \"{}\" activity", other),
        }
    }

    async fn on_message(&self, activity: Activity) {
        if let Some(value) = activity
            .value
            .as_ref()
            .filter(|v| v.get("id").and_then(serde_json::Value::as_str) == Some("StartConversation"))
        {
            let token = value
                .get("token")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            self.start_session(token).await;
        } else if activity.text.as_deref().is_some_and(token::looks_like_token) {
            let token = activity.text.clone().unwrap_or_default();
            self.start_session(token).await;
        } else if let Some((token, conversation_id)) = self.active_target().await {
            log::debug!(
                "received a \"message\" activity: {}",
                serde_json::to_string(&activity).unwrap_or_default()
            );
            self.forward(activity, token, conversation_id);
        } else {
            self.send_prompt().await;
        }
    }

    /// Greet every added member that is not the bot's own recipient
    /// identity with the submit-token prompt.
    async fn on_members_added(&self, activity: Activity) {
        let recipient_id = activity
            .recipient
            .as_ref()
            .map(|account| account.id.clone())
            .unwrap_or_default();
        for member in activity.members_added.clone().unwrap_or_default() {
            if member.id != recipient_id {
                self.send_prompt().await;
            }
        }
    }

    /// Start a new relay session, superseding any current one. The old
    /// session's cancellation is signalled and its task awaited before
    /// the new session performs any I/O, so two poll loops can never race
    /// on the reply address.
    pub async fn start_session(&self, token: String) {
        let mut current = self.current.lock().await;
        if let Some(old) = current.take() {
            log::info!("superseding relay session {}", old.id);
            old.cancel.cancel();
            if let Err(error) = old.task.await {
                log::warn!("superseded session task failed: {}", error);
            }
        }

        let claims = match token::decode(&token) {
            Ok(claims) => Some(claims),
            // The session run surfaces the decode failure to the user.
            Err(error) => {
                log::debug!("submitted token claims not decodable: {}", error);
                None
            }
        };

        let id = format!("sess-{}", uuid::Uuid::new_v4());
        log::info!("starting relay session {}", id);
        let cancel = CancellationToken::new();
        let ctx = SessionContext {
            client: self.client.clone(),
            sink: Arc::clone(&self.sink),
            reference: Arc::clone(&self.reference),
            settings: self.settings.clone(),
            token: token.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session::run(ctx));
        *current = Some(SessionHandle {
            id,
            cancel,
            task,
            token,
            claims,
        });
    }

    /// Cancel the current session and wait for its teardown. Idempotent
    /// when none is active.
    pub async fn end_session(&self) {
        if let Some(handle) = self.current.lock().await.take() {
            log::info!("ending relay session {}", handle.id);
            handle.cancel.cancel();
            if let Err(error) = handle.task.await {
                log::warn!("session task failed during shutdown: {}", error);
            }
        }
    }

    /// Token and conversation id of the active session, for forwarding.
    async fn active_target(&self) -> Option<(String, String)> {
        let guard = self.current.lock().await;
        let handle = guard.as_ref().filter(|handle| handle.is_active())?;
        let claims = handle.claims.as_ref()?;
        Some((handle.token.clone(), claims.conv.clone()))
    }

    /// Forward an ordinary inbound message into the external conversation.
    /// Runs detached: a slow or failing post must not block the event
    /// pipeline, and its failure does not end the session.
    fn forward(&self, activity: Activity, token: String, conversation_id: String) {
        let client = self.client.clone();
        let sink = Arc::clone(&self.sink);
        let reference = Arc::clone(&self.reference);
        tokio::spawn(async move {
            let cleaned = clean_activity(activity);
            if let Err(error) = client.post_activity(&token, &conversation_id, &cleaned).await {
                log::error!("failed to relay inbound message: {}", error);
                if let Some(reference) = reference.read().await.clone() {
                    let text = format!("Failed to relay message to the bot.\n\n{}", error);
                    if let Err(error) = sink.send_text(&reference, &text).await {
                        log::warn!("relay failure notice failed: {}", error);
                    }
                }
            }
        });
    }

    async fn send_prompt(&self) {
        let Some(reference) = self.reference.read().await.clone() else {
            log::warn!("no reply address captured yet, cannot send the token prompt");
            return;
        };
        let card = submit_token_card(self.card_prefill.as_deref());
        if let Err(error) = self.sink.send_card(&reference, card).await {
            log::warn!("token prompt send failed: {}", error);
        }
    }
}
