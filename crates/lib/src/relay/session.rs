//! One relay session: open the Direct Line conversation a token is bound
//! to, poll it for bot output, and forward that output back through the
//! channel until the session is superseded, idle, out of time, or failed.

use crate::activity::{clean_activity, Activity};
use crate::channel::{ChannelSink, RoutingRef, SinkError};
use crate::directline::{DirectLineClient, DirectLineError};
use crate::token::{self, TokenError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timing knobs for a session. Defaults match the public Direct Line
/// service limits.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Pause between polls; paces load on the service.
    pub poll_interval: Duration,
    /// How long without bot output before the session idles out.
    pub idle_timeout: Duration,
    /// Hard ceiling on session lifetime, measured from session start.
    pub max_duration: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            max_duration: Duration::from_secs(3600),
        }
    }
}

/// Everything one session run needs. The reply reference is shared with
/// the supervisor, which is its sole writer; the session only reads it.
pub(crate) struct SessionContext {
    pub client: DirectLineClient,
    pub sink: Arc<dyn ChannelSink>,
    pub reference: Arc<RwLock<Option<RoutingRef>>>,
    pub settings: SessionSettings,
    pub token: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    DirectLine(#[from] DirectLineError),
    #[error(transparent)]
    Delivery(#[from] SinkError),
}

/// Clean endings of the poll loop.
enum LoopEnd {
    MaxDuration,
    Cancelled,
}

/// Run the session to completion. Always ends with the closing notice,
/// whichever path led there.
pub(crate) async fn run(ctx: SessionContext) {
    let last_delivery = Arc::new(RwLock::new(Instant::now()));
    let mut watchdog: Option<JoinHandle<()>> = None;

    match relay(&ctx, &last_delivery, &mut watchdog).await {
        Ok(LoopEnd::MaxDuration) => {
            log::info!("relay session reached maximum duration");
            notify(&ctx, "Maximum duration exceeded.").await;
        }
        Ok(LoopEnd::Cancelled) | Err(SessionError::DirectLine(DirectLineError::Cancelled)) => {
            // Superseded, idled out, or explicitly ended: not an error,
            // and the notice for it (if any) was already sent.
        }
        Err(error) => {
            log::error!("relay session failed: {}", error);
            notify(&ctx, &format!("Failed to relay message.\n\n{}", error)).await;
            ctx.cancel.cancel();
        }
    }

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    notify(&ctx, "Conversation is closed.").await;
}

async fn relay(
    ctx: &SessionContext,
    last_delivery: &Arc<RwLock<Instant>>,
    watchdog: &mut Option<JoinHandle<()>>,
) -> Result<LoopEnd, SessionError> {
    let claims = token::decode(&ctx.token)?;

    let created = ctx.client.create_conversation(&ctx.token).await?;
    if let Some(id) = created.conversation_id {
        log::debug!("conversation opened by the service as \"{}\"", id);
    }

    log::info!("relay started for conversation ID \"{}\"", claims.conv);
    send_notice(
        ctx,
        &format!("Relay started for conversation ID \"{}\".", claims.conv),
    )
    .await?;

    *last_delivery.write().await = Instant::now();
    *watchdog = Some(spawn_idle_watchdog(ctx, Arc::clone(last_delivery)));

    let started = Instant::now();
    let mut watermark: Option<String> = None;

    while !ctx.cancel.is_cancelled() && started.elapsed() < ctx.settings.max_duration {
        let set = ctx
            .client
            .get_activities(&ctx.token, &claims.conv, watermark.as_deref(), &ctx.cancel)
            .await?;

        // The cursor advances even when the page is empty; losing it would
        // re-deliver already-seen activities.
        watermark = set.watermark;

        // A fetch that raced a supersession must not deliver into a stale
        // reply address.
        if ctx.cancel.is_cancelled() {
            break;
        }

        let outgoing: Vec<Activity> = set
            .activities
            .into_iter()
            .filter(|activity| activity.is_from_bot(&claims.bot))
            .map(clean_activity)
            .collect();

        if !outgoing.is_empty() {
            log::debug!("delivering {} relayed activities", outgoing.len());
            send_batch(ctx, outgoing).await?;
            *last_delivery.write().await = Instant::now();
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.settings.poll_interval) => {}
        }
    }

    Ok(if ctx.cancel.is_cancelled() {
        LoopEnd::Cancelled
    } else {
        LoopEnd::MaxDuration
    })
}

/// Watches the delivery clock; when nothing has been delivered for the
/// idle duration, announces the timeout and cancels the session.
fn spawn_idle_watchdog(
    ctx: &SessionContext,
    last_delivery: Arc<RwLock<Instant>>,
) -> JoinHandle<()> {
    let sink = Arc::clone(&ctx.sink);
    let reference = Arc::clone(&ctx.reference);
    let cancel = ctx.cancel.clone();
    let idle_timeout = ctx.settings.idle_timeout;

    tokio::spawn(async move {
        loop {
            let deadline = *last_delivery.read().await + idle_timeout;
            if Instant::now() >= deadline {
                log::info!("relay session idle timeout");
                if let Some(reference) = reference.read().await.clone() {
                    if let Err(error) = sink.send_text(&reference, "Idle timeout.").await {
                        log::warn!("idle timeout notice failed: {}", error);
                    }
                }
                cancel.cancel();
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    })
}

/// Deliver a batch through the current reply address. Errors propagate
/// and end the session.
async fn send_batch(ctx: &SessionContext, activities: Vec<Activity>) -> Result<(), SessionError> {
    match ctx.reference.read().await.clone() {
        Some(reference) => {
            ctx.sink.send_activities(&reference, activities).await?;
            Ok(())
        }
        None => {
            log::warn!(
                "no reply address captured yet, dropping {} activities",
                activities.len()
            );
            Ok(())
        }
    }
}

async fn send_notice(ctx: &SessionContext, text: &str) -> Result<(), SessionError> {
    if let Some(reference) = ctx.reference.read().await.clone() {
        ctx.sink.send_text(&reference, text).await?;
    }
    Ok(())
}

/// Best-effort variant for status and teardown notices: a broken
/// notification channel must never keep the cleanup from completing.
async fn notify(ctx: &SessionContext, text: &str) {
    if let Err(error) = send_notice(ctx, text).await {
        log::warn!("status notice failed: {}", error);
    }
}
