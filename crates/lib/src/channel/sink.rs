//! Outbound delivery seam for the inbound channel.
//!
//! The relay pushes activities back out through a [`ChannelSink`], either
//! inside an event handler or long after it returned (the poll loop and
//! the timeout notices deliver asynchronously to the latest reply address).

use crate::activity::Activity;
use crate::channel::events::RoutingRef;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel returned {status} \"{status_text}\"")]
    Api { status: u16, status_text: String },
}

/// Delivers activities to a reply address on the inbound channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Send a batch of activities to the given reply address, in order.
    async fn send_activities(
        &self,
        reference: &RoutingRef,
        activities: Vec<Activity>,
    ) -> Result<(), SinkError>;

    /// Send a single plain-text message.
    async fn send_text(&self, reference: &RoutingRef, text: &str) -> Result<(), SinkError> {
        self.send_activities(reference, vec![Activity::message(text)])
            .await
    }

    /// Send a single card attachment.
    async fn send_card(
        &self,
        reference: &RoutingRef,
        attachment: serde_json::Value,
    ) -> Result<(), SinkError> {
        self.send_activities(reference, vec![Activity::with_attachment(attachment)])
            .await
    }
}
