//! Reply addressing for the inbound channel.

use crate::activity::{Activity, ChannelAccount};

/// Where outbound messages should be delivered on the inbound channel:
/// the reply address captured from the most recent inbound activity.
/// The supervisor is the sole writer; relay sessions only read it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRef {
    pub service_url: String,
    pub conversation_id: String,
    /// The bot's own identity on the channel (outbound `from`).
    pub bot: Option<ChannelAccount>,
    /// The user the bot is talking to (outbound `recipient`).
    pub user: Option<ChannelAccount>,
}

/// Extract the reply address from an inbound activity. `None` when the
/// activity carries no service URL or conversation id to reply through.
pub fn conversation_reference(activity: &Activity) -> Option<RoutingRef> {
    let service_url = activity.service_url.clone()?;
    let conversation_id = activity.conversation.as_ref()?.id.clone();
    Some(RoutingRef {
        service_url,
        conversation_id,
        bot: activity.recipient.clone(),
        user: activity.from.clone(),
    })
}
