//! Bot Framework connector client: posts reply activities to the
//! channel's service URL.

use crate::activity::{Activity, ConversationAccount};
use crate::channel::events::RoutingRef;
use crate::channel::sink::{ChannelSink, SinkError};
use async_trait::async_trait;

/// Production [`ChannelSink`]: delivers replies via the connector REST API
/// at the service URL carried in the reply address.
#[derive(Clone)]
pub struct ConnectorClient {
    client: reqwest::Client,
}

impl Default for ConnectorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelSink for ConnectorClient {
    async fn send_activities(
        &self,
        reference: &RoutingRef,
        activities: Vec<Activity>,
    ) -> Result<(), SinkError> {
        let url = format!(
            "{}/v3/conversations/{}/activities",
            reference.service_url.trim_end_matches('/'),
            reference.conversation_id
        );
        for mut activity in activities {
            // The reply address supplies the routing fields the sanitizer
            // stripped on the way in.
            activity.from = reference.bot.clone();
            activity.recipient = reference.user.clone();
            activity.conversation = Some(ConversationAccount {
                id: reference.conversation_id.clone(),
                name: None,
            });
            if activity.activity_type.is_none() {
                activity.activity_type = Some("message".to_string());
            }
            let res = self.client.post(&url).json(&activity).send().await?;
            if !res.status().is_success() {
                return Err(SinkError::Api {
                    status: res.status().as_u16(),
                    status_text: res.status().canonical_reason().unwrap_or("").to_string(),
                });
            }
        }
        Ok(())
    }
}
