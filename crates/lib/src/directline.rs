//! Direct Line REST client: create a conversation, post an activity,
//! fetch activities since a watermark.
//!
//! Stateless — every call is parameterized by the bearer token and (where
//! relevant) the conversation id. No retries here; the relay session owns
//! retry and backoff policy.

use crate::activity::Activity;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://directline.botframework.com/v3/directline";

/// Client for the Direct Line HTTP API.
#[derive(Clone)]
pub struct DirectLineClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectLineError {
    #[error("direct line request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status} \"{status_text}\"")]
    Api { status: u16, status_text: String },
    #[error("request cancelled")]
    Cancelled,
}

fn api_error(status: reqwest::StatusCode) -> DirectLineError {
    DirectLineError::Api {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
    }
}

/// Conversation handle returned by `create_conversation`. Token-bound
/// conversations echo the id already carried in the token's claims.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// One page of conversation activities plus the cursor for the next fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySet {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub watermark: Option<String>,
}

impl DirectLineClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// POST /conversations — open the conversation the token is bound to.
    pub async fn create_conversation(&self, token: &str) -> Result<Conversation, DirectLineError> {
        let url = format!("{}/conversations", self.base_url);
        let res = self.client.post(&url).bearer_auth(token).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res.status()));
        }
        Ok(res.json().await?)
    }

    /// POST /conversations/{id}/activities — post one (sanitized) activity
    /// into the conversation.
    pub async fn post_activity(
        &self,
        token: &str,
        conversation_id: &str,
        activity: &Activity,
    ) -> Result<(), DirectLineError> {
        let url = format!("{}/conversations/{}/activities", self.base_url, conversation_id);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(activity)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(api_error(res.status()));
        }
        Ok(())
    }

    /// GET /conversations/{id}/activities?watermark={w} — fetch activities
    /// newer than the watermark. No watermark means "from the beginning".
    /// Resolves to `Cancelled` if the token fires mid-request.
    pub async fn get_activities(
        &self,
        token: &str,
        conversation_id: &str,
        watermark: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ActivitySet, DirectLineError> {
        let url = format!(
            "{}/conversations/{}/activities?watermark={}",
            self.base_url,
            conversation_id,
            watermark.unwrap_or("")
        );
        let request = self.client.get(&url).bearer_auth(token).send();
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(DirectLineError::Cancelled),
            res = request => res?,
        };
        if !res.status().is_success() {
            return Err(api_error(res.status()));
        }
        let body = res.json();
        let set = tokio::select! {
            _ = cancel.cancelled() => return Err(DirectLineError::Cancelled),
            set = body => set?,
        };
        Ok(set)
    }
}
