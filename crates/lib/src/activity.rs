//! Bot Framework activity payload and the routing-metadata sanitizer.
//!
//! The relay treats an activity as an opaque bag of fields: it inspects
//! `type`, `from` and `value`, strips transport-assigned routing metadata
//! before re-transmission, and carries everything else through untouched
//! (the flattened `extra` map).

use serde::{Deserialize, Serialize};

/// Sender or recipient identity on an activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Conversation handle assigned by a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One activity crossing the relay in either direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_added: Option<Vec<ChannelAccount>>,
    /// Fields the relay does not interpret; preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Activity {
    /// Plain text message activity.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            activity_type: Some("message".to_string()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Message activity carrying one card attachment.
    pub fn with_attachment(attachment: serde_json::Value) -> Self {
        Self {
            activity_type: Some("message".to_string()),
            attachments: Some(vec![attachment]),
            ..Self::default()
        }
    }

    /// Activity kind ("message", "conversationUpdate", "endOfConversation", ...).
    pub fn kind(&self) -> &str {
        self.activity_type.as_deref().unwrap_or("")
    }

    /// True when the sender is the relayed bot: matching id, or the "bot" role.
    pub fn is_from_bot(&self, bot_id: &str) -> bool {
        self.from
            .as_ref()
            .map(|from| from.id == bot_id || from.role.as_deref() == Some("bot"))
            .unwrap_or(false)
    }
}

/// Strip channel-routing metadata so the receiving side's transport assigns
/// fresh, locally-valid routing fields instead of inheriting the other
/// side's. Everything else is preserved.
pub fn clean_activity(mut activity: Activity) -> Activity {
    activity.channel_id = None;
    activity.conversation = None;
    activity.from = None;
    activity.id = None;
    activity.recipient = None;
    activity.service_url = None;
    activity.timestamp = None;
    activity
}
