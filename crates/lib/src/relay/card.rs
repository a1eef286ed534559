//! Submit-token prompt card.

use serde_json::{json, Value};

/// Adaptive Card attachment asking for a Direct Line token: one required
/// multiline password-style input and a "Start conversation" submit
/// action. `prefill` seeds the token input (e.g. from
/// `RELAY_DIRECT_LINE_TOKEN`).
pub fn submit_token_card(prefill: Option<&str>) -> Value {
    json!({
        "contentType": "application/vnd.microsoft.card.adaptive",
        "content": {
            "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
            "type": "AdaptiveCard",
            "version": "1.5",
            "body": [
                {
                    "type": "TextBlock",
                    "size": "large",
                    "weight": "bolder",
                    "text": "Relay to Direct Line bot",
                    "horizontalAlignment": "left",
                    "wrap": true,
                    "style": "heading"
                },
                {
                    "type": "TextBlock",
                    "text": "Please enter the Direct Line token of the bot to talk to, then click \"Start conversation\" button to start.",
                    "wrap": true
                },
                {
                    "isSubtle": true,
                    "size": "Small",
                    "text": "Tips: You can also send the token as a message.",
                    "type": "TextBlock",
                    "wrap": true
                },
                {
                    "type": "Input.Text",
                    "id": "token",
                    "label": "Direct Line token",
                    "isMultiline": true,
                    "isRequired": true,
                    "errorMessage": "Token is required",
                    "style": "Password",
                    "value": prefill.unwrap_or("")
                }
            ],
            "actions": [
                {
                    "type": "Action.Submit",
                    "title": "Start conversation",
                    "data": { "id": "StartConversation" }
                }
            ]
        }
    })
}
