//! Direct Line token decoding.
//!
//! A Direct Line token is a JWT whose payload names the bot and the
//! conversation it is bound to. Decoding here is for routing only — no
//! signature verification; the Direct Line service itself is the authority
//! on whether the token is valid.

use base64::Engine;
use serde::Deserialize;

/// What a base64url-encoded JWT header always starts with (`{"alg"`).
/// Used to recognize a token sent as a plain chat message.
pub const TOKEN_PREFIX: &str = "eyJhb";

/// Routing identifiers carried in a Direct Line token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Id of the bot the conversation is bound to.
    pub bot: String,
    /// Id of the conversation the token grants access to.
    pub conv: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not a JWT (expected three dot-separated segments)")]
    Malformed,
    #[error("token payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token payload is not valid claims JSON: {0}")]
    Claims(#[from] serde_json::Error),
}

/// True when a message text looks like a Direct Line token.
pub fn looks_like_token(text: &str) -> bool {
    text.starts_with(TOKEN_PREFIX)
}

/// Decode the payload segment of a Direct Line token into its claims.
pub fn decode(token: &str) -> Result<TokenClaims, TokenError> {
    let payload = token.split('.').nth(1).ok_or(TokenError::Malformed)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload.as_bytes())?;
    Ok(serde_json::from_slice(&bytes)?)
}
