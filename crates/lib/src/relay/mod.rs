//! Relay session lifecycle.
//!
//! A session binds one Direct Line token to one poll/forward loop; the
//! supervisor owns the current session and decides when inbound events
//! start, feed, or end it.

mod card;
mod session;
mod supervisor;

pub use card::submit_token_card;
pub use session::SessionSettings;
pub use supervisor::Supervisor;
