//! Parley core library — activity model, Direct Line client, relay
//! session machinery, and the channel gateway used by the CLI.

pub mod activity;
pub mod channel;
pub mod config;
pub mod directline;
pub mod gateway;
pub mod relay;
pub mod token;
