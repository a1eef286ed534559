//! Gateway: the HTTP face of the relay.
//!
//! One port serves the health probe and the channel webhook that feeds
//! inbound activities to the session supervisor.

mod server;

pub use server::{run_gateway, GatewayState};
