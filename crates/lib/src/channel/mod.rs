//! Inbound channel boundary: reply addressing and outbound delivery.
//!
//! The channel's transport and authentication live outside this system;
//! the relay consumes inbound activities and produces outbound ones
//! addressed via a [`RoutingRef`].

mod connector;
mod events;
mod sink;

pub use connector::ConnectorClient;
pub use events::{conversation_reference, RoutingRef};
pub use sink::{ChannelSink, SinkError};
