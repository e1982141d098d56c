//! Identifiers and the few messages the relay originates itself.
//!
//! Everything else that crosses a session is opaque passthrough:
//! - [`ErrorPayload`] - Structured error sent to a client before rejecting it
//! - [`SessionId`] - Type-safe identifier for a relay session

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
