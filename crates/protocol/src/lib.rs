//! Wire protocol shared by the askhub hub and its participants.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{END_TOKEN, MessageType};
pub use envelope::{Message, WsError};
