pub mod constants;
pub mod envelope;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{ClientMessage, ErrorBody, ServerMessage};
pub use types::{HubEvent, ServiceCallResponse, ServiceContext, StateRecord};
