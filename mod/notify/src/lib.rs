pub mod bridge;
pub mod hub;
pub mod protocol;

pub use bridge::ProgressBridge;
pub use hub::{ConnectionId, ConnectionSink, NotificationHub};
pub use protocol::{ClientMessage, ServerMessage};
