pub mod heartbeat;
pub mod identity;

pub use heartbeat::{Heartbeat, HeartbeatReport};
pub use identity::{outbound_ip, Identity};
