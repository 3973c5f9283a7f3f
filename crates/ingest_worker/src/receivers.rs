mod channel;
mod mqtt;
mod nats;
mod topic;

pub use channel::*;
pub use mqtt::*;
pub use nats::*;
pub use topic::*;
