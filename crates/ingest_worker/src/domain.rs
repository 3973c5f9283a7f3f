mod counters;
mod decoder;
mod deduplicator;
mod error;
mod event_handler;
mod in_memory_assignment_repository;
mod persistence_service;
mod pipeline;

pub use counters::*;
pub use decoder::*;
pub use deduplicator::*;
pub use error::*;
pub use event_handler::*;
pub use in_memory_assignment_repository::*;
pub use persistence_service::*;
pub use pipeline::*;
