//! Time-bucketed device event store.
//!
//! Every event is written under a point record keyed by id, an optional point
//! record keyed by alternate id, and one wide-row partition per index
//! dimension it belongs to:
//!
//! ```text
//! (tenant, dimension, entity id, bucket) -> events ordered by event date
//! ```
//!
//! Reads fan out one sub-query per (entity id, bucket) pair, bucket by bucket,
//! newest first, and stream the merged results through a [`Pager`].
//!
//! Storage is pluggable through [`EventStoreBackend`]; an in-memory wide-row
//! backend and a ClickHouse backend ship with the crate.

pub mod backend;
pub mod bucket;
pub mod codec;
pub mod dead_letter;
pub mod error;
pub mod pager;
pub mod query;
pub mod store;

pub use backend::*;
pub use bucket::*;
pub use dead_letter::*;
pub use error::*;
pub use pager::*;
pub use query::*;
pub use store::*;
