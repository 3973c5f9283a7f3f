//! Device event ingestion.
//!
//! Receivers (NATS JetStream, MQTT, in-process channel) hand raw payloads to
//! an [`IngestionPipeline`](domain::IngestionPipeline), which decodes them into
//! device requests, drops duplicates and forwards the rest to a
//! [`DecodedEventHandler`](domain::DecodedEventHandler).

pub mod domain;
pub mod ingest_worker;
pub mod receivers;

pub use domain::*;
pub use ingest_worker::*;
pub use receivers::*;
