#![doc = include_str!("../README.md")]
// Declare modules
pub mod accumulator;
pub mod aggregator;
pub mod chunk;
pub mod core;
pub mod encoding;
pub mod error;
pub mod handler;
pub mod persistence;
pub mod resolver;
pub mod store;
pub mod telemetry;
pub mod times;
pub mod types;
pub mod writer;

/// Configuration options for the collector.
pub use crate::core::CollectorConfig;
/// Main entry point: the fully wired ingestion and compaction core.
pub use crate::core::{Collector, CollectorStats, Health};
/// Error type for collector operations.
pub use crate::error::TimelineError;
/// Ingest front door and its shutdown modes.
pub use crate::handler::{EventHandler, ShutdownMode};
/// Local crash-safe log of accepted sample batches.
pub use crate::persistence::{BackingLog, FileBackingLog};
/// Name to id resolution.
pub use crate::resolver::{IdResolver, InMemoryIdResolver};
/// Durable store of time ranges and chunks.
pub use crate::store::{CatalogStore, TimelineStore};
/// Structured event hook for observability.
pub use crate::telemetry::{TimelineEvent, TimelineEventListener};
/// Inbound event and sample values.
pub use crate::types::{Event, SampleValue};
/// Persisted units: chunks, time ranges and their pairing.
pub use crate::types::{ChunkSet, EncodedChunk, TimeRange};
/// Type alias for a timestamp (milliseconds since epoch).
pub use crate::types::Timestamp;
