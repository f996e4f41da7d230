//! Infrastructure layer of the stats write path: queues, storage adapters,
//! notifiers, configuration and the ingestion service that wires them.

pub mod config;
pub mod event_bus;
pub mod ingest;
pub mod jobs;
pub mod read_model;

pub use config::IngestConfig;
pub use ingest::{IngestService, IngestStats, MergeSummary};
