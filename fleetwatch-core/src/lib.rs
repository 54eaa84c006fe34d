//! # Fleetwatch Core
//!
//! Core library for fleetwatch, a coordination backend for fleets of coding
//! agents. Reads each agent's session transcript, asks a small model what the
//! agent is doing, and serves the answer from a stale-while-revalidate cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;
pub mod summarizer;
pub mod transcript;
pub mod types;

// Re-export commonly used types at the crate root.
pub use cache::{CacheStats, RefreshOutcome, SummaryService, is_duplicate};
pub use config::{
    FleetConfig, GatewayConfig, StoreConfig, SummaryConfig, load_config, load_validated_config,
};
pub use error::{
    ConfigError, FleetError, ModelError, Result, StoreError, SummaryError, TranscriptError,
};
pub use store::{InMemoryStore, SqliteStore, SummaryStore};
pub use summarizer::{
    CliSummaryModel, MockSummaryModel, ModelResponse, Summarizer, SummaryModel,
};
pub use transcript::TranscriptReader;
pub use types::{Agent, SummaryEvent, SummaryResult, TranscriptData};
