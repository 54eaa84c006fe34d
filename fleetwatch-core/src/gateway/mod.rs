//! # HTTP Gateway
//!
//! JSON-over-HTTP surface for the summary engine: per-agent and batch summary
//! reads, history, manual refresh, and a health probe.

mod error;
mod server;

pub use error::ApiError;
pub use server::{GatewayState, SharedGateway, router as gateway_router, run as run_gateway};

/// Default history page size when `limit` is omitted.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
