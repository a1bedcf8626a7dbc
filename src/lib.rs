//! # availflow
//!
//! Loader core for vaccine appointment availability feeds.
//!
//! ## Architecture
//!
//! ```text
//! SourceAdapter (uses smart::SmartClient)
//!     -> pipeline::Orchestrator (normalize)
//!     -> stale::StaleChecker
//!     -> stdout | delivery::UpdateQueue -> remote store
//! ```
//!
//! ## Module Organization
//!
//! - `smart` - SMART Scheduling Links protocol client and join
//! - `stale` - data age inference and per-source age statistics
//! - `delivery` - bounded-concurrency update queue and API client
//! - `pipeline` - per-source pipelines, sinks and the exit-status policy
//! - `sources` - built-in source adapters
//! - `server` - HTTP trigger mode that runs sources on request
//! - `model` - normalized location and availability records
//! - `config` - environment-based configuration
//! - `errors` - error types
//! - `metrics` - metrics sink abstraction
//! - `logging` - logger setup

pub mod config;
pub mod delivery;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod smart;
pub mod sources;
pub mod stale;

pub use config::LoaderConfig;
pub use errors::{DeliveryError, LoaderError, SmartError};
pub use model::{Availability, Available, DeliveryOptions, LocationRecord, SourceOutput};
