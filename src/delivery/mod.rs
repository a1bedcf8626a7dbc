//! # Delivery
//!
//! Sends normalized records to the availability store.
//!
//! - `queue` - `Deliverer` trait and the bounded `UpdateQueue`
//! - `api_client` - reqwest implementation against the edge API
//! - `backoff` - retry delays for gateway failures

pub mod api_client;
pub mod backoff;
pub mod queue;

pub use api_client::{ApiClient, GATEWAY_RETRY_STATUSES};
pub use backoff::ExponentialBackoff;
pub use queue::{Deliverer, UpdateOutcome, UpdateQueue, UpdateResponse};
