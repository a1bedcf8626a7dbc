//! Error taxonomy for the loader core
//!
//! Errors are contained at the smallest boundary that can absorb them:
//! - `SmartError` fails one protocol fetch (and therefore one source)
//! - `DeliveryError` is captured per queue task and never fails the queue
//! - `LoaderError` is what a source pipeline reports to the orchestrator

use std::time::Duration;
use thiserror::Error;

/// Failures while talking to a SMART Scheduling Links publisher.
#[derive(Debug, Error)]
pub enum SmartError {
    /// Network-level failure (DNS, TLS, timeout, connection reset, ...)
    #[error("HTTP error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The publisher answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    /// A manifest or resource record did not match the expected structure.
    #[error("{context} did not match schema: {message}")]
    SchemaValidation { context: String, message: String },
}

impl SmartError {
    pub fn schema(context: impl Into<String>, message: impl ToString) -> Self {
        SmartError::SchemaValidation {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn is_schema_violation(&self) -> bool {
        matches!(self, SmartError::SchemaValidation { .. })
    }
}

/// Error code the remote store uses when an update is older than what it has.
pub const OUT_OF_DATE_CODE: &str = "out_of_date";

/// Failures delivering one record to the remote store.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error sending update: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store received the update and refused it.
    #[error("update rejected ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The delivery future panicked; the record outcome is unknown.
    #[error("delivery task panicked: {0}")]
    Panicked(String),

    /// The queue's workers are gone, so the task was never attempted.
    #[error("update queue is closed")]
    QueueClosed,

    /// The run was cancelled before this update finished sending.
    #[error("update cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Stale-update rejections are expected whenever another loader run got
    /// there first, so they are tallied but never alerted on.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            DeliveryError::Rejected { code: Some(code), .. } if code == OUT_OF_DATE_CODE
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Rejected { status, .. } => Some(*status),
            DeliveryError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Failure of one source pipeline, as reported by the orchestrator.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Smart(#[from] SmartError),

    #[error("Unknown source: \"{0}\"")]
    UnknownSource(String),

    #[error("source did not finish within {0:?}")]
    Timeout(Duration),

    #[error("run was cancelled")]
    Cancelled,

    #[error("source task panicked: {0}")]
    Panicked(String),

    #[error("could not write record: {0}")]
    Sink(String),

    /// Free-form failure raised by a source adapter.
    #[error("{0}")]
    Source(String),
}

impl LoaderError {
    pub fn source_failure(message: impl Into<String>) -> Self {
        LoaderError::Source(message.into())
    }
}

/// Render a panic payload from `JoinError` / `catch_unwind` as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
