//! Record sinks: where accepted records go after the staleness filter

use crate::delivery::UpdateQueue;
use crate::errors::LoaderError;
use crate::model::{DeliveryOptions, LocationRecord};
use async_trait::async_trait;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Backend trait for writing normalized records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write a single record
    async fn write_record(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<(), LoaderError>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Prints each record as JSON.
///
/// Compact output is one object per line; otherwise objects are
/// pretty-printed.
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
    compact: bool,
}

impl ConsoleSink {
    pub fn stdout(compact: bool) -> Self {
        Self::with_writer(Box::new(io::stdout()), compact)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, compact: bool) -> Self {
        Self {
            out: Mutex::new(out),
            compact,
        }
    }
}

#[async_trait]
impl RecordSink for ConsoleSink {
    async fn write_record(
        &self,
        record: &LocationRecord,
        _options: DeliveryOptions,
    ) -> Result<(), LoaderError> {
        let json = if self.compact {
            serde_json::to_string(record)
        } else {
            serde_json::to_string_pretty(record)
        }
        .map_err(|e| LoaderError::Sink(e.to_string()))?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| LoaderError::Sink("console writer lock poisoned".to_string()))?;
        writeln!(out, "{}", json).map_err(|e| LoaderError::Sink(e.to_string()))?;
        out.flush().map_err(|e| LoaderError::Sink(e.to_string()))?;

        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "console"
    }
}

/// Hands records to the update queue.
pub struct QueueSink {
    queue: Arc<UpdateQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<UpdateQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl RecordSink for QueueSink {
    async fn write_record(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<(), LoaderError> {
        self.queue.push(record.clone(), options);
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "queue"
    }
}

/// Keeps every written record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(LocationRecord, DeliveryOptions)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(LocationRecord, DeliveryOptions)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_record(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<(), LoaderError> {
        match self.records.lock() {
            Ok(mut records) => records.push((record.clone(), options)),
            Err(poisoned) => poisoned.into_inner().push((record.clone(), options)),
        }
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "memory"
    }
}
