//! # Pipeline Orchestrator
//!
//! Runs a set of named source adapters and routes their records:
//!
//! ```text
//! SourceAdapter ─► normalize ─► StaleChecker ─► RecordSink(s)
//!                                                  ├─ ConsoleSink (stdout)
//!                                                  └─ QueueSink ─► UpdateQueue ─► API
//! ```
//!
//! ## Module Organization
//!
//! - `source` - adapter trait, run context and registry
//! - `sink` - record sink backends
//! - `orchestrator` - concurrent per-source pipelines and the run summary
//! - `report` - per-source reports, delivery tally, exit status

pub mod orchestrator;
pub mod report;
pub mod sink;
pub mod source;

pub use orchestrator::{CancelHandle, Orchestrator, RunOptions, RunSummary};
pub use report::{classify_outcomes, DeliveryTally, ExitStatus, SourceReport};
pub use sink::{ConsoleSink, MemorySink, QueueSink, RecordSink};
pub use source::{SourceAdapter, SourceContext, SourceRegistry};
