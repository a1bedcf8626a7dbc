//! Run reports, delivery tallies and the exit-status policy

use crate::delivery::UpdateOutcome;
use crate::errors::{DeliveryError, LoaderError};
use crate::metrics::MetricsSink;
use std::time::Duration;

/// Process-level result of a run, mapped to an exit code by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Some sources failed, at least one succeeded.
    PartialFailure,
    /// No source succeeded.
    AllFailed,
    /// An error escaped every isolation boundary.
    Unhandled,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::PartialFailure => 91,
            ExitStatus::AllFailed => 92,
            ExitStatus::Unhandled => 90,
        }
    }

    /// Aggregate status for a set of source reports. A run with no sources
    /// has no successes and counts as a total failure.
    pub fn from_reports(reports: &[SourceReport]) -> Self {
        let failed = reports.iter().filter(|r| r.error.is_some()).count();
        let succeeded = reports.len() - failed;

        if succeeded == 0 {
            ExitStatus::AllFailed
        } else if failed > 0 {
            ExitStatus::PartialFailure
        } else {
            ExitStatus::Success
        }
    }
}

/// Result of one source pipeline.
#[derive(Debug)]
pub struct SourceReport {
    pub name: String,
    pub error: Option<LoaderError>,
    /// Records produced by the adapter
    pub produced: usize,
    /// Records dropped as stale
    pub stale: usize,
    /// Records handed to the sinks
    pub written: usize,
    pub elapsed: Duration,
}

impl SourceReport {
    pub fn failed(name: impl Into<String>, error: LoaderError, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            error: Some(error),
            produced: 0,
            stale: 0,
            written: 0,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Counts of drained delivery outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryTally {
    pub sent: usize,
    pub succeeded: usize,
    /// Rejected because the store already had newer data (expected)
    pub out_of_date: usize,
    pub failed: usize,
    /// Abandoned when the run was cancelled
    pub cancelled: usize,
    pub retries: u64,
}

/// Tally outcomes, logging every unexpected failure with enough context to
/// find the record. Out-of-date rejections are counted but not logged as
/// errors.
pub fn classify_outcomes(outcomes: &[UpdateOutcome], metrics: &dyn MetricsSink) -> DeliveryTally {
    let mut tally = DeliveryTally {
        sent: outcomes.len(),
        ..Default::default()
    };

    for outcome in outcomes {
        match &outcome.result {
            Ok(response) => {
                tally.succeeded += 1;
                tally.retries += u64::from(response.retries);
            }
            Err(error) if error.is_out_of_date() => {
                tally.out_of_date += 1;
                log::debug!("Skipped out-of-date update for {}", outcome.sent.describe());
            }
            Err(DeliveryError::Cancelled) => tally.cancelled += 1,
            Err(error) => {
                tally.failed += 1;
                let source = outcome
                    .sent
                    .source()
                    .map(|s| format!(" from {}", s))
                    .unwrap_or_default();
                log::error!(
                    "❌ Error sending {}{}: {}",
                    outcome.sent.describe(),
                    source,
                    error
                );
            }
        }
    }

    metrics.increment("loader.jobs.send.retries", tally.retries, &[]);
    metrics.increment("loader.jobs.send.failed", tally.failed as u64, &[]);

    tally
}
