//! Runs source pipelines concurrently with per-source failure isolation
//!
//! Each requested source becomes its own Tokio task:
//!
//! ```text
//! adapter.check_availability -> normalize -> staleness filter -> sinks
//! ```
//!
//! A failing, panicking, timed-out or cancelled source only produces a
//! failed `SourceReport`; its siblings keep running. Once every source is
//! done the update queue (if any) is drained and classified. Cancelling the
//! run also cancels the queue, so unsent updates are abandoned.

use super::report::{classify_outcomes, DeliveryTally, ExitStatus, SourceReport};
use super::sink::{QueueSink, RecordSink};
use super::source::{SourceAdapter, SourceContext, SourceRegistry};
use crate::delivery::UpdateQueue;
use crate::errors::{panic_message, LoaderError};
use crate::metrics::MetricsSink;
use crate::stale::StaleChecker;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Prefix for staleness gauges sent at the end of a run.
pub const METRICS_PREFIX: &str = "loader";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Sources to run; empty means every registered source
    pub sources: Vec<String>,
    /// Limit multi-state sources to these state codes
    pub states: Option<Vec<String>>,
    /// Deadline for each source pipeline
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<SourceReport>,
    /// Present when records were sent through the update queue
    pub delivery: Option<DeliveryTally>,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.reports.iter().filter(|r| !r.is_success())
    }
}

/// Cancels every running source of the orchestrator it came from.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub struct Orchestrator {
    registry: SourceRegistry,
    stale: Arc<Mutex<StaleChecker>>,
    metrics: Arc<dyn MetricsSink>,
    sinks: Vec<Arc<dyn RecordSink>>,
    queue: Option<Arc<UpdateQueue>>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        registry: SourceRegistry,
        stale: StaleChecker,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            registry,
            stale: Arc::new(Mutex::new(stale)),
            metrics,
            sinks: Vec::new(),
            queue: None,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Add a sink every accepted record is written to.
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Send accepted records through `queue` and drain it at the end of the run.
    pub fn with_queue(mut self, queue: Arc<UpdateQueue>) -> Self {
        self.sinks.push(Arc::new(QueueSink::new(queue.clone())));
        self.queue = Some(queue);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Shared staleness checker, e.g. for inspecting statistics after a run.
    pub fn stale_checker(&self) -> Arc<Mutex<StaleChecker>> {
        self.stale.clone()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub async fn run(&self, options: RunOptions) -> RunSummary {
        let started = Instant::now();
        // Staleness summary and metrics are reported however the run ends.
        let _finalizer = RunFinalizer {
            stale: self.stale.clone(),
            metrics: self.metrics.clone(),
            started,
        };

        let targets = if options.sources.is_empty() {
            self.registry.names()
        } else {
            options.sources.clone()
        };

        log::info!("🚀 Running {} source(s): {}", targets.len(), targets.join(", "));
        log::info!(
            "   └─ Sinks: {}",
            self.sinks
                .iter()
                .map(|s| s.sink_type())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut running = Vec::with_capacity(targets.len());
        for name in targets {
            let Some(adapter) = self.registry.get(&name) else {
                running.push(PendingSource::Done(SourceReport::failed(
                    name.clone(),
                    LoaderError::UnknownSource(name),
                    Duration::ZERO,
                )));
                continue;
            };

            let pipeline = SourcePipeline {
                adapter,
                stale: self.stale.clone(),
                sinks: self.sinks.clone(),
            };
            let ctx = SourceContext::new(options.states.clone(), self.cancel_tx.subscribe());
            let handle = tokio::spawn(pipeline.run(ctx, options.timeout));
            running.push(PendingSource::Running(name, handle));
        }

        let mut reports = Vec::with_capacity(running.len());
        for pending in running {
            let report = match pending {
                PendingSource::Done(report) => report,
                PendingSource::Running(name, handle) => match handle.await {
                    Ok(report) => report,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(&*e.into_panic());
                        SourceReport::failed(name, LoaderError::Panicked(message), started.elapsed())
                    }
                    Err(_) => SourceReport::failed(name, LoaderError::Cancelled, started.elapsed()),
                },
            };
            self.log_report(&report);
            reports.push(report);
        }

        let delivery = match &self.queue {
            Some(queue) => {
                log::info!("📮 Waiting for {} update(s) to finish sending to API...", queue.pending());
                let cancel = SourceContext::new(None, self.cancel_tx.subscribe());
                let outcomes = tokio::select! {
                    outcomes = queue.when_done() => outcomes,
                    _ = cancel.cancelled() => {
                        queue.cancel();
                        queue.when_done().await
                    }
                };
                let tally = classify_outcomes(&outcomes, self.metrics.as_ref());
                log::info!(
                    "📮 Sent {} update(s): {} ok, {} out of date, {} failed, {} cancelled",
                    tally.sent,
                    tally.succeeded,
                    tally.out_of_date,
                    tally.failed,
                    tally.cancelled
                );
                Some(tally)
            }
            None => None,
        };

        let status = ExitStatus::from_reports(&reports);
        RunSummary {
            reports,
            delivery,
            status,
            elapsed: started.elapsed(),
        }
    }

    fn log_report(&self, report: &SourceReport) {
        let result_tag = if report.is_success() { "result:ok" } else { "result:error" };
        self.metrics.increment(
            "loader.sources.run",
            1,
            &[format!("source:{}", report.name), result_tag.to_string()],
        );

        match &report.error {
            Some(error) => log::error!("❌ Error in \"{}\": {}", report.name, error),
            None => log::info!(
                "✅ {}: {} record(s), {} stale, {} written in {:.1}s",
                report.name,
                report.produced,
                report.stale,
                report.written,
                report.elapsed.as_secs_f64()
            ),
        }
    }
}

enum PendingSource {
    Done(SourceReport),
    Running(String, JoinHandle<SourceReport>),
}

#[derive(Default)]
struct Counts {
    produced: usize,
    stale: usize,
    written: usize,
}

/// Everything one spawned source task needs.
struct SourcePipeline {
    adapter: Arc<dyn SourceAdapter>,
    stale: Arc<Mutex<StaleChecker>>,
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl SourcePipeline {
    async fn run(self, ctx: SourceContext, timeout: Option<Duration>) -> SourceReport {
        let started = Instant::now();
        let name = self.adapter.name().to_string();
        let mut counts = Counts::default();

        let result = tokio::select! {
            result = with_timeout(timeout, self.process(&ctx, &mut counts)) => result,
            _ = ctx.cancelled() => Err(LoaderError::Cancelled),
        };

        SourceReport {
            name,
            error: result.err(),
            produced: counts.produced,
            stale: counts.stale,
            written: counts.written,
            elapsed: started.elapsed(),
        }
    }

    async fn process(&self, ctx: &SourceContext, counts: &mut Counts) -> Result<(), LoaderError> {
        let outputs = self.adapter.check_availability(ctx).await?;
        counts.produced = outputs.len();

        for output in outputs {
            let (record, options) = output.into_pair();

            let stale = lock_checker(&self.stale).is_stale(&record);
            if stale {
                counts.stale += 1;
                log::debug!("Dropping stale record {} from {}", record.describe(), self.adapter.name());
                continue;
            }

            for sink in &self.sinks {
                sink.write_record(&record, options).await?;
            }
            counts.written += 1;
        }

        Ok(())
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, work: F) -> Result<(), LoaderError>
where
    F: Future<Output = Result<(), LoaderError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(Err(LoaderError::Timeout(limit))),
        None => work.await,
    }
}

fn lock_checker(stale: &Mutex<StaleChecker>) -> MutexGuard<'_, StaleChecker> {
    stale.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reports staleness statistics when the run ends, including on early
/// return or when the run future is dropped.
struct RunFinalizer {
    stale: Arc<Mutex<StaleChecker>>,
    metrics: Arc<dyn MetricsSink>,
    started: Instant,
}

impl Drop for RunFinalizer {
    fn drop(&mut self) {
        let mut checker = lock_checker(&self.stale);
        checker.print_summary();
        checker.send_metrics(METRICS_PREFIX, self.metrics.as_ref());
        log::info!("Completed in {:.3} seconds.", self.started.elapsed().as_secs_f64());
    }
}
