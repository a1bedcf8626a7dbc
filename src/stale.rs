//! Staleness engine
//!
//! Infers how old each record's availability data is and keeps per-source
//! age statistics for the run. One checker is owned by the orchestrator and
//! shared between source pipelines behind a mutex.

use crate::metrics::MetricsSink;
use crate::model::{start_of_day_utc, LocationRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Records older than this are dropped by `filter_record` unless configured.
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 24 * 60 * 60 * 1000;

/// Running age statistics for one source (ages in milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct AgeStatistics {
    pub source: String,
    pub samples: Vec<i64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub average: Option<f64>,
    pub median: Option<f64>,
}

impl AgeStatistics {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            samples: Vec::new(),
            min: None,
            max: None,
            average: None,
            median: None,
        }
    }

    fn add_sample(&mut self, age: i64) {
        self.samples.push(age);
        self.min = Some(self.min.map_or(age, |min| min.min(age)));
        self.max = Some(self.max.map_or(age, |max| max.max(age)));
        self.average = None;
        self.median = None;
    }

    fn compute_summary(&mut self) {
        if self.samples.is_empty() {
            return;
        }

        self.samples.sort_unstable();
        let count = self.samples.len();
        let sum: i64 = self.samples.iter().sum();
        self.average = Some(sum as f64 / count as f64);
        self.median = Some(if count % 2 == 0 {
            (self.samples[count / 2 - 1] + self.samples[count / 2]) as f64 / 2.0
        } else {
            self.samples[count / 2] as f64
        });
    }
}

pub struct StaleChecker {
    by_source: BTreeMap<String, AgeStatistics>,

    /// Whether average/median are current for every source
    finished: bool,

    relative_time: DateTime<Utc>,
    threshold_ms: i64,
}

impl StaleChecker {
    pub fn new(relative_time: DateTime<Utc>, threshold_ms: i64) -> Self {
        Self {
            by_source: BTreeMap::new(),
            finished: true,
            relative_time,
            threshold_ms,
        }
    }

    /// Checker measuring against the current time with the default threshold.
    pub fn with_defaults() -> Self {
        Self::new(Utc::now(), DEFAULT_STALE_THRESHOLD_MS)
    }

    pub fn threshold_ms(&self) -> i64 {
        self.threshold_ms
    }

    pub fn relative_time(&self) -> DateTime<Utc> {
        self.relative_time
    }

    /// Age of `record` in ms relative to the checker's reference time,
    /// recorded into its source's statistics.
    pub fn check_record(&mut self, record: &LocationRecord) -> Option<i64> {
        self.check_record_at(record, self.relative_time)
    }

    /// Like `check_record`, measured against `now`.
    pub fn check_record_at(&mut self, record: &LocationRecord, now: DateTime<Utc>) -> Option<i64> {
        let availability = record.availability.as_ref()?;

        // Register the source even when the age is unknown so the summary can
        // say there was no age information.
        let stats = self
            .by_source
            .entry(availability.source.clone())
            .or_insert_with(|| AgeStatistics::new(&availability.source));

        let age = calculate_age(now, record)?;
        stats.add_sample(age);
        self.finished = false;

        Some(age)
    }

    /// Record the age of `record` and report whether it is over the
    /// threshold. Records of unknown age are never stale.
    pub fn is_stale(&mut self, record: &LocationRecord) -> bool {
        matches!(self.check_record(record), Some(age) if age > self.threshold_ms)
    }

    /// `None` only when the record's age is known and over the threshold.
    pub fn filter_record(&mut self, record: LocationRecord) -> Option<LocationRecord> {
        if self.is_stale(&record) {
            None
        } else {
            Some(record)
        }
    }

    /// Compute average and median for any source with new samples.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        for stats in self.by_source.values_mut() {
            stats.compute_summary();
        }
        self.finished = true;
    }

    /// Per-source statistics, sorted by source name. Sources that never
    /// produced an age are only listed with `include_unknown`.
    pub fn list_statistics(&mut self, include_unknown: bool) -> Vec<AgeStatistics> {
        self.finish();
        self.by_source
            .values()
            .filter(|stats| include_unknown || !stats.samples.is_empty())
            .cloned()
            .collect()
    }

    /// Log a warning block for every source with stale or missing age data.
    pub fn print_summary(&mut self) {
        self.finish();

        for stats in self.by_source.values() {
            match stats.max {
                None => {
                    log::error!("No age information for locations in {}.", stats.source);
                }
                Some(max) if max > self.threshold_ms => {
                    log::error!(
                        "{} has stale data!\n  Minimum age: {}\n  Maximum age: {}\n  Average age: {}\n  Median age:  {}",
                        stats.source,
                        format_age(stats.min.unwrap_or(max) as f64),
                        format_age(max as f64),
                        format_age(stats.average.unwrap_or(max as f64)),
                        format_age(stats.median.unwrap_or(max as f64)),
                    );
                }
                Some(_) => {}
            }
        }
    }

    /// Report `{prefix}.age_seconds.{min,max,avg,median}` per source.
    pub fn send_metrics(&mut self, prefix: &str, metrics: &dyn MetricsSink) {
        for stats in self.list_statistics(false) {
            let tags = vec![format!("source:{}", stats.source)];
            let values = [
                ("min", stats.min.map(|v| v as f64)),
                ("max", stats.max.map(|v| v as f64)),
                ("avg", stats.average),
                ("median", stats.median),
            ];
            for (name, value) in values {
                if let Some(ms) = value {
                    metrics.gauge(&format!("{}.age_seconds.{}", prefix, name), ms / 1000.0, &tags);
                }
            }
        }
    }
}

/// How old a record's availability data is, in ms, or `None` if unknown.
///
/// Takes the larger (staler) of the age from `valid_at` and the age of the
/// last slot's start (or the last capacity day). A present but empty slot or capacity list means there
/// should have been data that could contradict `valid_at`, so the age is
/// unknown rather than trusted from `valid_at` alone.
pub fn calculate_age(now: DateTime<Utc>, record: &LocationRecord) -> Option<i64> {
    let data = record.availability.as_ref()?;

    let valid_age = data
        .valid_at
        .map(|valid_at| (now - valid_at.to_utc()).num_milliseconds());

    let slots_age = if let Some(slots) = &data.slots {
        let last = slots.last()?;
        Some((now - last.start.with_timezone(&Utc)).num_milliseconds())
    } else if let Some(capacity) = &data.capacity {
        let last = capacity.last()?;
        Some((now - start_of_day_utc(last.date)).num_milliseconds())
    } else {
        None
    };

    let age = match (valid_age, slots_age) {
        (None, None) => return None,
        (Some(a), None) | (None, Some(a)) => a,
        (Some(a), Some(b)) => a.max(b),
    };

    Some(age.max(0))
}

/// Render milliseconds like "1 day, 2 hours, 5 seconds", rounded up to a
/// whole second.
pub fn format_age(ms: f64) -> String {
    let total_seconds = (ms.max(0.0) / 1000.0).ceil() as u64;
    if total_seconds == 0 {
        return "0 seconds".to_string();
    }

    let units = [
        ("day", 86_400),
        ("hour", 3_600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut remaining = total_seconds;
    let mut parts = Vec::new();
    for (name, size) in units {
        let count = remaining / size;
        remaining %= size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", count, name, plural));
        }
    }

    parts.join(", ")
}
