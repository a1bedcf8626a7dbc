//! Integration tests for the loader pipeline
//!
//! Key integration points tested:
//! - Per-source failure isolation and exit status
//! - Update queue concurrency bound under the orchestrator
//! - out_of_date rejections vs. real delivery failures
//! - Cancellation reaching queued updates
//! - SMART SL publisher -> SmartSource -> sink, end to end

#[cfg(test)]
mod pipeline_integration_tests {
    use async_trait::async_trait;
    use availflow::delivery::{Deliverer, UpdateQueue, UpdateResponse};
    use availflow::errors::{DeliveryError, LoaderError};
    use availflow::metrics::RecordingMetrics;
    use availflow::model::{Availability, Available, DeliveryOptions, LocationRecord, SourceOutput};
    use availflow::pipeline::{
        ExitStatus, MemorySink, Orchestrator, RunOptions, SourceAdapter, SourceContext,
        SourceRegistry,
    };
    use availflow::smart::{systems, StaticFetcher};
    use availflow::sources::{SmartSource, SmartSourceConfig};
    use availflow::stale::{StaleChecker, DEFAULT_STALE_THRESHOLD_MS};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Adapter returning a fixed number of fresh records, or an error.
    struct FixedSource {
        name: &'static str,
        count: usize,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn check_availability(
            &self,
            _ctx: &SourceContext,
        ) -> Result<Vec<SourceOutput>, LoaderError> {
            if self.fail {
                return Err(LoaderError::source_failure(format!("{} is down", self.name)));
            }
            Ok((0..self.count)
                .map(|i| {
                    let mut availability = Availability::new(self.name, Utc::now(), Available::Yes);
                    availability.valid_at = Some(Utc::now().into());
                    SourceOutput::from(LocationRecord {
                        name: format!("{} store {}", self.name, i),
                        availability: Some(availability),
                        ..Default::default()
                    })
                })
                .collect())
        }
    }

    /// Deliverer that tracks how many sends are in flight at once.
    #[derive(Default)]
    struct GaugedDeliverer {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Deliverer for GaugedDeliverer {
        async fn send_update(
            &self,
            record: &LocationRecord,
            _options: DeliveryOptions,
        ) -> Result<UpdateResponse, DeliveryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.sent.fetch_add(1, Ordering::SeqCst);

            if record.name.ends_with(" 0") {
                return Err(DeliveryError::Rejected {
                    status: 409,
                    code: Some("out_of_date".to_string()),
                    message: "newer data exists".to_string(),
                });
            }
            if record.name.ends_with(" 1") {
                return Err(DeliveryError::Rejected {
                    status: 400,
                    code: Some("value_error".to_string()),
                    message: "bad state".to_string(),
                });
            }
            Ok(UpdateResponse {
                status: 200,
                ..Default::default()
            })
        }
    }

    fn checker() -> StaleChecker {
        StaleChecker::new(Utc::now(), DEFAULT_STALE_THRESHOLD_MS)
    }

    #[tokio::test]
    async fn test_two_of_three_sources_fail() {
        // 1. Three sources, two of which fail
        let registry = SourceRegistry::new()
            .with(Arc::new(FixedSource { name: "ok", count: 2, fail: false }))
            .with(Arc::new(FixedSource { name: "down1", count: 0, fail: true }))
            .with(Arc::new(FixedSource { name: "down2", count: 0, fail: true }));
        let sink = Arc::new(MemorySink::new());
        let orchestrator =
            Orchestrator::new(registry, checker(), Arc::new(RecordingMetrics::new())).with_sink(sink.clone());

        // 2. Run all of them
        let summary = orchestrator.run(RunOptions::default()).await;

        // 3. Every source reported, partial failure exit code
        assert_eq!(summary.reports.len(), 3);
        assert_eq!(summary.status, ExitStatus::PartialFailure);
        assert_eq!(summary.status.code(), 91);
        assert_eq!(sink.records().len(), 2);
        let names: Vec<&str> = summary.failed_sources().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["down1", "down2"]);
    }

    #[tokio::test]
    async fn test_send_through_queue_is_bounded_and_classified() {
        // 1. Ten records sent through a queue with four workers
        let deliverer = Arc::new(GaugedDeliverer::default());
        let queue = Arc::new(UpdateQueue::new(deliverer.clone(), 4));
        let registry =
            SourceRegistry::new().with(Arc::new(FixedSource { name: "ok", count: 10, fail: false }));
        let metrics = Arc::new(RecordingMetrics::new());
        let orchestrator = Orchestrator::new(registry, checker(), metrics.clone()).with_queue(queue);

        // 2. Run and drain
        let summary = orchestrator.run(RunOptions::default()).await;

        // 3. All delivered, never more than four at once
        assert_eq!(summary.status, ExitStatus::Success);
        assert_eq!(deliverer.sent.load(Ordering::SeqCst), 10);
        assert!(deliverer.max_in_flight.load(Ordering::SeqCst) <= 4);

        // 4. out_of_date is counted apart from real failures
        let tally = summary.delivery.expect("queue was configured");
        assert_eq!(tally.sent, 10);
        assert_eq!(tally.succeeded, 8);
        assert_eq!(tally.out_of_date, 1);
        assert_eq!(tally.failed, 1);
        let failed = metrics
            .points()
            .into_iter()
            .find(|p| p.name == "loader.jobs.send.failed")
            .map(|p| p.value);
        assert_eq!(failed, Some(1.0));
    }

    #[tokio::test]
    async fn test_cancel_reaches_the_update_queue() {
        // 1. Forty records behind a single slow worker
        let deliverer = Arc::new(GaugedDeliverer::default());
        let queue = Arc::new(UpdateQueue::new(deliverer.clone(), 1));
        let registry =
            SourceRegistry::new().with(Arc::new(FixedSource { name: "ok", count: 40, fail: false }));
        let orchestrator = Orchestrator::new(registry, checker(), Arc::new(RecordingMetrics::new()))
            .with_queue(queue.clone());

        // 2. Cancel shortly after the run starts draining
        let cancel = orchestrator.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let summary = tokio::time::timeout(Duration::from_secs(2), orchestrator.run(RunOptions::default()))
            .await
            .expect("run kept sending after cancel");

        // 3. Most updates were abandoned rather than sent
        let tally = summary.delivery.expect("queue was configured");
        assert_eq!(tally.sent, 40);
        assert!(tally.cancelled > 0);
        assert!(deliverer.sent.load(Ordering::SeqCst) < 40);
        assert!(queue.is_cancelled());
    }

    fn smart_fetcher(manifest_url: &str, transaction_time: DateTime<Utc>) -> StaticFetcher {
        let manifest = json!({
            "transactionTime": transaction_time.to_rfc3339(),
            "request": manifest_url,
            "output": [
                {"type": "Location", "url": "https://pub.test/NJ/locations.ndjson"},
                {"type": "Location", "url": "https://pub.test/NY/locations.ndjson"},
                {"type": "Schedule", "url": "https://pub.test/schedules.ndjson"},
                {"type": "Slot", "url": "https://pub.test/slots.ndjson"}
            ]
        });
        let location = |id: &str, state: &str| {
            json!({
                "resourceType": "Location",
                "id": id,
                "identifier": [{"system": systems::NPI_USA, "value": format!("npi-{}", id)}],
                "name": format!("Pharmacy {}", id),
                "telecom": [],
                "address": {"line": ["1 Main St"], "city": "Town", "state": state, "postalCode": "00001"}
            })
        };
        let schedule = json!({
            "resourceType": "Schedule",
            "id": "S1",
            "actor": [{"reference": "Location/L1"}],
            "serviceType": [{"coding": [{"system": systems::HL7_SERVICE_TYPE, "code": "57"}]}]
        });
        // Slots on the manifest's day and the day after.
        let day = transaction_time.date_naive();
        let slot = |id: &str, status: &str, date: chrono::NaiveDate| {
            json!({
                "resourceType": "Slot", "id": id, "schedule": {"reference": "Schedule/S1"},
                "status": status,
                "start": format!("{}T09:00:00Z", date),
                "end": format!("{}T09:15:00Z", date)
            })
        };
        let slots = [
            slot("a", "free", day),
            slot("b", "busy", day + chrono::Duration::days(1)),
        ];
        let ndjson = |records: &[serde_json::Value]| {
            records.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("\n")
        };

        StaticFetcher::new()
            .with_body(manifest_url, manifest.to_string())
            .with_body("https://pub.test/NJ/locations.ndjson", location("L1", "NJ").to_string())
            .with_body("https://pub.test/NY/locations.ndjson", location("L2", "NY").to_string())
            .with_body("https://pub.test/schedules.ndjson", schedule.to_string())
            .with_body("https://pub.test/slots.ndjson", ndjson(&slots))
    }

    #[tokio::test]
    async fn test_smart_source_end_to_end() {
        // 1. A publisher with one NJ and one NY location
        let manifest_url = "https://pub.test/$bulk-publish";
        let fetcher = Arc::new(smart_fetcher(manifest_url, Utc::now()));
        let source = SmartSource::new(SmartSourceConfig::kroger().with_manifest_url(manifest_url), fetcher.clone());
        let registry = SourceRegistry::new().with(Arc::new(source));
        let sink = Arc::new(MemorySink::new());
        let orchestrator =
            Orchestrator::new(registry, checker(), Arc::new(RecordingMetrics::new())).with_sink(sink.clone());

        // 2. Run for NJ only
        let summary = orchestrator
            .run(RunOptions {
                states: Some(vec!["NJ".to_string()]),
                ..Default::default()
            })
            .await;

        // 3. Only the NJ file was read and only its location was written
        assert_eq!(summary.status, ExitStatus::Success);
        assert_eq!(fetcher.hits("https://pub.test/NY/locations.ndjson"), 0);
        let records = sink.records();
        assert_eq!(records.len(), 1);

        let (record, options) = &records[0];
        assert!(options.update_location);
        assert_eq!(record.name, "Pharmacy L1");
        assert_eq!(
            record.external_ids,
            vec![
                ("kroger".to_string(), "L1".to_string()),
                ("npi_usa".to_string(), "npi-L1".to_string()),
            ]
        );
        let availability = record.availability.as_ref().unwrap();
        assert_eq!(availability.available, Available::Yes);
        assert_eq!(availability.capacity.as_ref().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_stale_smart_data_is_dropped() {
        // 1. Manifest written three days ago
        let manifest_url = "https://stale.test/$bulk-publish";
        let old = Utc::now() - chrono::Duration::days(3);
        let fetcher = Arc::new(smart_fetcher(manifest_url, old));
        let source = SmartSource::new(SmartSourceConfig::kroger().with_manifest_url(manifest_url), fetcher);
        let registry = SourceRegistry::new().with(Arc::new(source));
        let sink = Arc::new(MemorySink::new());
        let orchestrator =
            Orchestrator::new(registry, checker(), Arc::new(RecordingMetrics::new())).with_sink(sink.clone());

        // 2. Run
        let summary = orchestrator.run(RunOptions::default()).await;

        // 3. Source succeeded but nothing fresh enough reached the sink
        assert_eq!(summary.status, ExitStatus::Success);
        assert_eq!(summary.reports[0].produced, 2);
        assert_eq!(summary.reports[0].stale, 2);
        assert!(sink.records().is_empty());

        let stats = orchestrator
            .stale_checker()
            .lock()
            .unwrap()
            .list_statistics(false);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source, "univaf-kroger-smart");
    }
}
