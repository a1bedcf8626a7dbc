//! Manifest cache and lazy record streams for one SMART SL publisher

use super::fetch::Fetcher;
use super::join::{join_locations, JoinedLocations};
use super::manifest::{Manifest, ManifestEntry, ResourceType};
use super::resources::{Location, Resource, Schedule, Slot, Sourced};
use crate::errors::SmartError;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long a fetched manifest is trusted before it is fetched again.
pub const MANIFEST_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

struct CachedManifest {
    fetched_at: DateTime<Utc>,
    manifest: Arc<Manifest>,
}

/// Client for one publisher's bulk-publish endpoint.
///
/// Each vendor integration owns its own client; the manifest cache is never
/// shared between publishers.
pub struct SmartClient {
    url: String,
    fetcher: Arc<dyn Fetcher>,

    /// Run `Resource::validate` on every record, not just the serde parse
    validate: bool,

    /// Held across the fetch so concurrent callers share one request
    manifest: Mutex<Option<CachedManifest>>,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SmartClient {
    /// Create a client for the manifest at `url` (usually ending in
    /// `$bulk-publish`).
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new_with_clock(url, fetcher, Box::new(Utc::now))
    }

    /// Create a client with a custom clock, used for deterministic tests.
    pub fn new_with_clock(
        url: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            url: url.into(),
            fetcher,
            validate: true,
            manifest: Mutex::new(None),
            now_fn,
        }
    }

    /// Turn strict record validation on or off (serde typing always applies).
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cached manifest, or a fresh one if the cache is empty or expired.
    ///
    /// A manifest that fails to parse is never cached.
    pub async fn get_manifest(&self) -> Result<Arc<Manifest>, SmartError> {
        let mut cache = self.manifest.lock().await;

        if let Some(cached) = cache.as_ref() {
            // A clock that went backwards reads as a fresh cache.
            let fresh = ((self.now_fn)() - cached.fetched_at)
                .to_std()
                .map_or(true, |age| age <= MANIFEST_CACHE_TIME);
            if fresh {
                return Ok(cached.manifest.clone());
            }
            log::debug!("Manifest for {} expired, refetching", self.url);
        }

        let body = self.fetcher.fetch_text(&self.url).await?;
        let manifest: Manifest = serde_json::from_str(&body)
            .map_err(|e| SmartError::schema(format!("manifest from {}", self.url), e))?;
        let manifest = Arc::new(manifest);

        log::debug!(
            "📄 Fetched manifest {} ({} entries, transactionTime {})",
            self.url,
            manifest.entries.len(),
            manifest.transaction_time
        );

        *cache = Some(CachedManifest {
            fetched_at: (self.now_fn)(),
            manifest: manifest.clone(),
        });

        Ok(manifest)
    }

    /// Manifest entries of one type that may cover the requested states.
    pub async fn get_manifest_entries(
        &self,
        resource_type: ResourceType,
        states: Option<&[String]>,
    ) -> Result<Vec<Arc<ManifestEntry>>, SmartError> {
        let manifest = self.get_manifest().await?;
        Ok(manifest.entries_for(resource_type, states))
    }

    /// Stream every record of one type, one manifest entry at a time.
    ///
    /// The stream is forward-only and fetches each entry's file only when
    /// the previous one is exhausted. To start over, call again.
    pub fn list_items<'a>(
        &'a self,
        resource_type: ResourceType,
        states: Option<&'a [String]>,
    ) -> impl Stream<Item = Result<Sourced<Resource>, SmartError>> + 'a {
        stream::try_unfold(ListState::default(), move |state| {
            self.next_item(state, resource_type, states)
        })
    }

    pub fn list_locations<'a>(
        &'a self,
        states: Option<&'a [String]>,
    ) -> impl Stream<Item = Result<Sourced<Location>, SmartError>> + 'a {
        self.list_items(ResourceType::Location, states)
            .map(|item| narrow(item, Resource::into_location))
    }

    pub fn list_schedules<'a>(
        &'a self,
        states: Option<&'a [String]>,
    ) -> impl Stream<Item = Result<Sourced<Schedule>, SmartError>> + 'a {
        self.list_items(ResourceType::Schedule, states)
            .map(|item| narrow(item, Resource::into_schedule))
    }

    pub fn list_slots<'a>(
        &'a self,
        states: Option<&'a [String]>,
    ) -> impl Stream<Item = Result<Sourced<Slot>, SmartError>> + 'a {
        self.list_items(ResourceType::Slot, states)
            .map(|item| narrow(item, Resource::into_slot))
    }

    /// Read every stream and join them into per-location aggregates.
    pub async fn get_locations(
        &self,
        states: Option<&[String]>,
    ) -> Result<JoinedLocations, SmartError> {
        join_locations(self, states).await
    }

    async fn next_item(
        &self,
        mut state: ListState,
        resource_type: ResourceType,
        states: Option<&[String]>,
    ) -> Result<Option<(Sourced<Resource>, ListState)>, SmartError> {
        loop {
            if let Some((entry, line_no, line)) = state.next_line() {
                let record = self.parse_record(&entry, line_no, &line)?;
                return Ok(Some((Sourced::new(record, entry), state)));
            }

            if state.entries.is_none() {
                let entries = self.get_manifest_entries(resource_type, states).await?;
                state.entries = Some(entries.into());
            }

            let Some(entry) = state.entries.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };

            let body = self.fetcher.fetch_text(&entry.url).await?;
            state.lines = body
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(i, line)| (i + 1, line.to_string()))
                .collect();
            state.current = Some(entry);
        }
    }

    fn parse_record(
        &self,
        entry: &ManifestEntry,
        line_no: usize,
        line: &str,
    ) -> Result<Resource, SmartError> {
        let context = || format!("{} record at {}:{}", entry.resource_type, entry.url, line_no);

        let record: Resource =
            serde_json::from_str(line).map_err(|e| SmartError::schema(context(), e))?;

        if record.resource_type() != entry.resource_type {
            return Err(SmartError::schema(
                context(),
                format!("found a {} record", record.resource_type()),
            ));
        }

        if self.validate {
            record
                .validate()
                .map_err(|message| SmartError::schema(context(), message))?;
        }

        Ok(record)
    }
}

#[derive(Default)]
struct ListState {
    entries: Option<VecDeque<Arc<ManifestEntry>>>,
    current: Option<Arc<ManifestEntry>>,
    lines: VecDeque<(usize, String)>,
}

impl ListState {
    fn next_line(&mut self) -> Option<(Arc<ManifestEntry>, usize, String)> {
        let entry = self.current.clone()?;
        let (line_no, line) = self.lines.pop_front()?;
        Some((entry, line_no, line))
    }
}

fn narrow<T>(
    item: Result<Sourced<Resource>, SmartError>,
    convert: fn(Resource) -> Result<T, ResourceType>,
) -> Result<Sourced<T>, SmartError> {
    let sourced = item?;
    let url = sourced.source_entry().url.clone();
    sourced.map(convert).transpose().map_err(|found| {
        SmartError::schema(format!("record from {}", url), format!("unexpected {} record", found))
    })
}
