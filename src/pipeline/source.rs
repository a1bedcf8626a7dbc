//! Source adapter seam and registry

use crate::errors::LoaderError;
use crate::model::SourceOutput;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// What a source run is allowed to know about the run.
#[derive(Debug, Clone)]
pub struct SourceContext {
    states: Option<Vec<String>>,
    cancel_rx: watch::Receiver<bool>,
}

impl SourceContext {
    pub fn new(states: Option<Vec<String>>, cancel_rx: watch::Receiver<bool>) -> Self {
        Self { states, cancel_rx }
    }

    /// Context that can never be cancelled, for tests and one-off calls.
    pub fn detached(states: Option<Vec<String>>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(states, rx)
    }

    /// Requested state codes, if the run was limited to some states.
    pub fn states(&self) -> Option<&[String]> {
        self.states.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the run is cancelled. Never resolves if the cancel
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// A vendor integration that produces availability records.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Name used on the command line and in reports.
    fn name(&self) -> &str;

    /// Fetch current availability. Each output is either a bare record or a
    /// record paired with delivery options.
    async fn check_availability(
        &self,
        ctx: &SourceContext,
    ) -> Result<Vec<SourceOutput>, LoaderError>;
}

/// Source adapters by name, in registration order.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    order: Vec<String>,
    sources: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any earlier one.
    pub fn register(&mut self, source: Arc<dyn SourceAdapter>) {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), source).is_none() {
            self.order.push(name);
        }
    }

    pub fn with(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.sources.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
