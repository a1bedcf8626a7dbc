//! Built-in source adapters

pub mod smart;

pub use smart::{SmartSource, SmartSourceConfig, ValidTimeFrom};

use crate::pipeline::SourceRegistry;
use crate::smart::Fetcher;
use std::sync::Arc;

/// Registry with every built-in source, sharing one HTTP fetcher.
pub fn default_registry(fetcher: Arc<dyn Fetcher>) -> SourceRegistry {
    SourceRegistry::new()
        .with(Arc::new(SmartSource::new(SmartSourceConfig::walgreens(), fetcher.clone())))
        .with(Arc::new(SmartSource::new(SmartSourceConfig::kroger(), fetcher.clone())))
        .with(Arc::new(SmartSource::new(SmartSourceConfig::cvs(), fetcher)))
}
