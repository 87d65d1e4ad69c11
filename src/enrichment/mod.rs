//! Optional enrichment of painting records by an external language model.
//!
//! Suggestions are merged with the fill-only sidecar policy, so a service
//! reply can add information but never replace what is already recorded.

pub mod client;
pub mod provider;

pub use client::{Enricher, EnrichmentOutcome, ValidationReport};
pub use provider::{create_provider, EnrichmentProvider, ValidationVerdict};
