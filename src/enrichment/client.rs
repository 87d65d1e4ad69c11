use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::provider::{create_provider, EnrichmentProvider};
use crate::catalog::{Catalog, UploadOutcome};
use crate::config::EnrichmentConfig;
use crate::error::{CatalogError, Result};
use crate::sidecar::{Sidecar, Tag};

/// What an enrichment pass did to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    /// Fields that were empty before and now have a value.
    Enriched { filled: Vec<String> },
    /// The service answered but had nothing new to add.
    Unchanged,
    /// The pass did not run to completion; the record is untouched.
    Skipped { reason: String },
}

/// Result of a validation pass. Corrections are merged like an enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub details: String,
    pub corrections: EnrichmentOutcome,
}

/// Runs enrichment and validation against a catalog.
///
/// Every call is bounded by a timeout and never fails the caller: service
/// errors are logged and reported as [`EnrichmentOutcome::Skipped`].
pub struct Enricher {
    provider: Arc<dyn EnrichmentProvider>,
    timeout: Duration,
}

impl Enricher {
    pub fn new(provider: Arc<dyn EnrichmentProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn from_config(config: &EnrichmentConfig) -> Self {
        let provider = create_provider(config);
        // Leave the HTTP agent's own timeout room to fire first.
        let timeout = Duration::from_secs(config.timeout_secs.saturating_add(5));
        Self::new(Arc::from(provider), timeout)
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EnrichmentProvider) -> anyhow::Result<T> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let task = tokio::task::spawn_blocking(move || f(provider.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(CatalogError::ExternalService(format!(
                "{} timed out after {}s",
                self.provider.provider_name(),
                self.timeout.as_secs_f32()
            ))),
            Ok(Err(join)) => Err(CatalogError::ExternalService(join.to_string())),
            Ok(Ok(Err(e))) => Err(CatalogError::ExternalService(e.to_string())),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Asks the service for missing details of painting `id` and fills them in.
    pub async fn enrich_painting(&self, catalog: &Catalog, id: i64) -> EnrichmentOutcome {
        let payload = match record_payload(catalog, id) {
            Ok(payload) => payload,
            Err(e) => return skipped(id, e),
        };

        debug!("Enriching painting {} via {}", id, self.provider_name());
        match self.call(move |p| p.enrich(&payload)).await {
            Ok(suggestion) => apply(catalog, id, suggestion),
            Err(e) => skipped(id, e),
        }
    }

    /// Asks the service to check painting `id`. Suggested corrections only
    /// fill fields that are still empty.
    pub async fn validate_painting(&self, catalog: &Catalog, id: i64) -> ValidationReport {
        let payload = match record_payload(catalog, id) {
            Ok(payload) => payload,
            Err(e) => return failed_validation(id, e),
        };

        match self.call(move |p| p.validate(&payload)).await {
            Ok(verdict) => {
                let has_corrections = verdict
                    .corrected
                    .as_object()
                    .is_some_and(|m| !m.is_empty());
                let corrections = if has_corrections {
                    apply(catalog, id, verdict.corrected)
                } else {
                    EnrichmentOutcome::Unchanged
                };
                ValidationReport {
                    is_valid: verdict.is_valid,
                    details: verdict.details,
                    corrections,
                }
            }
            Err(e) => failed_validation(id, e),
        }
    }

    /// Enriches the record behind a fresh upload. Skipped uploads are left alone.
    pub async fn enrich_upload(&self, catalog: &Catalog, outcome: &UploadOutcome) -> Option<EnrichmentOutcome> {
        match outcome {
            UploadOutcome::Skipped { .. } => None,
            _ => Some(self.enrich_painting(catalog, outcome.id()).await),
        }
    }
}

/// The record as sent to the service: its sidecar, or the row alone when
/// the sidecar is missing.
fn record_payload(catalog: &Catalog, id: i64) -> Result<Value> {
    let doc = match catalog.sidecar(id) {
        Ok(doc) => doc,
        Err(CatalogError::NotFound(_)) | Err(CatalogError::Serialization(_)) => {
            Sidecar::from_painting(&catalog.get(id)?)
        }
        Err(e) => return Err(e),
    };
    Ok(serde_json::to_value(&doc)?)
}

fn apply(catalog: &Catalog, id: i64, suggestion: Value) -> EnrichmentOutcome {
    let suggestion = suggestion_from_value(suggestion);
    match catalog.apply_enrichment(id, &suggestion) {
        Ok(filled) if filled.is_empty() => EnrichmentOutcome::Unchanged,
        Ok(filled) => {
            info!("Painting {} enriched: {}", id, filled.join(", "));
            EnrichmentOutcome::Enriched {
                filled: filled.into_iter().map(str::to_string).collect(),
            }
        }
        Err(e) => skipped(id, e),
    }
}

fn skipped(id: i64, e: CatalogError) -> EnrichmentOutcome {
    warn!("Enrichment of painting {} skipped: {}", id, e);
    EnrichmentOutcome::Skipped {
        reason: e.to_string(),
    }
}

fn failed_validation(id: i64, e: CatalogError) -> ValidationReport {
    warn!("Validation of painting {} skipped: {}", id, e);
    ValidationReport {
        is_valid: false,
        details: String::new(),
        corrections: EnrichmentOutcome::Skipped {
            reason: e.to_string(),
        },
    }
}

/// Reads a service reply as a sidecar, dropping keys whose values have the
/// wrong shape instead of rejecting the whole reply.
fn suggestion_from_value(value: Value) -> Sidecar {
    let Value::Object(mut map) = value else {
        return Sidecar::default();
    };

    // Plain string tags are common in replies.
    if let Some(Value::Array(tags)) = map.get_mut("tags") {
        for tag in tags.iter_mut() {
            let named = match tag {
                Value::String(name) => serde_json::to_value(Tag::auto(name)).ok(),
                _ => None,
            };
            if let Some(named) = named {
                *tag = named;
            }
        }
    }

    if let Ok(doc) = serde_json::from_value::<Sidecar>(Value::Object(map.clone())) {
        return doc;
    }

    let mut accepted = Map::new();
    for (key, value) in map {
        let mut single = Map::new();
        single.insert(key.clone(), value.clone());
        if serde_json::from_value::<Sidecar>(Value::Object(single)).is_ok() {
            accepted.insert(key, value);
        } else {
            debug!("Dropping malformed suggestion field {}", key);
        }
    }
    serde_json::from_value(Value::Object(accepted)).unwrap_or_default()
}
