//! Catalog and asset manager for digitized Chinese paintings.
//!
//! Images live in a flat directory, each accompanied by a JSON sidecar and
//! indexed by a row in the catalog database keyed on the content
//! fingerprint. [`catalog::Catalog`] keeps the three consistent.

pub mod catalog;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod export;
pub mod logging;
pub mod scanner;
pub mod sidecar;
pub mod stats;
pub mod storage;
pub mod trash;

pub use catalog::{Catalog, UploadFields, UploadOutcome};
pub use config::Config;
pub use error::{CatalogError, Result};
