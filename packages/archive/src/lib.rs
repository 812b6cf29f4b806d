#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Remote archive fetcher.
//!
//! Issues one HTTP query per [`Chunk`] or position lookup against the
//! metadata archive, with retry/backoff for transient failures, and
//! validates the tabular CSV payload into typed [`ExposureRecord`]s at
//! this boundary. Consumers depend on the [`MetadataFetcher`] trait so
//! ingestion and federated queries can be driven by test doubles.

pub mod client;
pub mod progress;
pub mod query;
pub mod records;
pub mod retry;

use async_trait::async_trait;
use skyvault_archive_models::{Chunk, ExposureRecord, ProductType, TimeRange};

pub use client::ArchiveClient;

/// Default remote archive endpoint for metadata searches.
pub const DEFAULT_ARCHIVE_URL: &str = "https://irsa.ipac.caltech.edu/ibe/search/ztf/products";

/// Environment variable overriding the archive endpoint.
pub const ARCHIVE_URL_ENV: &str = "SKYVAULT_ARCHIVE_URL";

/// Errors that can occur while fetching from the remote archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// HTTP transport failed (after retries, for transient errors).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status that either is
    /// permanent (4xx) or survived all retries (429/5xx).
    #[error("HTTP {status} from {url}")]
    Status {
        /// Response status code.
        status: u16,
        /// Request URL, for diagnosis.
        url: String,
    },

    /// The response arrived but could not be validated into records.
    ///
    /// Never retried: a schema mismatch will not fix itself.
    #[error("malformed archive response: {message}")]
    Malformed {
        /// Description of what failed to parse.
        message: String,
    },
}

impl ArchiveError {
    /// `true` for responses that arrived but failed validation, as
    /// opposed to transport/status failures. Accounted identically but
    /// logged distinctly by callers.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Configuration for the remote archive client.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base URL of the metadata search endpoint.
    pub base_url: String,
    /// Search radius for position queries, degrees.
    pub search_radius_deg: f64,
    /// Per-request timeout.
    pub timeout: std::time::Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ARCHIVE_URL.to_string(),
            search_radius_deg: skyvault_archive_models::spatial::QUADRANT_RADIUS_DEG,
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

impl ArchiveConfig {
    /// Builds a config from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ARCHIVE_URL_ENV) {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        config
    }
}

/// Trait all remote metadata fetchers implement.
///
/// The production implementation is [`ArchiveClient`]; tests substitute
/// doubles. Both methods share the same retry/backoff contract.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetches all records for one night-span chunk. An empty batch is
    /// a normal outcome (nothing was observed in the span).
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the request fails after retries or
    /// the response cannot be validated.
    async fn fetch_chunk(&self, chunk: &Chunk) -> Result<Vec<ExposureRecord>, ArchiveError>;

    /// Fetches all records whose footprint can contain the given sky
    /// position, within the given time window.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the request fails after retries or
    /// the response cannot be validated.
    async fn fetch_by_position(
        &self,
        product: ProductType,
        ra: f64,
        dec: f64,
        window: &TimeRange,
    ) -> Result<Vec<ExposureRecord>, ArchiveError>;
}
