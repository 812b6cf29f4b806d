//! Production [`MetadataFetcher`] backed by the remote archive's HTTP
//! metadata endpoint.

use async_trait::async_trait;
use skyvault_archive_models::{Chunk, ExposureRecord, ProductType, TimeRange};

use crate::{ArchiveConfig, ArchiveError, MetadataFetcher, query, records, retry};

/// HTTP client for the remote metadata archive.
///
/// One instance can serve any product type; the product selects the
/// URL path segment and response schema per request. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    client: reqwest::Client,
    config: ArchiveConfig,
}

impl ArchiveClient {
    /// Builds a client from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let client = reqwest::Client::builder()
            .user_agent("skyvault/0.1 (https://github.com/skyvault/skyvault)")
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// Builds a client from environment configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn from_env() -> Result<Self, ArchiveError> {
        Self::new(ArchiveConfig::from_env())
    }

    /// The configured position-search radius, degrees.
    #[must_use]
    pub const fn search_radius_deg(&self) -> f64 {
        self.config.search_radius_deg
    }
}

#[async_trait]
impl MetadataFetcher for ArchiveClient {
    async fn fetch_chunk(&self, chunk: &Chunk) -> Result<Vec<ExposureRecord>, ArchiveError> {
        let url = query::chunk_url(&self.config.base_url, chunk);
        log::debug!("fetching {chunk}: {url}");

        let body = retry::send_csv(|| self.client.get(&url)).await?;
        let records = records::parse_batch(chunk.product, &body)?;

        log::debug!("{chunk}: {} records", records.len());
        Ok(records)
    }

    async fn fetch_by_position(
        &self,
        product: ProductType,
        ra: f64,
        dec: f64,
        window: &TimeRange,
    ) -> Result<Vec<ExposureRecord>, ArchiveError> {
        let url = query::position_url(
            &self.config.base_url,
            product,
            ra,
            dec,
            self.config.search_radius_deg,
            window,
        );
        log::debug!("position query ({ra:.5}, {dec:.5}) {window}: {url}");

        let body = retry::send_csv(|| self.client.get(&url)).await?;
        records::parse_batch(product, &body)
    }
}
