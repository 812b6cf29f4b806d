#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Federated position queries.
//!
//! A position query is answered from the union of the local mirror and
//! the remote archive: the requested window is intersected with the
//! store's covered range, the covered part is served locally, and only
//! the uncovered remainder (before and/or after local coverage) is
//! fetched live. Results merge by natural key — the local row wins on
//! conflict, since it is authoritative once ingested — and come back
//! sorted ascending by observation time.

use std::collections::BTreeMap;

use chrono::Utc;
use skyvault_archive::{ArchiveError, MetadataFetcher};
use skyvault_archive_models::spatial::QUADRANT_RADIUS_DEG;
use skyvault_archive_models::time::night_to_date;
use skyvault_archive_models::{ExposureRecord, TimeRange};
use skyvault_database::{DbError, RecordStore};

/// Errors that can abort a federated query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The local store failed.
    #[error("store unavailable: {0}")]
    Store(#[from] DbError),

    /// A sub-range outside local coverage could not be fetched; no
    /// other source can serve it, so the query cannot be answered
    /// completely.
    #[error("remote fetch failed for uncovered range {window}: {source}")]
    RemoteGap {
        /// The sub-range that only the remote archive could serve.
        window: TimeRange,
        /// The underlying fetch error.
        #[source]
        source: ArchiveError,
    },
}

/// A store/fetcher pair answering position queries for one product
/// type.
pub struct FederatedQuery<'a> {
    fetcher: &'a dyn MetadataFetcher,
    store: &'a RecordStore,
    radius_deg: f64,
}

impl<'a> FederatedQuery<'a> {
    /// Pairs a store with a fetcher using the default quadrant-sized
    /// search radius.
    #[must_use]
    pub const fn new(fetcher: &'a dyn MetadataFetcher, store: &'a RecordStore) -> Self {
        Self {
            fetcher,
            store,
            radius_deg: QUADRANT_RADIUS_DEG,
        }
    }

    /// Overrides the search radius (degrees). Keep it consistent with
    /// the fetcher's configured radius, or local and remote halves of
    /// a query will disagree about marginal footprints.
    #[must_use]
    pub const fn with_radius(mut self, radius_deg: f64) -> Self {
        self.radius_deg = radius_deg;
        self
    }

    /// Returns every record whose footprint can contain `(ra, dec)`
    /// within the window, deduplicated by natural key and sorted
    /// ascending by observation time.
    ///
    /// With no window, the full archive history through *now* is
    /// queried (the end boundary is evaluated at call time).
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the local store fails or a required
    /// uncovered sub-range cannot be fetched remotely.
    pub async fn query_position(
        &self,
        ra: f64,
        dec: f64,
        window: Option<TimeRange>,
    ) -> Result<Vec<ExposureRecord>, QueryError> {
        let requested = window.unwrap_or_else(|| TimeRange::new(night_to_date(0), Utc::now()));
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let covered = self.store.covered_range()?;
        let (local, remote) = split_window(&requested, covered.as_ref());
        log::debug!(
            "position query ({ra:.5}, {dec:.5}) {requested}: local={}, remote gaps={}",
            local.map_or_else(|| "none".to_string(), |r| r.to_string()),
            remote.len(),
        );

        let mut merged: BTreeMap<String, ExposureRecord> = BTreeMap::new();

        for gap in &remote {
            let batch = self
                .fetcher
                .fetch_by_position(self.store.product(), ra, dec, gap)
                .await
                .map_err(|source| QueryError::RemoteGap {
                    window: *gap,
                    source,
                })?;
            log::debug!("remote gap {gap}: {} records", batch.len());
            for record in batch {
                merged.insert(record.natural_key.clone(), record);
            }
        }

        // Local rows land last so they overwrite any remote twin.
        if let Some(local) = local {
            let rows = self
                .store
                .query_by_position_and_time(ra, dec, self.radius_deg, &local)?;
            log::debug!("local range {local}: {} records", rows.len());
            for record in rows {
                merged.insert(record.natural_key.clone(), record);
            }
        }

        let mut records: Vec<ExposureRecord> = merged.into_values().collect();
        records.sort_by(|a, b| {
            a.obs_time
                .cmp(&b.obs_time)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        Ok(records)
    }
}

/// Splits a requested window into the locally-covered sub-range and
/// the zero, one, or two sub-ranges that must be fetched remotely.
///
/// Boundary instants are shared between the local and remote
/// sub-ranges (inclusive on both sides); natural-key dedup absorbs the
/// overlap.
fn split_window(
    requested: &TimeRange,
    covered: Option<&TimeRange>,
) -> (Option<TimeRange>, Vec<TimeRange>) {
    let Some(covered) = covered else {
        return (None, vec![*requested]);
    };
    let Some(local) = requested.intersect(covered) else {
        return (None, vec![*requested]);
    };

    let mut remote = Vec::new();
    if requested.start < local.start {
        remote.push(TimeRange::new(requested.start, local.start));
    }
    if local.end < requested.end {
        remote.push(TimeRange::new(local.end, requested.end));
    }
    (Some(local), remote)
}
