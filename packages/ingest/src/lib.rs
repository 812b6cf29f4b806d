#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Chunked, bounded-parallel ingestion of archive metadata into the
//! local stores.
//!
//! A requested span is partitioned into night chunks, dispatched to a
//! pool of fetch workers, and upserted as results arrive. A chunk that
//! fails after the fetcher's retries is recorded in the summary and
//! never aborts its siblings; because upsert is idempotent, re-running
//! any range (including after a cancellation) is a record-level no-op
//! that still extends coverage where chunks previously failed.

pub mod partition;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::StreamExt as _;
use skyvault_archive::progress::{ProgressCallback, null_progress};
use skyvault_archive::{ArchiveError, MetadataFetcher};
use skyvault_archive_models::time::{NightId, today_night};
use skyvault_archive_models::{Chunk, TimeRange};
use skyvault_database::store::UpsertOutcome;
use skyvault_database::{DbError, RecordStore};

/// Default chunk duration in nights.
pub const DEFAULT_CHUNK_NIGHTS: i64 = 7;

/// Default number of parallel fetch workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Errors that abort an ingestion operation outright.
///
/// Per-chunk fetch failures are *not* errors at this level — they are
/// collected in the [`IngestSummary`]. Only an unavailable store is
/// fatal: there is nothing to retry against.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The local store failed.
    #[error("store unavailable: {0}")]
    Store(#[from] DbError),
}

/// Tuning knobs for an ingestion run.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Nights per fetch chunk.
    pub chunk_nights: i64,
    /// Parallel fetch workers.
    pub workers: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunk_nights: DEFAULT_CHUNK_NIGHTS,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// A chunk that exhausted its retries (or failed validation).
#[derive(Debug, Clone)]
pub struct FailedChunk {
    /// The chunk that failed; re-running just this span recovers it.
    pub chunk: Chunk,
    /// Error text for diagnosis.
    pub error: String,
    /// `true` if the response arrived but could not be validated
    /// (retrying without a schema fix will not help).
    pub malformed: bool,
}

/// Aggregate outcome of an ingestion run.
///
/// Counts are order-independent: upsert is idempotent and commutative
/// across natural keys, so worker interleaving cannot change them.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    /// Records newly inserted.
    pub inserted: u64,
    /// Duplicate candidates skipped.
    pub skipped: u64,
    /// Chunks that failed; the caller decides whether to re-run them.
    pub failed_chunks: Vec<FailedChunk>,
    /// Chunks skipped because the run was cancelled before they were
    /// dispatched.
    pub cancelled_chunks: u64,
}

impl std::fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} inserted, {} skipped, {} failed chunk(s), {} cancelled",
            self.inserted,
            self.skipped,
            self.failed_chunks.len(),
            self.cancelled_chunks
        )
    }
}

/// Cooperative cancellation handle for an ingestion run.
///
/// Cancelling skips chunks not yet picked up by a worker; chunks
/// already committed stay committed, so a cancelled build is safe to
/// resume by re-running the same (or a narrowed) range.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the remaining queue.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum ChunkOutcome {
    Done(UpsertOutcome),
    FetchFailed(ArchiveError),
    StoreFailed(DbError),
    Cancelled,
}

/// Fetches and upserts every chunk in the sequence through a pool of
/// `workers` parallel workers.
///
/// Each worker performs one fetch followed by one upsert; the store
/// lock is only taken for the upsert, never across a fetch. Completion
/// order is unconstrained.
async fn run_chunks(
    fetcher: &dyn MetadataFetcher,
    store: &RecordStore,
    chunks: Vec<Chunk>,
    workers: usize,
    cancel: &CancelToken,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<IngestSummary, IngestError> {
    let total = chunks.len();
    progress.set_total(total as u64);

    let mut results = futures::stream::iter(chunks.into_iter().map(|chunk| {
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return (chunk, ChunkOutcome::Cancelled);
            }
            let batch = match fetcher.fetch_chunk(&chunk).await {
                Ok(batch) => batch,
                Err(e) => return (chunk, ChunkOutcome::FetchFailed(e)),
            };
            let outcome = store
                .upsert_batch(&batch)
                .and_then(|outcome| {
                    store.mark_covered(chunk.night_start, chunk.night_end)?;
                    Ok(outcome)
                });
            match outcome {
                Ok(outcome) => (chunk, ChunkOutcome::Done(outcome)),
                Err(e) => (chunk, ChunkOutcome::StoreFailed(e)),
            }
        }
    }))
    .buffer_unordered(workers.max(1));

    let mut summary = IngestSummary::default();
    let mut completed = 0usize;

    while let Some((chunk, outcome)) = results.next().await {
        completed += 1;
        match outcome {
            ChunkOutcome::Done(upsert) => {
                summary.inserted += upsert.inserted;
                summary.skipped += upsert.skipped;
                log::debug!(
                    "{chunk}: {} inserted, {} skipped ({completed}/{total})",
                    upsert.inserted,
                    upsert.skipped
                );
            }
            ChunkOutcome::FetchFailed(e) => {
                if e.is_malformed() {
                    log::error!("{chunk}: malformed response: {e}");
                } else {
                    log::error!("{chunk}: fetch failed: {e}");
                }
                summary.failed_chunks.push(FailedChunk {
                    chunk,
                    malformed: e.is_malformed(),
                    error: e.to_string(),
                });
            }
            ChunkOutcome::StoreFailed(e) => {
                // Nothing to retry against; stop dispatching and bail.
                cancel.cancel();
                return Err(IngestError::Store(e));
            }
            ChunkOutcome::Cancelled => {
                summary.cancelled_chunks += 1;
            }
        }
        progress.set_message(chunk.to_string());
        progress.inc(1);
    }

    Ok(summary)
}

/// Ingests every chunk in the inclusive night span.
///
/// # Errors
///
/// Returns [`IngestError`] only if the local store fails; fetch
/// failures are reported in the summary.
pub async fn insert_for_night_range(
    fetcher: &dyn MetadataFetcher,
    store: &RecordStore,
    night_start: NightId,
    night_end: NightId,
    options: IngestOptions,
    cancel: &CancelToken,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<IngestSummary, IngestError> {
    let start = Instant::now();
    let product = store.product();
    let chunks =
        partition::partition_night_range(product, night_start, night_end, options.chunk_nights);
    log::info!(
        "ingesting {product} nights {night_start}..={night_end}: {} chunk(s) of {} night(s), {} worker(s)",
        chunks.len(),
        options.chunk_nights,
        options.workers,
    );

    let progress = progress.unwrap_or_else(null_progress);
    let summary = run_chunks(fetcher, store, chunks, options.workers, cancel, &progress).await?;

    store.update_sync_metadata()?;
    progress.finish(summary.to_string());
    log::info!(
        "ingest complete for {product}: {summary}, took {:.1}s",
        start.elapsed().as_secs_f64()
    );

    Ok(summary)
}

/// Ingests every chunk overlapping the given time range.
///
/// The boundary nights are fetched whole; natural-key dedup absorbs
/// anything already stored.
///
/// # Errors
///
/// Returns [`IngestError`] only if the local store fails.
pub async fn insert_for_time_range(
    fetcher: &dyn MetadataFetcher,
    store: &RecordStore,
    window: &TimeRange,
    options: IngestOptions,
    cancel: &CancelToken,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<IngestSummary, IngestError> {
    if window.is_empty() {
        log::warn!("empty time range {window}, nothing to ingest");
        return Ok(IngestSummary::default());
    }
    insert_for_night_range(
        fetcher,
        store,
        skyvault_archive_models::time::date_to_night(window.start),
        skyvault_archive_models::time::date_to_night(window.end),
        options,
        cancel,
        progress,
    )
    .await
}

/// Ingests a single night.
///
/// # Errors
///
/// Returns [`IngestError`] only if the local store fails.
pub async fn insert_for_night(
    fetcher: &dyn MetadataFetcher,
    store: &RecordStore,
    night: NightId,
    cancel: &CancelToken,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<IngestSummary, IngestError> {
    insert_for_night_range(
        fetcher,
        store,
        night,
        night,
        IngestOptions::default(),
        cancel,
        progress,
    )
    .await
}

/// Builds (or extends) the store over the whole archive history.
///
/// The span runs from night 0 through tomorrow's night, with the end
/// boundary evaluated *now* — repeated calls extend coverage as the
/// archive grows. Re-running is idempotent at the record level but
/// still re-issues every remote fetch.
///
/// # Errors
///
/// Returns [`IngestError`] only if the local store fails.
pub async fn build_database(
    fetcher: &dyn MetadataFetcher,
    store: &RecordStore,
    options: IngestOptions,
    cancel: &CancelToken,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<IngestSummary, IngestError> {
    insert_for_night_range(
        fetcher,
        store,
        0,
        today_night() + 1,
        options,
        cancel,
        progress,
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use skyvault_archive_models::time::night_to_date;
    use skyvault_archive_models::{ExposureRecord, ProductType};

    use super::*;

    /// Emits one record per night in the chunk; optionally re-emits the
    /// night before the chunk start (the boundary-overlap case) and
    /// fails configured chunks.
    struct MockFetcher {
        fail_chunk_starts: BTreeSet<NightId>,
        malformed_chunk_starts: BTreeSet<NightId>,
        overlap_boundary: bool,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                fail_chunk_starts: BTreeSet::new(),
                malformed_chunk_starts: BTreeSet::new(),
                overlap_boundary: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn night_record(night: NightId) -> ExposureRecord {
        let obs_time = night_to_date(night) + chrono::Duration::hours(3);
        ExposureRecord {
            natural_key: format!("sci-e{night}-c1-q1-f1"),
            obs_time,
            night,
            ra: 150.0,
            dec: 30.0,
            field_id: Some(650),
            ccd_id: Some(1),
            quad_id: Some(1),
            filter_id: Some(1),
            exposure_id: Some(night),
            calibration_id: None,
            exposure_time: Some(30.0),
        }
    }

    #[async_trait]
    impl MetadataFetcher for MockFetcher {
        async fn fetch_chunk(
            &self,
            chunk: &Chunk,
        ) -> Result<Vec<ExposureRecord>, ArchiveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail_chunk_starts.contains(&chunk.night_start) {
                return Err(ArchiveError::Status {
                    status: 503,
                    url: chunk.to_string(),
                });
            }
            if self.malformed_chunk_starts.contains(&chunk.night_start) {
                return Err(ArchiveError::Malformed {
                    message: "unexpected column set".to_string(),
                });
            }

            let mut nights: Vec<NightId> = (chunk.night_start..=chunk.night_end).collect();
            if self.overlap_boundary && chunk.night_start > 0 {
                nights.push(chunk.night_start - 1);
            }
            Ok(nights.into_iter().map(night_record).collect())
        }

        async fn fetch_by_position(
            &self,
            _product: ProductType,
            _ra: f64,
            _dec: f64,
            _window: &TimeRange,
        ) -> Result<Vec<ExposureRecord>, ArchiveError> {
            Ok(Vec::new())
        }
    }

    fn store() -> RecordStore {
        RecordStore::open_in_memory(ProductType::Sci).expect("in-memory store")
    }

    fn options() -> IngestOptions {
        IngestOptions {
            chunk_nights: 7,
            workers: 4,
        }
    }

    #[tokio::test]
    async fn ingests_a_night_range() {
        let fetcher = MockFetcher::new();
        let store = store();

        let summary = insert_for_night_range(
            &fetcher,
            &store,
            0,
            20,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.inserted, 21);
        assert_eq!(summary.skipped, 0);
        assert!(summary.failed_chunks.is_empty());
        assert_eq!(summary.cancelled_chunks, 0);
        assert_eq!(store.record_count().unwrap(), 21);
        assert_eq!(store.covered_nights().unwrap(), vec![(0, 20)]);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn reingest_is_idempotent_but_still_fetches() {
        let fetcher = MockFetcher::new();
        let store = store();
        let cancel = CancelToken::new();

        insert_for_night_range(&fetcher, &store, 0, 20, options(), &cancel, None)
            .await
            .unwrap();
        let second = insert_for_night_range(&fetcher, &store, 0, 20, options(), &cancel, None)
            .await
            .unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 21);
        assert_eq!(store.record_count().unwrap(), 21);
        // Idempotent in effect, not free of remote cost.
        assert_eq!(fetcher.calls(), 6);
    }

    #[tokio::test]
    async fn failed_chunk_is_isolated_and_reported() {
        let mut fetcher = MockFetcher::new();
        fetcher.fail_chunk_starts.insert(7);
        let store = store();

        let summary = insert_for_night_range(
            &fetcher,
            &store,
            0,
            20,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.inserted, 14);
        assert_eq!(summary.failed_chunks.len(), 1);
        let failed = &summary.failed_chunks[0];
        assert_eq!(
            (failed.chunk.night_start, failed.chunk.night_end),
            (7, 13)
        );
        assert!(!failed.malformed);
        // The hole is visible in coverage, never bridged.
        assert_eq!(store.covered_nights().unwrap(), vec![(0, 6), (14, 20)]);
    }

    #[tokio::test]
    async fn rerunning_just_the_failed_span_closes_the_hole() {
        let mut fetcher = MockFetcher::new();
        fetcher.fail_chunk_starts.insert(7);
        let store = store();
        let cancel = CancelToken::new();

        insert_for_night_range(&fetcher, &store, 0, 20, options(), &cancel, None)
            .await
            .unwrap();

        fetcher.fail_chunk_starts.clear();
        let retry = insert_for_night_range(&fetcher, &store, 7, 13, options(), &cancel, None)
            .await
            .unwrap();

        assert_eq!(retry.inserted, 7);
        assert_eq!(store.covered_nights().unwrap(), vec![(0, 20)]);
    }

    #[tokio::test]
    async fn malformed_response_is_flagged_distinctly() {
        let mut fetcher = MockFetcher::new();
        fetcher.malformed_chunk_starts.insert(14);
        let store = store();

        let summary = insert_for_night_range(
            &fetcher,
            &store,
            0,
            20,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.failed_chunks.len(), 1);
        assert!(summary.failed_chunks[0].malformed);
    }

    #[tokio::test]
    async fn cancelled_token_skips_all_chunks() {
        let fetcher = MockFetcher::new();
        let store = store();
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = insert_for_night_range(&fetcher, &store, 0, 20, options(), &cancel, None)
            .await
            .unwrap();

        assert_eq!(summary.cancelled_chunks, 3);
        assert_eq!(summary.inserted, 0);
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn boundary_overlap_stores_each_record_once() {
        let mut fetcher = MockFetcher::new();
        fetcher.overlap_boundary = true;
        let store = store();

        let summary = insert_for_night_range(
            &fetcher,
            &store,
            0,
            20,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        // Chunks [7,13] and [14,20] re-emitted nights 6 and 13.
        assert_eq!(summary.inserted, 21);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.record_count().unwrap(), 21);
    }

    #[tokio::test]
    async fn documented_failure_scenario() {
        let mut fetcher = MockFetcher::new();
        fetcher.fail_chunk_starts.insert(504);
        let store = store();

        let summary = insert_for_night_range(
            &fetcher,
            &store,
            490,
            520,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        // 31 nights minus the 7 in the permanently failing chunk.
        assert_eq!(summary.inserted, 24);
        assert_eq!(summary.failed_chunks.len(), 1);
        assert_eq!(
            (
                summary.failed_chunks[0].chunk.night_start,
                summary.failed_chunks[0].chunk.night_end
            ),
            (504, 510)
        );
    }

    #[tokio::test]
    async fn single_night_ingest() {
        let fetcher = MockFetcher::new();
        let store = store();

        let summary = insert_for_night(&fetcher, &store, 490, &CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(store.covered_nights().unwrap(), vec![(490, 490)]);
    }

    #[tokio::test]
    async fn time_range_ingest_covers_boundary_nights() {
        let fetcher = MockFetcher::new();
        let store = store();
        let window = TimeRange::new(
            night_to_date(490) + chrono::Duration::hours(13),
            night_to_date(492) + chrono::Duration::hours(2),
        );

        let summary = insert_for_time_range(
            &fetcher,
            &store,
            &window,
            options(),
            &CancelToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.inserted, 3);
        assert_eq!(store.covered_nights().unwrap(), vec![(490, 492)]);
    }
}
