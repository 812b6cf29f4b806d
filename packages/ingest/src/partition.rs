//! Splitting a requested span into fetch chunks.
//!
//! A span of nights (or of absolute time, mapped onto nights) becomes
//! an ordered, gap-free sequence of inclusive [`Chunk`]s of at most
//! `chunk_nights` nights each. Partitioning is deterministic: the same
//! input always yields the same chunks, which is what makes re-running
//! an interrupted build safe.

use skyvault_archive_models::time::{NightId, date_to_night};
use skyvault_archive_models::{Chunk, ProductType, TimeRange};

/// Partitions an inclusive night span into ordered chunks.
///
/// Every chunk except the last spans exactly `chunk_nights` nights;
/// the last is clipped to `night_end`. Consecutive chunks meet without
/// gap or overlap: each chunk's end is the next chunk's start minus
/// one. Returns an empty sequence for an empty span.
#[must_use]
pub fn partition_night_range(
    product: ProductType,
    night_start: NightId,
    night_end: NightId,
    chunk_nights: i64,
) -> Vec<Chunk> {
    let size = chunk_nights.max(1);
    let mut chunks = Vec::new();

    let mut start = night_start;
    while start <= night_end {
        let end = night_end.min(start + size - 1);
        chunks.push(Chunk::new(product, start, end));
        start = end + 1;
    }

    chunks
}

/// Partitions a time range by mapping both endpoints onto their nights.
///
/// The boundary nights are included whole on both sides, so a window
/// starting mid-night still fetches that entire night; the extra
/// candidate rows this admits are absorbed by natural-key dedup.
#[must_use]
pub fn partition_time_range(
    product: ProductType,
    window: &TimeRange,
    chunk_nights: i64,
) -> Vec<Chunk> {
    if window.is_empty() {
        return Vec::new();
    }
    partition_night_range(
        product,
        date_to_night(window.start),
        date_to_night(window.end),
        chunk_nights,
    )
}
