//! Per-product `DuckDB` record storage.
//!
//! Each product type's store is a single `DuckDB` file containing an
//! `exposures` table (PRIMARY KEY on the natural key), a `coverage`
//! table of fully-ingested night spans, and a `_meta` table for sync
//! state. The connection sits behind a `Mutex` so concurrent fetch
//! workers can upsert without coordination; the key constraint — not
//! application code — decides who wins.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use duckdb::Connection;
use skyvault_archive_models::spatial::footprint_contains;
use skyvault_archive_models::time::{NightId, night_to_date};
use skyvault_archive_models::{ExposureRecord, ProductType, TimeRange};

use crate::DbError;

/// Number of rows per INSERT chunk (`DuckDB` handles large batches well).
const CHUNK_SIZE: usize = 5_000;

/// Timestamp format used for binding and reading `obs_time`.
///
/// Millisecond precision: Julian-date sources resolve well below a
/// second and the boundary math elsewhere assumes nothing finer.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Result of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Records newly inserted.
    pub inserted: u64,
    /// Duplicate candidates silently skipped (already present, or
    /// repeated within the batch).
    pub skipped: u64,
}

/// Persistent collection of [`ExposureRecord`]s for one product type.
pub struct RecordStore {
    product: ProductType,
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Opens (or creates) the store at its default path and ensures the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open(product: ProductType) -> Result<Self, DbError> {
        Self::open_at(product, &crate::paths::store_path(product))
    }

    /// Opens (or creates) the store at an explicit path.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_at(product: ProductType, path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        create_schema(&conn)?;
        Ok(Self {
            product,
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store. Used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory(product: ProductType) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            product,
            conn: Mutex::new(conn),
        })
    }

    /// The product type this store holds.
    #[must_use]
    pub const fn product(&self) -> ProductType {
        self.product
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Inserts records that are not yet present; records whose natural
    /// key already exists (or repeats within the batch) are counted as
    /// skipped, never treated as errors.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a database operation fails.
    pub fn upsert_batch(&self, records: &[ExposureRecord]) -> Result<UpsertOutcome, DbError> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        // Deduplicate within the batch; rows are immutable once
        // published, so the first occurrence is as good as any.
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let deduped: Vec<&ExposureRecord> = records
            .iter()
            .filter(|r| seen.insert(r.natural_key.as_str()))
            .collect();

        let total = records.len() as u64;
        let mut inserted = 0u64;

        let conn = self.conn()?;
        for chunk in deduped.chunks(CHUNK_SIZE) {
            let mut sql = String::from(
                "INSERT INTO exposures (
                    natural_key, obs_time, night, ra, dec,
                    field_id, ccd_id, quad_id, filter_id,
                    exposure_id, calibration_id, exposure_time
                ) VALUES ",
            );
            for i in 0..chunk.len() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
            }
            sql.push_str(" ON CONFLICT (natural_key) DO NOTHING");

            let mut stmt = conn.prepare(&sql)?;
            let mut idx = 1usize;

            for record in chunk {
                stmt.raw_bind_parameter(idx, &record.natural_key)?;
                stmt.raw_bind_parameter(idx + 1, record.obs_time.format(TS_FORMAT).to_string())?;
                stmt.raw_bind_parameter(idx + 2, record.night)?;
                stmt.raw_bind_parameter(idx + 3, record.ra)?;
                stmt.raw_bind_parameter(idx + 4, record.dec)?;
                stmt.raw_bind_parameter(idx + 5, record.field_id)?;
                stmt.raw_bind_parameter(idx + 6, record.ccd_id)?;
                stmt.raw_bind_parameter(idx + 7, record.quad_id)?;
                stmt.raw_bind_parameter(idx + 8, record.filter_id)?;
                stmt.raw_bind_parameter(idx + 9, record.exposure_id)?;
                stmt.raw_bind_parameter(idx + 10, record.calibration_id)?;
                stmt.raw_bind_parameter(idx + 11, record.exposure_time)?;
                idx += 12;
            }

            let rows = stmt.raw_execute()?;
            inserted += u64::try_from(rows).unwrap_or(0);
        }

        Ok(UpsertOutcome {
            inserted,
            skipped: total - inserted,
        })
    }

    /// Records that the inclusive night span was fully ingested.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub fn mark_covered(&self, night_start: NightId, night_end: NightId) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO coverage (night_start, night_end) VALUES (?, ?)
             ON CONFLICT (night_start, night_end) DO NOTHING",
            duckdb::params![night_start, night_end],
        )?;
        Ok(())
    }

    /// The recorded night spans merged into contiguous runs, ascending.
    ///
    /// Spans that touch or overlap (next start at most one night past
    /// the current end) merge into one run; holes are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn covered_nights(&self) -> Result<Vec<(NightId, NightId)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT night_start, night_end FROM coverage ORDER BY night_start, night_end",
        )?;
        let mut rows = stmt.query([])?;

        let mut runs: Vec<(NightId, NightId)> = Vec::new();
        while let Some(row) = rows.next()? {
            let start: i64 = row.get(0)?;
            let end: i64 = row.get(1)?;
            match runs.last_mut() {
                Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
                _ => runs.push((start, end)),
            }
        }
        Ok(runs)
    }

    /// The largest time span guaranteed fully ingested, or `None` for
    /// an empty store.
    ///
    /// When ingestion left holes (failed chunks), only the longest
    /// contiguous run is reported — earliest run on ties — so coverage
    /// is never claimed across a gap.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn covered_range(&self) -> Result<Option<TimeRange>, DbError> {
        let runs = self.covered_nights()?;

        let mut best: Option<(NightId, NightId)> = None;
        for &(start, end) in &runs {
            let keep = best.is_none_or(|(bs, be)| end - start > be - bs);
            if keep {
                best = Some((start, end));
            }
        }

        Ok(best.map(|(start, end)| {
            TimeRange::new(
                night_to_date(start),
                // Last covered instant: the end night runs up to (but
                // not including) the next night's boundary.
                night_to_date(end + 1) - Duration::milliseconds(1),
            )
        }))
    }

    /// Records whose footprint can contain `(ra, dec)`, within the time
    /// window, ascending by observation time.
    ///
    /// A declination band and the time window prefilter in SQL; the
    /// exact angular-separation test runs on the surviving rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row cannot be
    /// converted.
    pub fn query_by_position_and_time(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        window: &TimeRange,
    ) -> Result<Vec<ExposureRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT natural_key, obs_time::TEXT, night, ra, dec,
                    field_id, ccd_id, quad_id, filter_id,
                    exposure_id, calibration_id, exposure_time
             FROM exposures
             WHERE obs_time >= ?::TIMESTAMP AND obs_time <= ?::TIMESTAMP
               AND dec >= ? AND dec <= ?
             ORDER BY obs_time, natural_key",
        )?;

        let mut rows = stmt.query(duckdb::params![
            window.start.format(TS_FORMAT).to_string(),
            window.end.format(TS_FORMAT).to_string(),
            dec - radius_deg,
            dec + radius_deg,
        ])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            if footprint_contains(record.ra, record.dec, ra, dec, radius_deg) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Returns the number of records stored.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn record_count(&self) -> Result<u64, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM exposures")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        #[allow(clippy::cast_sign_loss)]
        Ok(count as u64)
    }

    /// Gets a metadata value from the `_meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM _meta WHERE key = ?")?;
        match stmt.query_row([key], |row| row.get(0)) {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::DuckDb(e)),
        }
    }

    /// Sets a metadata value in the `_meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the upsert fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO _meta (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            duckdb::params![key, value],
        )?;
        Ok(())
    }

    /// Updates record count and last-synced timestamp after ingestion.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the metadata update fails.
    pub fn update_sync_metadata(&self) -> Result<(), DbError> {
        let count = self.record_count()?;
        self.set_meta("record_count", &count.to_string())?;
        self.set_meta("last_synced_at", &Utc::now().to_rfc3339())?;
        Ok(())
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS exposures (
            natural_key TEXT NOT NULL PRIMARY KEY,
            obs_time TIMESTAMP NOT NULL,
            night BIGINT NOT NULL,
            ra DOUBLE NOT NULL,
            dec DOUBLE NOT NULL,
            field_id BIGINT,
            ccd_id INTEGER,
            quad_id INTEGER,
            filter_id INTEGER,
            exposure_id BIGINT,
            calibration_id BIGINT,
            exposure_time DOUBLE
        );

        CREATE TABLE IF NOT EXISTS coverage (
            night_start BIGINT NOT NULL,
            night_end BIGINT NOT NULL,
            PRIMARY KEY (night_start, night_end)
        );

        CREATE TABLE IF NOT EXISTS _meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn row_to_record(row: &duckdb::Row<'_>) -> Result<ExposureRecord, DbError> {
    let obs_time_text: String = row.get(1)?;
    let obs_time = parse_timestamp(&obs_time_text).ok_or_else(|| DbError::Conversion {
        message: format!("unparseable obs_time: {obs_time_text:?}"),
    })?;

    Ok(ExposureRecord {
        natural_key: row.get(0)?,
        obs_time,
        night: row.get(2)?,
        ra: row.get(3)?,
        dec: row.get(4)?,
        field_id: row.get(5)?,
        ccd_id: row.get(6)?,
        quad_id: row.get(7)?,
        filter_id: row.get(8)?,
        exposure_id: row.get(9)?,
        calibration_id: row.get(10)?,
        exposure_time: row.get(11)?,
    })
}

/// Parses a `DuckDB` timestamp text representation into a UTC
/// `DateTime`.
///
/// The `::TEXT` cast can produce several forms depending on stored
/// precision (with/without fractional seconds, with/without timezone);
/// this tries them in order.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    log::warn!("Failed to parse timestamp: {s:?}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("valid test timestamp")
            .and_utc()
    }

    fn record(key: &str, time: &str, ra: f64, dec: f64) -> ExposureRecord {
        let obs_time = ts(time);
        ExposureRecord {
            natural_key: key.to_string(),
            obs_time,
            night: skyvault_archive_models::time::date_to_night(obs_time),
            ra,
            dec,
            field_id: Some(650),
            ccd_id: Some(7),
            quad_id: Some(2),
            filter_id: Some(1),
            exposure_id: Some(50_123),
            calibration_id: None,
            exposure_time: Some(30.0),
        }
    }

    fn store() -> RecordStore {
        RecordStore::open_in_memory(ProductType::Sci).expect("in-memory store")
    }

    #[test]
    fn upsert_then_reingest_is_a_noop() {
        let store = store();
        let batch = vec![
            record("sci-e1-c1-q1-f1", "2018-05-06 03:00:00", 150.0, 30.0),
            record("sci-e1-c1-q2-f1", "2018-05-06 03:00:00", 150.2, 30.1),
        ];

        let first = store.upsert_batch(&batch).unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 2, skipped: 0 });

        let second = store.upsert_batch(&batch).unwrap();
        assert_eq!(second, UpsertOutcome { inserted: 0, skipped: 2 });

        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn in_batch_duplicates_are_skipped() {
        let store = store();
        let batch = vec![
            record("sci-e1-c1-q1-f1", "2018-05-06 03:00:00", 150.0, 30.0),
            record("sci-e1-c1-q1-f1", "2018-05-06 03:00:00", 150.0, 30.0),
        ];
        let outcome = store.upsert_batch(&batch).unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 1, skipped: 1 });
    }

    #[test]
    fn overlapping_batches_store_one_record_per_key() {
        let store = store();
        // Two chunk fetches that both saw the boundary-night record.
        let boundary = record("sci-e9-c3-q1-f2", "2018-05-13 01:00:00", 10.0, 5.0);
        let first = vec![
            record("sci-e8-c3-q1-f2", "2018-05-12 01:00:00", 10.0, 5.0),
            boundary.clone(),
        ];
        let second = vec![
            boundary,
            record("sci-e10-c3-q1-f2", "2018-05-14 01:00:00", 10.0, 5.0),
        ];

        let a = store.upsert_batch(&first).unwrap();
        let b = store.upsert_batch(&second).unwrap();
        assert_eq!(a.inserted, 2);
        assert_eq!(b, UpsertOutcome { inserted: 1, skipped: 1 });
        assert_eq!(store.record_count().unwrap(), 3);
    }

    #[test]
    fn covered_nights_merge_adjacent_spans() {
        let store = store();
        store.mark_covered(0, 6).unwrap();
        store.mark_covered(7, 13).unwrap();
        store.mark_covered(20, 26).unwrap();

        let runs = store.covered_nights().unwrap();
        assert_eq!(runs, vec![(0, 13), (20, 26)]);
    }

    #[test]
    fn covered_range_reports_longest_run_never_bridging_holes() {
        let store = store();
        store.mark_covered(0, 6).unwrap();
        store.mark_covered(7, 13).unwrap();
        // Hole at nights 14-19 (failed chunk).
        store.mark_covered(20, 22).unwrap();

        let range = store.covered_range().unwrap().unwrap();
        assert_eq!(range.start, night_to_date(0));
        assert_eq!(range.end, night_to_date(14) - Duration::milliseconds(1));
    }

    #[test]
    fn covered_range_of_empty_store_is_none() {
        assert!(store().covered_range().unwrap().is_none());
    }

    #[test]
    fn re_marking_coverage_is_idempotent() {
        let store = store();
        store.mark_covered(0, 6).unwrap();
        store.mark_covered(0, 6).unwrap();
        assert_eq!(store.covered_nights().unwrap(), vec![(0, 6)]);
    }

    #[test]
    fn position_query_filters_and_sorts() {
        let store = store();
        let batch = vec![
            // Within radius, later.
            record("sci-e3-c1-q1-f1", "2018-05-08 03:00:00", 150.1, 30.05),
            // Within radius, earlier.
            record("sci-e1-c1-q1-f1", "2018-05-06 03:00:00", 150.0, 30.0),
            // Same declination band, RA far away.
            record("sci-e2-c1-q1-f1", "2018-05-07 03:00:00", 170.0, 30.0),
            // Outside the time window.
            record("sci-e4-c1-q1-f1", "2018-06-01 03:00:00", 150.0, 30.0),
        ];
        store.upsert_batch(&batch).unwrap();

        let window = TimeRange::new(ts("2018-05-01 00:00:00"), ts("2018-05-31 00:00:00"));
        let hits = store
            .query_by_position_and_time(150.05, 30.02, 0.6, &window)
            .unwrap();

        let keys: Vec<&str> = hits.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["sci-e1-c1-q1-f1", "sci-e3-c1-q1-f1"]);
        assert!(hits[0].obs_time < hits[1].obs_time);
    }

    #[test]
    fn meta_round_trip() {
        let store = store();
        assert_eq!(store.get_meta("record_count").unwrap(), None);
        store.set_meta("record_count", "42").unwrap();
        store.set_meta("record_count", "43").unwrap();
        assert_eq!(store.get_meta("record_count").unwrap().as_deref(), Some("43"));
    }
}
