#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared data model for the skyvault archive mirror.
//!
//! Every metadata product the archive publishes is represented as an
//! [`ExposureRecord`] tagged with a [`ProductType`]. Records carry a
//! [`NaturalKey`](ExposureRecord::natural_key) composed purely of
//! archive-assigned identifiers, which is what makes re-ingestion
//! idempotent no matter how the fetch windows were cut.

pub mod spatial;
pub mod time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::time::NightId;

/// The category of archived data product.
///
/// Each product type has its own store collection and its own remote
/// query schema. The string form is the archive's short code, which is
/// also the path segment in remote query URLs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProductType {
    /// Fully processed science exposures.
    Sci,
    /// Raw camera exposures.
    Raw,
    /// Calibration products (biases, flats).
    Cal,
    /// Reference (co-added) images.
    Ref,
}

impl ProductType {
    /// All product types, in archive ordering.
    pub const ALL: &[Self] = &[Self::Sci, Self::Raw, Self::Cal, Self::Ref];

    /// The column the archive uses for observation time in this
    /// product's remote schema.
    ///
    /// Science and raw exposures are timestamped with a Julian date
    /// (`obsjd`); calibration and reference products with an ISO
    /// datetime string (`startobsdate`).
    #[must_use]
    pub const fn time_column(self) -> &'static str {
        match self {
            Self::Sci | Self::Raw => "obsjd",
            Self::Cal | Self::Ref => "startobsdate",
        }
    }

    /// Whether the remote schema expresses time as a Julian date.
    #[must_use]
    pub const fn uses_julian_time(self) -> bool {
        matches!(self, Self::Sci | Self::Raw)
    }
}

/// One metadata row for a single observation or data product.
///
/// This is the canonical typed shape every remote payload is validated
/// into at the fetch boundary. Only the fields needed for time- and
/// position-based filtering plus the instrument identifiers that make
/// up natural keys are carried; the archive publishes many more columns
/// that this subsystem does not mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRecord {
    /// Stable identifier derived from archive-assigned fields, unique
    /// within a product-type collection regardless of which fetch
    /// produced the row.
    pub natural_key: String,
    /// Observation time (UTC).
    pub obs_time: DateTime<Utc>,
    /// Night the observation belongs to.
    pub night: NightId,
    /// Right ascension of the footprint center, degrees.
    pub ra: f64,
    /// Declination of the footprint center, degrees.
    pub dec: f64,
    /// Survey field identifier.
    pub field_id: Option<i64>,
    /// CCD identifier within the camera mosaic.
    pub ccd_id: Option<i32>,
    /// Readout quadrant within the CCD.
    pub quad_id: Option<i32>,
    /// Filter identifier.
    pub filter_id: Option<i32>,
    /// Exposure identifier (science and raw products).
    pub exposure_id: Option<i64>,
    /// Calibration product identifier (calibration products only).
    pub calibration_id: Option<i64>,
    /// Exposure duration in seconds.
    pub exposure_time: Option<f64>,
}

/// Closed-inclusive range of absolute timestamps.
///
/// Chunk boundaries are inclusive on both ends so no record sitting
/// exactly on a boundary is ever skipped; the duplicate candidates this
/// can produce across adjacent chunks are absorbed by natural-key
/// dedup, not by range exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Start of the range (inclusive).
    pub start: DateTime<Utc>,
    /// End of the range (inclusive).
    pub end: DateTime<Utc>,
}

impl TimeRange {
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `true` if the range contains no instant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }

    /// The overlap of two ranges, or `None` if they are disjoint.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start > end { None } else { Some(Self { start, end }) }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// The unit of remote fetch, retry, and failure accounting: an
/// inclusive span of nights for one product type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Product type this chunk fetches.
    pub product: ProductType,
    /// First night in the span (inclusive).
    pub night_start: NightId,
    /// Last night in the span (inclusive).
    pub night_end: NightId,
}

impl Chunk {
    #[must_use]
    pub const fn new(product: ProductType, night_start: NightId, night_end: NightId) -> Self {
        Self {
            product,
            night_start,
            night_end,
        }
    }

    /// Number of nights the chunk spans.
    #[must_use]
    pub const fn nights(&self) -> i64 {
        self.night_end - self.night_start + 1
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}..={}]",
            self.product, self.night_start, self.night_end
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("valid test timestamp")
            .and_utc()
    }

    #[test]
    fn product_type_round_trips_through_strings() {
        for &p in ProductType::ALL {
            let parsed: ProductType = p.to_string().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert_eq!(ProductType::Sci.to_string(), "sci");
        assert_eq!(ProductType::Ref.as_ref(), "ref");
    }

    #[test]
    fn time_columns_match_product_schema() {
        assert_eq!(ProductType::Sci.time_column(), "obsjd");
        assert_eq!(ProductType::Raw.time_column(), "obsjd");
        assert_eq!(ProductType::Cal.time_column(), "startobsdate");
        assert_eq!(ProductType::Ref.time_column(), "startobsdate");
    }

    #[test]
    fn intersect_overlapping_ranges() {
        let a = TimeRange::new(ts("2020-01-01 00:00:00"), ts("2020-01-10 00:00:00"));
        let b = TimeRange::new(ts("2020-01-05 00:00:00"), ts("2020-01-20 00:00:00"));
        let got = a.intersect(&b).unwrap();
        assert_eq!(got.start, ts("2020-01-05 00:00:00"));
        assert_eq!(got.end, ts("2020-01-10 00:00:00"));
    }

    #[test]
    fn intersect_disjoint_ranges_is_none() {
        let a = TimeRange::new(ts("2020-01-01 00:00:00"), ts("2020-01-02 00:00:00"));
        let b = TimeRange::new(ts("2020-02-01 00:00:00"), ts("2020-02-02 00:00:00"));
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn intersect_at_shared_boundary_is_single_instant() {
        let a = TimeRange::new(ts("2020-01-01 00:00:00"), ts("2020-01-02 00:00:00"));
        let b = TimeRange::new(ts("2020-01-02 00:00:00"), ts("2020-01-03 00:00:00"));
        let got = a.intersect(&b).unwrap();
        assert_eq!(got.start, got.end);
        assert!(!got.is_empty());
    }

    #[test]
    fn chunk_night_count_is_inclusive() {
        let chunk = Chunk::new(ProductType::Sci, 490, 496);
        assert_eq!(chunk.nights(), 7);
        assert_eq!(chunk.to_string(), "sci[490..=496]");
    }
}
