//! Night-id and Julian-date time math.
//!
//! The archive partitions observations into integer "nights": night 0
//! is the UTC calendar day 2017-01-01, night 1 the day after, and so
//! on. Science and raw products additionally timestamp observations
//! with a Julian date, so conversions in both directions live here.
//! Everything in this module is a pure function.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// Integer night count since the survey epoch (2017-01-01 UTC).
pub type NightId = i64;

/// Julian date of the Unix epoch (1970-01-01T00:00:00Z).
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;

fn night_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 1, 1).expect("valid epoch date")
}

/// Returns the night a timestamp falls on: the count of UTC calendar
/// days since the survey epoch.
#[must_use]
pub fn date_to_night(t: DateTime<Utc>) -> NightId {
    t.date_naive().signed_duration_since(night_epoch()).num_days()
}

/// Returns midnight UTC of the given night.
///
/// Exact inverse of [`date_to_night`] on night boundaries:
/// `night_to_date(date_to_night(t))` rounds `t` down to the start of
/// its night.
#[must_use]
pub fn night_to_date(night: NightId) -> DateTime<Utc> {
    (night_epoch() + Duration::days(night))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// The night id of the current UTC day.
#[must_use]
pub fn today_night() -> NightId {
    date_to_night(Utc::now())
}

/// Converts a timestamp to the archive's Julian-date representation.
#[must_use]
pub fn datetime_to_jd(t: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = t.timestamp_millis() as f64;
    millis / 86_400_000.0 + UNIX_EPOCH_JD
}

/// Converts a Julian date back to a UTC timestamp (millisecond
/// precision). Returns `None` for values outside the representable
/// range.
#[must_use]
pub fn jd_to_datetime(jd: f64) -> Option<DateTime<Utc>> {
    let millis = (jd - UNIX_EPOCH_JD) * 86_400_000.0;
    if !millis.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    DateTime::from_timestamp_millis(millis.round() as i64)
}
