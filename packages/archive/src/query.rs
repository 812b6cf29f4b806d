//! Archive query-string construction.
//!
//! The metadata endpoint takes one GET per query:
//! `{base}/{product}?...&ct=csv`, with a `WHERE` predicate over the
//! product's columns and optionally a `POS`/`SIZE` cone for position
//! searches. Time predicates use the product's native representation:
//! Julian dates for science and raw products, ISO datetime strings for
//! calibration and reference products.

use std::fmt::Write as _;

use skyvault_archive_models::time::datetime_to_jd;
use skyvault_archive_models::{Chunk, ProductType, TimeRange};

/// URL fetching every record in a chunk's night span.
///
/// Night bounds are inclusive on both ends, so adjacent chunks sharing
/// a boundary night both see its records; natural-key dedup absorbs
/// the overlap.
#[must_use]
pub fn chunk_url(base_url: &str, chunk: &Chunk) -> String {
    format!(
        "{base_url}/{}?WHERE=nid+BETWEEN+{}+AND+{}&ct=csv",
        chunk.product, chunk.night_start, chunk.night_end
    )
}

/// URL for a cone search around `(ra, dec)` limited to a time window.
#[must_use]
pub fn position_url(
    base_url: &str,
    product: ProductType,
    ra: f64,
    dec: f64,
    radius_deg: f64,
    window: &TimeRange,
) -> String {
    let mut url = format!("{base_url}/{product}?POS={ra:.5},{dec:.5}&SIZE={radius_deg:.3}");

    if product.uses_julian_time() {
        write!(
            url,
            "&WHERE=obsjd+BETWEEN+{:.5}+AND+{:.5}",
            datetime_to_jd(window.start),
            datetime_to_jd(window.end),
        )
        .unwrap();
    } else {
        write!(
            url,
            "&WHERE=startobsdate+BETWEEN+'{}'+AND+'{}'",
            window.start.format("%Y-%m-%d+%H:%M:%S"),
            window.end.format("%Y-%m-%d+%H:%M:%S"),
        )
        .unwrap();
    }

    url.push_str("&ct=csv");
    url
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use chrono::{DateTime, Utc};

    use super::*;

    const BASE: &str = "https://archive.example.org/search/products";

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("valid test timestamp")
            .and_utc()
    }

    #[test]
    fn chunk_url_uses_inclusive_night_bounds() {
        let chunk = Chunk::new(ProductType::Sci, 490, 496);
        assert_eq!(
            chunk_url(BASE, &chunk),
            format!("{BASE}/sci?WHERE=nid+BETWEEN+490+AND+496&ct=csv")
        );
    }

    #[test]
    fn position_url_uses_julian_dates_for_science() {
        let window = TimeRange::new(ts("2018-05-06 00:00:00"), ts("2018-05-07 00:00:00"));
        let url = position_url(BASE, ProductType::Sci, 153.42731, 39.78253, 0.6, &window);
        assert!(url.starts_with(&format!("{BASE}/sci?POS=153.42731,39.78253&SIZE=0.600")));
        assert!(url.contains("WHERE=obsjd+BETWEEN+2458244.50000+AND+2458245.50000"));
        assert!(url.ends_with("&ct=csv"));
    }

    #[test]
    fn position_url_uses_datetime_strings_for_calibration() {
        let window = TimeRange::new(ts("2018-05-06 00:00:00"), ts("2018-05-07 12:30:00"));
        let url = position_url(BASE, ProductType::Cal, 10.0, -5.0, 0.6, &window);
        assert!(
            url.contains("WHERE=startobsdate+BETWEEN+'2018-05-06+00:00:00'+AND+'2018-05-07+12:30:00'")
        );
    }
}
