//! CSV payload validation into typed records.
//!
//! The archive answers `ct=csv` queries with a header row followed by
//! one row per product. Each product type has its own column set; the
//! mapping to [`ExposureRecord`] is fixed here and validated strictly —
//! a missing required column or an unparseable required value fails the
//! whole batch as [`ArchiveError::Malformed`] rather than leaking
//! half-validated rows downstream.

use chrono::{DateTime, NaiveDateTime, Utc};
use skyvault_archive_models::time::{date_to_night, jd_to_datetime};
use skyvault_archive_models::{ExposureRecord, ProductType};

use crate::ArchiveError;

/// Parses a CSV payload into records for the given product type.
///
/// An empty (or headers-only) payload is a normal empty batch.
///
/// # Errors
///
/// Returns [`ArchiveError::Malformed`] if the payload is not valid CSV,
/// a required column is missing from the header, or a required value in
/// any row cannot be parsed.
pub fn parse_batch(
    product: ProductType,
    csv_text: &str,
) -> Result<Vec<ExposureRecord>, ArchiveError> {
    if csv_text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| malformed(format!("unreadable CSV header: {e}")))?
        .clone();

    let columns = Columns::resolve(product, &headers)?;

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.map_err(|e| malformed(format!("unreadable CSV row {}: {e}", i + 1)))?;
        records.push(columns.parse_row(product, &row, i + 1)?);
    }

    Ok(records)
}

fn malformed(message: String) -> ArchiveError {
    ArchiveError::Malformed { message }
}

/// Resolved header indexes for one product type's column mapping.
struct Columns {
    ra: usize,
    dec: usize,
    time: usize,
    exposure_id: Option<usize>,
    ccd_id: Option<usize>,
    quad_id: Option<usize>,
    filter_id: Option<usize>,
    field_id: Option<usize>,
    calibration_id: Option<usize>,
    exposure_time: Option<usize>,
}

impl Columns {
    fn resolve(product: ProductType, headers: &csv::StringRecord) -> Result<Self, ArchiveError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                malformed(format!("missing required column '{name}' for product {product}"))
            })
        };

        // Key columns: everything the natural key is composed of must
        // be present, or dedup across fetches cannot be guaranteed.
        let columns = match product {
            ProductType::Sci => Self {
                ra: require("ra")?,
                dec: require("dec")?,
                time: require("obsjd")?,
                exposure_id: Some(require("expid")?),
                ccd_id: Some(require("ccdid")?),
                quad_id: Some(require("qid")?),
                filter_id: Some(require("fid")?),
                field_id: find("field"),
                calibration_id: None,
                exposure_time: find("exptime"),
            },
            ProductType::Raw => Self {
                ra: require("ra")?,
                dec: require("dec")?,
                time: require("obsjd")?,
                exposure_id: Some(require("expid")?),
                ccd_id: Some(require("ccdid")?),
                quad_id: None,
                filter_id: find("fid"),
                field_id: find("field"),
                calibration_id: None,
                exposure_time: find("exptime"),
            },
            ProductType::Cal => Self {
                ra: require("ra")?,
                dec: require("dec")?,
                time: require("startobsdate")?,
                exposure_id: None,
                ccd_id: find("ccdid"),
                quad_id: find("qid"),
                filter_id: find("fid"),
                field_id: None,
                calibration_id: Some(require("cid")?),
                exposure_time: None,
            },
            ProductType::Ref => Self {
                ra: require("ra")?,
                dec: require("dec")?,
                time: require("startobsdate")?,
                exposure_id: None,
                ccd_id: Some(require("ccdid")?),
                quad_id: Some(require("qid")?),
                filter_id: Some(require("fid")?),
                field_id: Some(require("field")?),
                calibration_id: None,
                exposure_time: None,
            },
        };

        Ok(columns)
    }

    fn parse_row(
        &self,
        product: ProductType,
        row: &csv::StringRecord,
        row_num: usize,
    ) -> Result<ExposureRecord, ArchiveError> {
        let value = |idx: usize| row.get(idx).map(str::trim).unwrap_or_default();
        let required = |idx: usize, name: &str| {
            let v = value(idx);
            if v.is_empty() {
                Err(malformed(format!("row {row_num}: empty value for '{name}'")))
            } else {
                Ok(v)
            }
        };

        let ra: f64 = parse_value(required(self.ra, "ra")?, "ra", row_num)?;
        let dec: f64 = parse_value(required(self.dec, "dec")?, "dec", row_num)?;

        let obs_time = if product.uses_julian_time() {
            let jd: f64 = parse_value(required(self.time, "obsjd")?, "obsjd", row_num)?;
            jd_to_datetime(jd)
                .ok_or_else(|| malformed(format!("row {row_num}: obsjd {jd} out of range")))?
        } else {
            parse_obsdate(required(self.time, "startobsdate")?)
                .ok_or_else(|| malformed(format!("row {row_num}: unparseable startobsdate")))?
        };

        let exposure_id = self
            .exposure_id
            .map(|i| parse_value::<i64>(required(i, "expid")?, "expid", row_num))
            .transpose()?;
        let calibration_id = self
            .calibration_id
            .map(|i| parse_value::<i64>(required(i, "cid")?, "cid", row_num))
            .transpose()?;

        // Key components are required per product; the rest are carried
        // when the archive provides them.
        let ccd_id = opt_i32(row, row_num, self.ccd_id, "ccdid", product)?;
        let quad_id = opt_i32(row, row_num, self.quad_id, "qid", product)?;
        let filter_id = opt_i32(row, row_num, self.filter_id, "fid", product)?;
        let field_id = self
            .field_id
            .and_then(|i| {
                let v = value(i);
                if v.is_empty() { None } else { Some(v) }
            })
            .map(|v| parse_value::<i64>(v, "field", row_num))
            .transpose()?;
        let exposure_time = self
            .exposure_time
            .and_then(|i| {
                let v = value(i);
                if v.is_empty() { None } else { Some(v) }
            })
            .map(|v| parse_value::<f64>(v, "exptime", row_num))
            .transpose()?;

        let natural_key = natural_key(
            product,
            exposure_id,
            ccd_id,
            quad_id,
            filter_id,
            field_id,
            calibration_id,
        )
        .ok_or_else(|| {
            malformed(format!(
                "row {row_num}: missing natural-key component for product {product}"
            ))
        })?;

        Ok(ExposureRecord {
            natural_key,
            obs_time,
            night: date_to_night(obs_time),
            ra,
            dec,
            field_id,
            ccd_id,
            quad_id,
            filter_id,
            exposure_id,
            calibration_id,
            exposure_time,
        })
    }
}

/// Parses an optional i32 column; required-ness was already decided at
/// header resolution (a `Some` index for a key component came from
/// `require`), but key components must also never be empty per row.
fn opt_i32(
    row: &csv::StringRecord,
    row_num: usize,
    idx: Option<usize>,
    name: &str,
    product: ProductType,
) -> Result<Option<i32>, ArchiveError> {
    let Some(idx) = idx else { return Ok(None) };
    let v = row.get(idx).map(str::trim).unwrap_or_default();
    if v.is_empty() {
        if is_key_component(product, name) {
            return Err(malformed(format!("row {row_num}: empty value for '{name}'")));
        }
        return Ok(None);
    }
    Ok(Some(parse_value(v, name, row_num)?))
}

fn parse_value<T: std::str::FromStr>(v: &str, name: &str, row_num: usize) -> Result<T, ArchiveError>
where
    T::Err: std::fmt::Display,
{
    v.parse()
        .map_err(|e| malformed(format!("row {row_num}: bad '{name}' value {v:?}: {e}")))
}

/// Whether a column participates in the product's natural key and must
/// therefore never be empty.
fn is_key_component(product: ProductType, name: &str) -> bool {
    match product {
        ProductType::Sci => matches!(name, "expid" | "ccdid" | "qid" | "fid"),
        ProductType::Raw => matches!(name, "expid" | "ccdid"),
        ProductType::Cal => name == "cid",
        ProductType::Ref => matches!(name, "field" | "ccdid" | "qid" | "fid"),
    }
}

/// Composes the natural key from archive-assigned identifiers.
///
/// The composition is fetch-independent: two overlapping chunks that
/// both see a record produce the same key, so the second upsert is a
/// no-op.
fn natural_key(
    product: ProductType,
    exposure_id: Option<i64>,
    ccd_id: Option<i32>,
    quad_id: Option<i32>,
    filter_id: Option<i32>,
    field_id: Option<i64>,
    calibration_id: Option<i64>,
) -> Option<String> {
    match product {
        ProductType::Sci => Some(format!(
            "sci-e{}-c{}-q{}-f{}",
            exposure_id?,
            ccd_id?,
            quad_id?,
            filter_id?
        )),
        ProductType::Raw => Some(format!("raw-e{}-c{}", exposure_id?, ccd_id?)),
        ProductType::Cal => Some(format!("cal-{}", calibration_id?)),
        ProductType::Ref => Some(format!(
            "ref-f{}-c{}-q{}-f{}",
            field_id?,
            ccd_id?,
            quad_id?,
            filter_id?
        )),
    }
}

/// Parses the archive's `startobsdate` text forms.
///
/// Seen in the wild with and without fractional seconds and with a
/// trailing UTC offset (`2017-10-14 03:25:33+00`).
fn parse_obsdate(s: &str) -> Option<DateTime<Utc>> {
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_science_rows() {
        let csv = "obsjd,ra,dec,expid,ccdid,qid,fid,field,exptime\n\
                   2458244.62604,153.42731,39.78253,50123,7,2,1,650,30.0\n\
                   2458244.65122,153.98100,40.01220,50124,7,2,1,650,30.0\n";
        let records = parse_batch(ProductType::Sci, csv).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.natural_key, "sci-e50123-c7-q2-f1");
        assert_eq!(first.night, 490);
        assert_eq!(first.exposure_id, Some(50_123));
        assert_eq!(first.field_id, Some(650));
        assert!((first.ra - 153.42731).abs() < 1e-9);
        assert_eq!(
            first.obs_time.format("%Y-%m-%d").to_string(),
            "2018-05-06".to_string()
        );
    }

    #[test]
    fn parses_calibration_rows_with_obsdate() {
        let csv = "cid,startobsdate,ra,dec,ccdid,qid,fid\n\
                   9917,2017-10-14 03:25:33+00,210.1,15.2,3,1,2\n";
        let records = parse_batch(ProductType::Cal, csv).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].natural_key, "cal-9917");
        assert_eq!(records[0].calibration_id, Some(9917));
        assert_eq!(records[0].night, date_to_night(records[0].obs_time));
    }

    #[test]
    fn parses_reference_rows() {
        let csv = "field,ccdid,qid,fid,ra,dec,startobsdate\n\
                   650,7,2,1,153.5,39.9,2018-03-01 08:00:00\n";
        let records = parse_batch(ProductType::Ref, csv).unwrap();
        assert_eq!(records[0].natural_key, "ref-f650-c7-q2-f1");
    }

    #[test]
    fn raw_key_ignores_quadrant() {
        let csv = "obsjd,ra,dec,expid,ccdid\n2458244.62604,10.0,20.0,50123,7\n";
        let records = parse_batch(ProductType::Raw, csv).unwrap();
        assert_eq!(records[0].natural_key, "raw-e50123-c7");
        assert_eq!(records[0].quad_id, None);
    }

    #[test]
    fn empty_payload_is_empty_batch() {
        assert!(parse_batch(ProductType::Sci, "").unwrap().is_empty());
        assert!(parse_batch(ProductType::Sci, "  \n").unwrap().is_empty());
    }

    #[test]
    fn headers_only_is_empty_batch() {
        let csv = "obsjd,ra,dec,expid,ccdid,qid,fid\n";
        assert!(parse_batch(ProductType::Sci, csv).unwrap().is_empty());
    }

    #[test]
    fn missing_key_column_is_malformed() {
        let csv = "obsjd,ra,dec,ccdid,qid,fid\n2458244.6,10.0,20.0,7,2,1\n";
        let err = parse_batch(ProductType::Sci, csv).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("expid"));
    }

    #[test]
    fn bad_required_value_is_malformed() {
        let csv = "obsjd,ra,dec,expid,ccdid,qid,fid\nnot-a-jd,10.0,20.0,50123,7,2,1\n";
        let err = parse_batch(ProductType::Sci, csv).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn empty_key_component_is_malformed() {
        let csv = "obsjd,ra,dec,expid,ccdid,qid,fid\n2458244.6,10.0,20.0,50123,,2,1\n";
        let err = parse_batch(ProductType::Sci, csv).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("ccdid"));
    }

    #[test]
    fn obsdate_formats() {
        assert!(parse_obsdate("2017-10-14 03:25:33+00").is_some());
        assert!(parse_obsdate("2017-10-14 03:25:33.250+00").is_some());
        assert!(parse_obsdate("2017-10-14 03:25:33").is_some());
        assert!(parse_obsdate("2017-10-14T03:25:33").is_some());
        assert!(parse_obsdate("14/10/2017").is_none());
    }
}
