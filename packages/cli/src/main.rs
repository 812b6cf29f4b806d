#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the skyvault metadata mirror.
//!
//! `build` and `sync` populate the local per-product stores from the
//! remote archive; `query` answers position lookups from the union of
//! local and remote data; `nid` converts between night ids and dates
//! for diagnostics. Ctrl-C cancels the remaining ingestion queue
//! without touching chunks already committed.

mod progress;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use skyvault_archive::ArchiveClient;
use skyvault_archive_models::time::{date_to_night, night_to_date};
use skyvault_archive_models::{ProductType, TimeRange};
use skyvault_database::RecordStore;
use skyvault_ingest::{CancelToken, IngestOptions, IngestSummary};
use skyvault_query::FederatedQuery;

use crate::progress::IndicatifProgress;

#[derive(Parser)]
#[command(name = "skyvault", about = "Mirror and query an astronomical metadata archive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or extend) the local store over the whole archive history
    Build {
        /// Product type to ingest (sci, raw, cal, ref)
        #[arg(long, default_value = "sci")]
        product: ProductType,
        /// Nights per fetch chunk
        #[arg(long, default_value = "7")]
        chunk_nights: i64,
        /// Parallel fetch workers
        #[arg(long, default_value = "8")]
        workers: usize,
    },
    /// Ingest a specific time range
    Sync {
        /// Start of the range (`YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`)
        start: String,
        /// End of the range; defaults to now
        end: Option<String>,
        /// Product type to ingest (sci, raw, cal, ref)
        #[arg(long, default_value = "sci")]
        product: ProductType,
        /// Nights per fetch chunk
        #[arg(long, default_value = "7")]
        chunk_nights: i64,
        /// Parallel fetch workers
        #[arg(long, default_value = "8")]
        workers: usize,
    },
    /// Ingest a single night or an inclusive night-id range
    Night {
        /// First (or only) night id
        night: i64,
        /// Last night id of the range
        end_night: Option<i64>,
        /// Product type to ingest (sci, raw, cal, ref)
        #[arg(long, default_value = "sci")]
        product: ProductType,
        /// Nights per fetch chunk
        #[arg(long, default_value = "7")]
        chunk_nights: i64,
        /// Parallel fetch workers
        #[arg(long, default_value = "8")]
        workers: usize,
    },
    /// Query a sky position across the local mirror and the remote archive
    Query {
        /// Right ascension, degrees
        ra: f64,
        /// Declination, degrees
        dec: f64,
        /// Product type to query (sci, raw, cal, ref)
        #[arg(long, default_value = "sci")]
        product: ProductType,
        /// Window start (`YYYY-MM-DD`); defaults to the archive epoch
        #[arg(long)]
        start: Option<String>,
        /// Window end (`YYYY-MM-DD`); defaults to now
        #[arg(long)]
        end: Option<String>,
        /// Search radius in degrees; defaults to one quadrant footprint
        #[arg(long)]
        radius: Option<f64>,
    },
    /// Convert a night id to its date, or a date to its night id
    Nid {
        /// A night id (integer) or a date (`YYYY-MM-DD`)
        value: String,
    },
}

/// Parses `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` into a UTC timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    Err(format!(
        "unrecognized date {s:?} (expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)"
    ))
}

/// Spawns a task flipping the cancel token on Ctrl-C.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, finishing in-flight chunks...");
            token.cancel();
        }
    });
    cancel
}

fn report_summary(summary: &IngestSummary) {
    println!("{summary}");
    if !summary.failed_chunks.is_empty() {
        println!("failed chunks (re-run these spans to fill the holes):");
        for failed in &summary.failed_chunks {
            let kind = if failed.malformed { "malformed" } else { "failed" };
            println!(
                "  night {}..={} [{kind}]: {}",
                failed.chunk.night_start, failed.chunk.night_end, failed.error
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = progress::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            product,
            chunk_nights,
            workers,
        } => {
            let client = ArchiveClient::from_env()?;
            let store = RecordStore::open(product)?;
            let cancel = cancel_on_interrupt();
            let bar = IndicatifProgress::chunks_bar(&multi, &format!("building {product} store"));

            let summary = skyvault_ingest::build_database(
                &client,
                &store,
                IngestOptions {
                    chunk_nights,
                    workers,
                },
                &cancel,
                Some(bar),
            )
            .await?;
            report_summary(&summary);
        }
        Commands::Sync {
            start,
            end,
            product,
            chunk_nights,
            workers,
        } => {
            let window = TimeRange::new(
                parse_datetime(&start)?,
                end.as_deref().map_or_else(|| Ok(Utc::now()), parse_datetime)?,
            );
            let client = ArchiveClient::from_env()?;
            let store = RecordStore::open(product)?;
            let cancel = cancel_on_interrupt();
            let bar = IndicatifProgress::chunks_bar(&multi, &format!("syncing {product} {window}"));

            let summary = skyvault_ingest::insert_for_time_range(
                &client,
                &store,
                &window,
                IngestOptions {
                    chunk_nights,
                    workers,
                },
                &cancel,
                Some(bar),
            )
            .await?;
            report_summary(&summary);
        }
        Commands::Night {
            night,
            end_night,
            product,
            chunk_nights,
            workers,
        } => {
            let client = ArchiveClient::from_env()?;
            let store = RecordStore::open(product)?;
            let cancel = cancel_on_interrupt();
            let bar = IndicatifProgress::chunks_bar(&multi, &format!("ingesting {product} nights"));

            let summary = skyvault_ingest::insert_for_night_range(
                &client,
                &store,
                night,
                end_night.unwrap_or(night),
                IngestOptions {
                    chunk_nights,
                    workers,
                },
                &cancel,
                Some(bar),
            )
            .await?;
            report_summary(&summary);
        }
        Commands::Query {
            ra,
            dec,
            product,
            start,
            end,
            radius,
        } => {
            let window = match (&start, &end) {
                (None, None) => None,
                _ => Some(TimeRange::new(
                    start
                        .as_deref()
                        .map_or_else(|| Ok(night_to_date(0)), parse_datetime)?,
                    end.as_deref().map_or_else(|| Ok(Utc::now()), parse_datetime)?,
                )),
            };

            let client = ArchiveClient::from_env()?;
            let store = RecordStore::open(product)?;

            let mut engine = FederatedQuery::new(&client, &store);
            if let Some(radius) = radius {
                engine = engine.with_radius(radius);
            }

            let records = engine.query_position(ra, dec, window).await?;

            println!(
                "{:<21} {:<26} {:>6} {:>11} {:>10} {:>6} {:>4} {:>4}",
                "OBSERVED", "KEY", "NIGHT", "RA", "DEC", "FIELD", "CCD", "QUAD"
            );
            for record in &records {
                println!(
                    "{:<21} {:<26} {:>6} {:>11.5} {:>10.5} {:>6} {:>4} {:>4}",
                    record.obs_time.format("%Y-%m-%d %H:%M:%S"),
                    record.natural_key,
                    record.night,
                    record.ra,
                    record.dec,
                    record.field_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
                    record.ccd_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
                    record.quad_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
                );
            }
            println!("{} record(s)", records.len());
        }
        Commands::Nid { value } => {
            if let Ok(night) = value.parse::<i64>() {
                println!("night {night} = {}", night_to_date(night).format("%Y-%m-%d"));
            } else {
                let t = parse_datetime(&value)?;
                println!("{} = night {}", t.format("%Y-%m-%d"), date_to_night(t));
            }
        }
    }

    Ok(())
}
