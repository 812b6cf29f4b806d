//! Canonical file paths for the `DuckDB` data directory.
//!
//! All stores live under `data/archive/` relative to the workspace
//! root, or under `SKYVAULT_DATA_DIR` when set.

use std::path::{Path, PathBuf};

use skyvault_archive_models::ProductType;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "SKYVAULT_DATA_DIR";

/// Returns the workspace root directory.
///
/// Resolved at compile time from `CARGO_MANIFEST_DIR`.
///
/// # Panics
///
/// Panics if the workspace root cannot be resolved.
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .expect("Failed to find workspace root from CARGO_MANIFEST_DIR")
        .to_path_buf()
}

/// Returns the data directory (`SKYVAULT_DATA_DIR` or `<root>/data`).
#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map_or_else(|_| workspace_root().join("data"), PathBuf::from)
}

/// Returns the directory holding per-product store files.
#[must_use]
pub fn archive_dir() -> PathBuf {
    data_dir().join("archive")
}

/// Returns the path of a product type's store file.
#[must_use]
pub fn store_path(product: ProductType) -> PathBuf {
    archive_dir().join(format!("{product}.duckdb"))
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
