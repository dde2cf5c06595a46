// GTFS feed bootstrap: when no local schedule directory exists, the national
// feed archive is downloaded once and the six schedule files are extracted
// into the user cache.
// Feed portal: https://data.opentransportdata.swiss/dataset/timetable-2025-gtfs2020

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use crate::error::{RailError, Result};

const FEED_URL: &str =
    "https://data.opentransportdata.swiss/en/dataset/timetable-2025-gtfs2020/permalink";
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

pub const SCHEDULE_FILES: [&str; 6] = [
    "agency.txt",
    "stops.txt",
    "routes.txt",
    "trips.txt",
    "stop_times.txt",
    "calendar.txt",
];

fn cache_dir() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("swiss_rail_map");
    path
}

/// Returns a directory holding the schedule files, preferring the requested
/// directory, then the user cache, then a fresh download into the cache.
/// Blocking; call before the server starts.
pub fn ensure_schedule_dir(requested: &Path) -> Result<PathBuf> {
    if requested.join("stop_times.txt").exists() {
        return Ok(requested.to_path_buf());
    }

    let cached = cache_dir();
    if cached.join("stop_times.txt").exists() {
        println!("✓ Using cached GTFS feed at {}", cached.display());
        return Ok(cached);
    }

    println!(
        "ℹ️  No schedule found at {}, fetching the national feed",
        requested.display()
    );
    download_feed(&cached)?;
    Ok(cached)
}

fn download_feed(target: &Path) -> Result<()> {
    println!("📥 Downloading Swiss GTFS feed (a few hundred MB, this takes a while)...");

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| RailError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(FEED_URL)
        .send()
        .map_err(|e| RailError::NetworkError(format!("Failed to download GTFS feed: {}", e)))?;

    if !response.status().is_success() {
        return Err(RailError::NetworkError(format!(
            "Feed download failed with status: {}",
            response.status()
        )));
    }

    let zip_bytes: bytes::Bytes = response
        .bytes()
        .map_err(|e| RailError::NetworkError(format!("Failed to read feed archive: {}", e)))?;

    println!("✓ Downloaded {} MB, extracting...", zip_bytes.len() / 1024 / 1024);

    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| RailError::ParseError(format!("Failed to open feed archive: {}", e)))?;

    fs::create_dir_all(target)
        .map_err(|e| RailError::FileError(format!("Failed to create {}: {}", target.display(), e)))?;

    for name in SCHEDULE_FILES {
        match archive.by_name(name) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents).map_err(|e| {
                    RailError::FileError(format!("Failed to read {} from archive: {}", name, e))
                })?;
                fs::write(target.join(name), contents).map_err(|e| {
                    RailError::FileError(format!("Failed to write {}: {}", name, e))
                })?;
                println!("   ✓ Extracted {}", name);
            }
            // the loader treats a missing file as an empty table
            Err(_) => println!("   ⚠️  {} not present in feed archive", name),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_directory_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stop_times.txt"), "trip_id\n").unwrap();
        let resolved = ensure_schedule_dir(dir.path()).unwrap();
        assert_eq!(resolved, dir.path());
    }
}
