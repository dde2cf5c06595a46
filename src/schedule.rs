// In-memory GTFS schedule store for the Swiss national timetable feed.
// Feed reference: https://opentransportdata.swiss/en/cookbook/gtfs/
//
// Six files make up the schedule: agency.txt, stops.txt, routes.txt,
// trips.txt, stop_times.txt and calendar.txt. They are parsed concurrently
// (one blocking task per file) and joined before any index is built. A file
// that is simply absent yields an empty table; an unreadable file or a file
// without its required columns aborts the whole load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RailError, Result};

// ============================================================================
// Schedule Rows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    pub agency_id: String,
    pub agency_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub agency_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: Option<String>,
}

// Arrival/departure stay as the raw "HH:MM:SS" text from the feed; the live
// engine parses them per query and handles one-sided or malformed values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_id: String,
    pub stop_sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: String,
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
    pub start_date: String,
    pub end_date: String,
}

// ============================================================================
// Store
// ============================================================================

/// All schedule tables plus their identifier indexes. Built once per load and
/// never mutated afterwards; a reload constructs a fresh store and swaps it in
/// under the caller's write lock.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    pub agencies: HashMap<String, Agency>,
    pub stops: HashMap<String, Stop>,
    pub routes: HashMap<String, Route>,
    pub trips: HashMap<String, Trip>,
    /// trip_id -> stop-time entries, sorted by stop_sequence (unique per trip)
    pub stop_times: HashMap<String, Vec<StopTime>>,
    pub calendar: HashMap<String, ServiceCalendar>,
    pub loaded_at: u64,
    loaded: bool,
}

impl ScheduleStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[cfg(test)]
    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
        self.loaded_at = unix_now();
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    pub fn route(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn agency(&self, agency_id: &str) -> Option<&Agency> {
        self.agencies.get(agency_id)
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.get(trip_id)
    }

    pub fn trip_entries(&self, trip_id: &str) -> Option<&[StopTime]> {
        self.stop_times.get(trip_id).map(|entries| entries.as_slice())
    }

    pub fn stats(&self) -> String {
        let age = unix_now().saturating_sub(self.loaded_at);
        format!(
            "📊 Schedule Statistics:\n\
             • {} agencies | {} stops | {} routes\n\
             • {} trips | {} trips with stop times | {} services\n\
             • Loaded: {} | Age: {}s",
            self.agencies.len(),
            self.stops.len(),
            self.routes.len(),
            self.trips.len(),
            self.stop_times.len(),
            self.calendar.len(),
            self.loaded,
            age,
        )
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Loading
// ============================================================================

/// Parses the six schedule files concurrently and builds the store. Any parse
/// or I/O failure (other than a missing file) surfaces here once and leaves
/// the caller's previous store untouched.
pub async fn load_schedule(dir: &Path) -> Result<ScheduleStore> {
    println!("📂 Loading GTFS schedule from {}", dir.display());

    let base = dir.to_path_buf();
    let agencies = spawn_parse(&base, "agency.txt", parse_agencies);
    let stops = spawn_parse(&base, "stops.txt", parse_stops);
    let routes = spawn_parse(&base, "routes.txt", parse_routes);
    let trips = spawn_parse(&base, "trips.txt", parse_trips);
    let stop_times = spawn_parse(&base, "stop_times.txt", parse_stop_times);
    let calendar = spawn_parse(&base, "calendar.txt", parse_calendar);

    let (agencies, stops, routes, trips, stop_time_rows, calendar) =
        tokio::try_join!(agencies, stops, routes, trips, stop_times, calendar)
            .map_err(|e| RailError::FileError(format!("Schedule load task failed: {}", e)))?;
    let (agencies, stops, routes, trips, stop_time_rows, calendar) =
        (agencies?, stops?, routes?, trips?, stop_time_rows?, calendar?);

    // Index building starts only once every file has parsed.
    let mut stop_times: HashMap<String, Vec<StopTime>> = HashMap::new();
    for entry in stop_time_rows {
        stop_times.entry(entry.trip_id.clone()).or_default().push(entry);
    }
    for entries in stop_times.values_mut() {
        entries.sort_by_key(|e| e.stop_sequence);
        entries.dedup_by_key(|e| e.stop_sequence);
    }

    println!(
        "✓ Schedule loaded: {} agencies, {} stops, {} routes, {} trips, {} services",
        agencies.len(),
        stops.len(),
        routes.len(),
        trips.len(),
        calendar.len(),
    );

    Ok(ScheduleStore {
        agencies,
        stops,
        routes,
        trips,
        stop_times,
        calendar,
        loaded_at: unix_now(),
        loaded: true,
    })
}

fn spawn_parse<T: Send + 'static>(
    base: &Path,
    file: &'static str,
    parse: fn(&Path) -> Result<T>,
) -> tokio::task::JoinHandle<Result<T>> {
    let path = base.join(file);
    tokio::task::spawn_blocking(move || parse(&path))
}

// ============================================================================
// CSV Parsing
// ============================================================================

/// Opens a schedule file. A missing file is not an error: the table is simply
/// empty (regional feed exports routinely omit optional files).
fn open_table(path: &Path) -> Result<Option<csv::Reader<File>>> {
    match File::open(path) {
        Ok(file) => Ok(Some(
            csv::ReaderBuilder::new().flexible(true).from_reader(file),
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::warn!("{} missing, treating table as empty", path.display());
            Ok(None)
        }
        Err(e) => Err(RailError::FileError(format!(
            "Failed to open {}: {}",
            path.display(),
            e
        ))),
    }
}

// Column positions vary between feed exports, so fields are looked up by
// header name rather than by index. The first header may carry a UTF-8 BOM.
fn header_columns(
    reader: &mut csv::Reader<File>,
    file: &str,
    required: &[&str],
) -> Result<HashMap<String, usize>> {
    let headers = reader
        .headers()
        .map_err(|e| RailError::ParseError(format!("{}: unreadable header: {}", file, e)))?;
    let columns: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().trim_start_matches('\u{feff}').to_string(), i))
        .collect();
    for name in required {
        if !columns.contains_key(*name) {
            return Err(RailError::ParseError(format!(
                "{}: missing required column '{}'",
                file, name
            )));
        }
    }
    Ok(columns)
}

fn field<'a>(
    record: &'a csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
) -> Option<&'a str> {
    columns.get(name).and_then(|&i| record.get(i))
}

fn parse_agencies(path: &Path) -> Result<HashMap<String, Agency>> {
    let mut agencies = HashMap::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(agencies);
    };
    let columns = header_columns(&mut reader, "agency.txt", &["agency_name"])?;

    for result in reader.records() {
        if let Ok(record) = result {
            let Some(name) = field(&record, &columns, "agency_name") else {
                continue;
            };
            // agency_id is optional when the feed has a single agency
            let id = field(&record, &columns, "agency_id").unwrap_or("").to_string();
            agencies.insert(
                id.clone(),
                Agency {
                    agency_id: id,
                    agency_name: name.to_string(),
                },
            );
        }
    }

    Ok(agencies)
}

fn parse_stops(path: &Path) -> Result<HashMap<String, Stop>> {
    let mut stops = HashMap::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(stops);
    };
    let columns = header_columns(
        &mut reader,
        "stops.txt",
        &["stop_id", "stop_name", "stop_lat", "stop_lon"],
    )?;

    for result in reader.records() {
        if let Ok(record) = result {
            let (Some(stop_id), Some(stop_name), Some(lat_str), Some(lon_str)) = (
                field(&record, &columns, "stop_id"),
                field(&record, &columns, "stop_name"),
                field(&record, &columns, "stop_lat"),
                field(&record, &columns, "stop_lon"),
            ) else {
                continue;
            };

            // Skip parent stations, keep platforms and plain stops
            if field(&record, &columns, "location_type") == Some("1") {
                continue;
            }

            if let (Ok(lat), Ok(lon)) = (lat_str.parse::<f64>(), lon_str.parse::<f64>()) {
                if lat != 0.0 && lon != 0.0 {
                    stops.insert(
                        stop_id.to_string(),
                        Stop {
                            stop_id: stop_id.to_string(),
                            stop_name: stop_name.to_string(),
                            latitude: lat,
                            longitude: lon,
                        },
                    );
                }
            }
        }
    }

    Ok(stops)
}

fn parse_routes(path: &Path) -> Result<HashMap<String, Route>> {
    let mut routes = HashMap::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(routes);
    };
    let columns = header_columns(&mut reader, "routes.txt", &["route_id"])?;

    for result in reader.records() {
        if let Ok(record) = result {
            let Some(route_id) = field(&record, &columns, "route_id") else {
                continue;
            };
            routes.insert(
                route_id.to_string(),
                Route {
                    route_id: route_id.to_string(),
                    route_short_name: field(&record, &columns, "route_short_name")
                        .unwrap_or("")
                        .to_string(),
                    route_long_name: field(&record, &columns, "route_long_name")
                        .unwrap_or("")
                        .to_string(),
                    agency_id: field(&record, &columns, "agency_id").unwrap_or("").to_string(),
                },
            );
        }
    }

    Ok(routes)
}

fn parse_trips(path: &Path) -> Result<HashMap<String, Trip>> {
    let mut trips = HashMap::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(trips);
    };
    let columns = header_columns(&mut reader, "trips.txt", &["trip_id", "route_id"])?;

    for result in reader.records() {
        if let Ok(record) = result {
            let (Some(trip_id), Some(route_id)) = (
                field(&record, &columns, "trip_id"),
                field(&record, &columns, "route_id"),
            ) else {
                continue;
            };
            trips.insert(
                trip_id.to_string(),
                Trip {
                    trip_id: trip_id.to_string(),
                    route_id: route_id.to_string(),
                    service_id: field(&record, &columns, "service_id").unwrap_or("").to_string(),
                    trip_headsign: field(&record, &columns, "trip_headsign")
                        .map(|s| s.to_string())
                        .filter(|s| !s.is_empty()),
                },
            );
        }
    }

    Ok(trips)
}

fn parse_stop_times(path: &Path) -> Result<Vec<StopTime>> {
    let mut rows = Vec::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(rows);
    };
    let columns = header_columns(
        &mut reader,
        "stop_times.txt",
        &["trip_id", "stop_id", "stop_sequence"],
    )?;

    for result in reader.records() {
        if let Ok(record) = result {
            let (Some(trip_id), Some(stop_id), Some(sequence_str)) = (
                field(&record, &columns, "trip_id"),
                field(&record, &columns, "stop_id"),
                field(&record, &columns, "stop_sequence"),
            ) else {
                continue;
            };
            let Ok(stop_sequence) = sequence_str.parse::<u32>() else {
                continue;
            };
            rows.push(StopTime {
                trip_id: trip_id.to_string(),
                arrival_time: field(&record, &columns, "arrival_time").unwrap_or("").to_string(),
                departure_time: field(&record, &columns, "departure_time")
                    .unwrap_or("")
                    .to_string(),
                stop_id: stop_id.to_string(),
                stop_sequence,
            });
        }
    }

    Ok(rows)
}

fn parse_calendar(path: &Path) -> Result<HashMap<String, ServiceCalendar>> {
    let mut calendar = HashMap::new();
    let Some(mut reader) = open_table(path)? else {
        return Ok(calendar);
    };
    let columns = header_columns(
        &mut reader,
        "calendar.txt",
        &["service_id", "start_date", "end_date"],
    )?;

    for result in reader.records() {
        if let Ok(record) = result {
            let (Some(service_id), Some(start_date), Some(end_date)) = (
                field(&record, &columns, "service_id"),
                field(&record, &columns, "start_date"),
                field(&record, &columns, "end_date"),
            ) else {
                continue;
            };
            let day = |name: &str| field(&record, &columns, name) == Some("1");
            calendar.insert(
                service_id.to_string(),
                ServiceCalendar {
                    service_id: service_id.to_string(),
                    monday: day("monday"),
                    tuesday: day("tuesday"),
                    wednesday: day("wednesday"),
                    thursday: day("thursday"),
                    friday: day("friday"),
                    saturday: day("saturday"),
                    sunday: day("sunday"),
                    start_date: start_date.to_string(),
                    end_date: end_date.to_string(),
                },
            );
        }
    }

    Ok(calendar)
}

// ============================================================================
// Tests
// ============================================================================
