// Departure boards: a thin proxy over the public transport API for live
// boards, and a schedule-derived fallback computed from the loaded timetable.
// Transport API reference: https://transport.opendata.ch/docs.html

use chrono::{Datelike, Timelike};
use chrono_tz::Europe::Zurich;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{RailError, Result};
use crate::live::{time_to_minutes, DEFAULT_CATEGORY, DEFAULT_OPERATOR};
use crate::schedule::ScheduleStore;

const TRANSPORT_API_BASE: &str = "https://transport.opendata.ch/v1";
// The public API allows 1000 route/stationboard requests per day and key-less
// clients share that budget, so the proxy stops itself before the upstream
// does.
const DAILY_REQUEST_QUOTA: u32 = 1000;
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const MAX_DEPARTURES: usize = 10;

// ============================================================================
// Transport API Proxy
// ============================================================================

struct QuotaWindow {
    day: String,
    used: u32,
}

pub struct TransportApiClient {
    quota: Mutex<QuotaWindow>,
}

impl TransportApiClient {
    pub fn new() -> Self {
        TransportApiClient {
            quota: Mutex::new(QuotaWindow {
                day: String::new(),
                used: 0,
            }),
        }
    }

    // Counts a request against today's quota; the window resets when the
    // date changes.
    fn admit(&self) -> Result<()> {
        let today = chrono::Utc::now()
            .with_timezone(&Zurich)
            .format("%Y%m%d")
            .to_string();
        let mut quota = self
            .quota
            .lock()
            .map_err(|e| RailError::NetworkError(format!("Failed to lock quota: {}", e)))?;
        if quota.day != today {
            quota.day = today;
            quota.used = 0;
        }
        if quota.used >= DAILY_REQUEST_QUOTA {
            return Err(RailError::RateLimited(format!(
                "daily quota of {} transport API requests exhausted",
                DAILY_REQUEST_QUOTA
            )));
        }
        quota.used += 1;
        Ok(())
    }

    /// Blocking fetch of the upstream station board; run via spawn_blocking.
    pub fn station_board(&self, station: &str, limit: usize) -> Result<serde_json::Value> {
        self.admit()?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RailError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let limit = limit.to_string();
        let response = client
            .get(format!("{}/stationboard", TRANSPORT_API_BASE))
            .query(&[("station", station), ("limit", limit.as_str())])
            .send()
            .map_err(|e| RailError::NetworkError(format!("Station board request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RailError::NetworkError(format!(
                "Station board request failed with status: {}",
                response.status()
            )));
        }

        response
            .json()
            .map_err(|e| RailError::ParseError(format!("Station board response was not JSON: {}", e)))
    }
}

// ============================================================================
// Schedule-Derived Departures
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledDeparture {
    pub trip_id: String,
    pub route_id: String,
    pub name: String,
    pub departure_time: String,
    pub destination: Option<String>,
    pub operator: String,
}

/// Upcoming departures at a stop, straight from the static timetable and
/// filtered by calendar.txt service days.
pub fn scheduled_departures(
    store: &ScheduleStore,
    stop_id: &str,
    max_results: usize,
) -> Vec<ScheduledDeparture> {
    let now = chrono::Utc::now().with_timezone(&Zurich);
    let today = format!("{}{:02}{:02}", now.year(), now.month(), now.day());
    let weekday = now.weekday().num_days_from_monday();
    let now_minutes = (now.hour() * 60 + now.minute()) as i32;
    scheduled_departures_at(store, stop_id, &today, weekday, now_minutes, max_results)
}

pub fn scheduled_departures_at(
    store: &ScheduleStore,
    stop_id: &str,
    date: &str,
    weekday: u32,
    now_minutes: i32,
    max_results: usize,
) -> Vec<ScheduledDeparture> {
    let mut departures = Vec::new();

    for (trip_id, entries) in &store.stop_times {
        let Some(trip) = store.trip(trip_id) else {
            continue;
        };
        if !service_runs_on(store, &trip.service_id, date, weekday) {
            continue;
        }
        for entry in entries.iter().filter(|e| e.stop_id == stop_id) {
            let departure = time_to_minutes(&entry.departure_time)
                .or_else(|| time_to_minutes(&entry.arrival_time));
            let Some(departure_minutes) = departure else {
                continue;
            };
            if departure_minutes < now_minutes {
                continue;
            }
            let route = store.route(&trip.route_id);
            departures.push(ScheduledDeparture {
                trip_id: trip_id.clone(),
                route_id: trip.route_id.clone(),
                name: route
                    .map(|r| r.route_short_name.clone())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                departure_time: entry.departure_time.clone(),
                destination: trip.trip_headsign.clone(),
                operator: route
                    .and_then(|r| store.agency(&r.agency_id))
                    .map(|a| a.agency_name.clone())
                    .unwrap_or_else(|| DEFAULT_OPERATOR.to_string()),
            });
        }
    }

    departures.sort_by(|a, b| a.departure_time.cmp(&b.departure_time));

    // same line + time + destination shows once, whichever trip row came first
    let mut seen = HashSet::new();
    departures.retain(|d| {
        seen.insert((
            d.name.clone(),
            d.departure_time.clone(),
            d.destination.clone().unwrap_or_default(),
        ))
    });

    departures.truncate(max_results);
    departures
}

// calendar.txt weekday flags + date range. Feeds that ship no calendar at all
// get every service admitted rather than a permanently empty board; a feed
// WITH a calendar treats unknown service ids as inactive.
fn service_runs_on(store: &ScheduleStore, service_id: &str, date: &str, weekday: u32) -> bool {
    if store.calendar.is_empty() {
        return true;
    }
    let Some(cal) = store.calendar.get(service_id) else {
        return false;
    };
    if date < cal.start_date.as_str() || date > cal.end_date.as_str() {
        return false;
    }
    match weekday {
        0 => cal.monday,
        1 => cal.tuesday,
        2 => cal.wednesday,
        3 => cal.thursday,
        4 => cal.friday,
        5 => cal.saturday,
        6 => cal.sunday,
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
