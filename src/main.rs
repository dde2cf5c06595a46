// Swiss railway live map server
// Train positions are computed from the national GTFS timetable; there is no
// GPS feed. The map frontend consumes the JSON API below.
//
// Data sources:
// - GTFS Static (national feed): https://data.opentransportdata.swiss/
// - Station boards (proxied): https://transport.opendata.ch/

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

mod error;
mod feed;
mod live;
mod schedule;
mod stationboard;

use error::RailError;
use schedule::ScheduleStore;
use stationboard::TransportApiClient;

#[derive(Clone)]
struct AppState {
    schedule: Arc<RwLock<ScheduleStore>>,
    schedule_dir: PathBuf,
    transport_api: Arc<TransportApiClient>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
            sources: vec!["GTFS-CH".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp(),
            sources: vec![],
        }
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

#[derive(Deserialize)]
struct TrainsQuery {
    multiplier: Option<f64>,
}

async fn get_trains(state: web::Data<AppState>, query: web::Query<TrainsQuery>) -> HttpResponse {
    let multiplier = query.multiplier.unwrap_or(1.0);

    match state.schedule.read() {
        Ok(store) => {
            let trains = live::live_trains(&store, multiplier);
            println!(
                "🚆 Live trains requested: {} active (multiplier {})",
                trains.len(),
                multiplier
            );
            HttpResponse::Ok().json(ApiResponse::success(trains))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock schedule: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<Vec<live::TrainView>>::error(
                "Failed to compute live trains".to_string(),
            ))
        }
    }
}

async fn get_stops(state: web::Data<AppState>) -> HttpResponse {
    match state.schedule.read() {
        Ok(store) => {
            let mut stops: Vec<schedule::Stop> = store.stops.values().cloned().collect();
            stops.sort_by(|a, b| a.stop_name.cmp(&b.stop_name));
            println!("📍 Stops requested: {} total", stops.len());
            HttpResponse::Ok().json(ApiResponse::success(stops))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock schedule: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<Vec<schedule::Stop>>::error(
                "Failed to retrieve stops".to_string(),
            ))
        }
    }
}

async fn get_stop_by_id(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let stop_id = path.into_inner();

    match state.schedule.read() {
        Ok(store) => match store.stop(&stop_id) {
            Some(stop) => {
                println!("📍 Stop retrieved: {} ({})", stop.stop_name, stop.stop_id);
                HttpResponse::Ok().json(ApiResponse::success(stop.clone()))
            }
            None => {
                println!("⚠️  Stop not found: {}", stop_id);
                HttpResponse::NotFound().json(ApiResponse::<schedule::Stop>::error(format!(
                    "Stop '{}' not found",
                    stop_id
                )))
            }
        },
        Err(e) => {
            eprintln!("❌ Failed to lock schedule: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<schedule::Stop>::error(
                "Failed to retrieve stop".to_string(),
            ))
        }
    }
}

async fn get_departures(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let stop_id = path.into_inner();

    match state.schedule.read() {
        Ok(store) => {
            let board =
                stationboard::scheduled_departures(&store, &stop_id, stationboard::MAX_DEPARTURES);
            println!("🕐 Departures requested for {}: {} rows", stop_id, board.len());
            HttpResponse::Ok().json(ApiResponse::success(board))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock schedule: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<Vec<stationboard::ScheduledDeparture>>::error(
                    "Failed to compute departures".to_string(),
                ))
        }
    }
}

async fn get_station_board(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let station = path.into_inner();
    let api = state.transport_api.clone();

    match tokio::task::spawn_blocking(move || api.station_board(&station, 10)).await {
        Ok(Ok(board)) => HttpResponse::Ok().json(ApiResponse::success(board)),
        Ok(Err(RailError::RateLimited(message))) => {
            println!("⚠️  Station board request rejected: {}", message);
            HttpResponse::TooManyRequests().json(ApiResponse::<serde_json::Value>::error(message))
        }
        Ok(Err(e)) => {
            eprintln!("⚠️  Station board request failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<serde_json::Value>::error(format!("{}", e)))
        }
        Err(e) => {
            eprintln!("❌ Station board task panicked: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<serde_json::Value>::error(
                "Station board task panicked".to_string(),
            ))
        }
    }
}

async fn get_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.schedule.read() {
        Ok(store) => {
            println!("📊 Stats requested");
            HttpResponse::Ok().json(ApiResponse::success(store.stats()))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock schedule: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve stats".to_string(),
            ))
        }
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let schedule_loaded = state
        .schedule
        .read()
        .map(|store| store.is_loaded())
        .unwrap_or(false);

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Swiss Rail Map",
        "version": "0.1.0",
        "schedule_loaded": schedule_loaded,
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn reload_schedule(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Schedule reload requested...");

    match schedule::load_schedule(&state.schedule_dir).await {
        Ok(fresh) => match state.schedule.write() {
            Ok(mut store) => {
                *store = fresh;
                println!("✓ Schedule reloaded successfully");
                HttpResponse::Ok().json(ApiResponse::success("Schedule reloaded".to_string()))
            }
            Err(e) => {
                eprintln!("❌ Failed to lock schedule for reload: {}", e);
                HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                    "Failed to swap reloaded schedule".to_string(),
                ))
            }
        },
        // the previous store stays in place
        Err(e) => {
            eprintln!("⚠️  Schedule reload failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(format!("Reload failed: {}", e)))
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(state: AppState) -> std::io::Result<()> {
    println!("\n🌐 Server running on: http://0.0.0.0:8080");
    println!("📡 API available at: http://localhost:8080/api\n");

    println!("📍 Available Routes:");
    println!("   GET  /health                       - Health check");
    println!("   GET  /api/trains?multiplier=N      - Live train positions");
    println!("   GET  /api/stops                    - All stops");
    println!("   GET  /api/stop/{{id}}                - Stop by ID");
    println!("   GET  /api/stop/{{id}}/departures     - Timetable departures");
    println!("   GET  /api/stationboard/{{station}}   - Live board (proxied)");
    println!("   GET  /api/stats                    - Schedule statistics");
    println!("   POST /api/reload                   - Reload the schedule\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/trains", web::get().to(get_trains))
                    .route("/stops", web::get().to(get_stops))
                    .route("/stop/{id}", web::get().to(get_stop_by_id))
                    .route("/stop/{id}/departures", web::get().to(get_departures))
                    .route("/stationboard/{station}", web::get().to(get_station_board))
                    .route("/stats", web::get().to(get_stats))
                    .route("/reload", web::post().to(reload_schedule)),
            )
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("\n🚆 Swiss Rail Map Server");
    println!("   Schedule-driven live train positions\n");

    let requested = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gtfs"));

    let schedule_dir = match feed::ensure_schedule_dir(&requested) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("❌ Could not obtain a GTFS schedule: {}", e);
            eprintln!("   Pass a directory containing the GTFS text files as the first argument.");
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(async move {
        let store = match schedule::load_schedule(&schedule_dir).await {
            Ok(store) => store,
            Err(e) => {
                eprintln!("❌ Failed to load schedule: {}", e);
                eprintln!("   Server cannot start without a timetable.");
                std::process::exit(1);
            }
        };

        let state = AppState {
            schedule: Arc::new(RwLock::new(store)),
            schedule_dir,
            transport_api: Arc::new(TransportApiClient::new()),
        };

        run_server(state).await
    })
}
