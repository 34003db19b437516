#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the notes mirror.
//!
//! Serves the import job API: trigger imports, watch their progress, and
//! abort them. All job state lives in Postgres, so every endpoint is a
//! read of the `import_jobs` table. A background scheduler task triggers
//! imports on its own when newer data is published upstream.

mod handlers;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use notes_mirror_database::{db, jobs, run_migrations};
use notes_mirror_importer::{ImportContext, ImporterConfig, SchedulerState, run_scheduler};
use std::sync::Arc;
use switchy_database::Database;

/// Shared application state.
pub struct AppState {
    /// Database connection.
    pub db: Arc<dyn Database>,
    /// Everything a background import run needs.
    pub ctx: ImportContext,
    /// Scheduler observability state.
    pub scheduler: Arc<SchedulerState>,
}

/// Starts the notes mirror API server.
///
/// Connects to Postgres, runs migrations, sweeps jobs left non-terminal
/// by a previous process (crash recovery), spawns the scheduler task,
/// and starts the Actix-Web HTTP server. This is a regular async
/// function — the caller provides the async runtime (e.g. via
/// `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind
/// or encounters a runtime error.
///
/// # Panics
///
/// Panics if the database connection, migrations, or the startup sweep
/// of interrupted jobs fail.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    log::info!("Connecting to database...");
    let db_conn = db::connect_from_env()
        .await
        .expect("Failed to connect to database");

    log::info!("Running migrations...");
    run_migrations(db_conn.as_ref())
        .await
        .expect("Failed to run migrations");

    // Jobs left 'downloading' or 'importing' by a dead process would
    // block new imports forever. Sweep them before accepting requests.
    let swept = jobs::fail_interrupted_jobs(db_conn.as_ref())
        .await
        .expect("Failed to sweep interrupted jobs");
    if swept > 0 {
        log::info!("Marked {swept} interrupted job(s) as failed");
    }

    let config = Arc::new(ImporterConfig::from_env());
    let db: Arc<dyn Database> = Arc::from(db_conn);

    let ctx = ImportContext {
        db: Arc::clone(&db),
        client: reqwest::Client::new(),
        config: Arc::clone(&config),
    };

    let scheduler = Arc::new(SchedulerState::new(&config));
    tokio::spawn(run_scheduler(ctx.clone(), Arc::clone(&scheduler)));

    let state = web::Data::new(AppState { db, ctx, scheduler });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .route("/health", web::get().to(handlers::health))
            .service(
                web::scope("/imports")
                    .route("", web::post().to(handlers::create_import))
                    .route("", web::get().to(handlers::list_imports))
                    // Literal segments must register before {job_id}.
                    .route("/current", web::get().to(handlers::current_import))
                    .route(
                        "/latest-available",
                        web::get().to(handlers::latest_available),
                    )
                    .route(
                        "/last-import-date",
                        web::get().to(handlers::last_import_date),
                    )
                    .route("/scheduler", web::get().to(handlers::scheduler_status))
                    .route("/{job_id}", web::get().to(handlers::get_import))
                    .route("/{job_id}", web::delete().to(handlers::abort_import))
                    .route("/{job_id}/abort", web::post().to(handlers::abort_import)),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
