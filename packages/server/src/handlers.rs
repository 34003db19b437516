//! HTTP handler functions for the notes mirror API.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use notes_mirror_database::jobs;
use notes_mirror_importer::discovery::{self, DiscoveryError};
use notes_mirror_importer::spawn_import;
use notes_mirror_models::{CreateImportParams, CreatedJob, Problem};

use crate::AppState;

/// Builds an `application/problem+json` response.
fn problem(status: StatusCode, title: &str, detail: &str) -> HttpResponse {
    HttpResponse::build(status)
        .content_type("application/problem+json")
        .json(Problem::new(status.as_u16(), title, detail))
}

fn internal_error(context: &str) -> HttpResponse {
    problem(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", context)
}

/// `GET /health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /imports`
///
/// Creates a new import job and kicks off the background run. The job
/// row insert is atomic against the single-active invariant, so a
/// concurrent request loses cleanly with a 409.
pub async fn create_import(
    state: web::Data<AppState>,
    params: web::Query<CreateImportParams>,
) -> HttpResponse {
    match jobs::create_job(state.db.as_ref()).await {
        Ok(Some(job_id)) => {
            log::info!("Starting import job {job_id}");
            spawn_import(state.ctx.clone(), job_id.clone(), params.limit);

            HttpResponse::Created()
                .insert_header(("Location", format!("/imports/{job_id}")))
                .json(CreatedJob {
                    message: "Import started".to_string(),
                    job_id,
                })
        }
        Ok(None) => problem(
            StatusCode::CONFLICT,
            "Conflict",
            "Import already in progress",
        ),
        Err(e) => {
            log::error!("Failed to create import job: {e}");
            internal_error("Failed to create import job")
        }
    }
}

/// `GET /imports`
///
/// Newest-first job history, capped at 50 records.
pub async fn list_imports(state: web::Data<AppState>) -> HttpResponse {
    match jobs::list_jobs(state.db.as_ref(), 50).await {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(e) => {
            log::error!("Failed to list import jobs: {e}");
            internal_error("Failed to list import jobs")
        }
    }
}

/// `GET /imports/current`
///
/// The most recent job, active or not. An empty object when the history
/// is empty, so pollers never see a 404 here.
pub async fn current_import(state: web::Data<AppState>) -> HttpResponse {
    match jobs::current_job(state.db.as_ref()).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => HttpResponse::Ok().json(serde_json::json!({})),
        Err(e) => {
            log::error!("Failed to read current import job: {e}");
            internal_error("Failed to read current import job")
        }
    }
}

/// `GET /imports/latest-available`
///
/// Read-only discovery probe: the newest published date within the
/// lookback window and how many archives it carries.
pub async fn latest_available(state: web::Data<AppState>) -> HttpResponse {
    let ctx = &state.ctx;

    let date = match discovery::find_latest_date(
        &ctx.client,
        &ctx.config.base_url,
        ctx.config.lookback_days,
    )
    .await
    {
        Ok(date) => date,
        Err(e @ DiscoveryError::NoDataFound { .. }) => {
            return problem(StatusCode::NOT_FOUND, "Not Found", &e.to_string());
        }
        Err(e) => {
            log::error!("Discovery probe failed: {e}");
            return internal_error("Discovery probe failed");
        }
    };

    match discovery::count_files(&ctx.client, &ctx.config.base_url, date).await {
        Ok(total_files) => HttpResponse::Ok().json(serde_json::json!({
            "date": date,
            "total_files": total_files,
        })),
        Err(e) => {
            log::error!("File count probe failed for {date}: {e}");
            internal_error("Discovery probe failed")
        }
    }
}

/// `GET /imports/last-import-date`
pub async fn last_import_date(state: web::Data<AppState>) -> HttpResponse {
    match jobs::last_import_date(state.db.as_ref()).await {
        Ok(Some(date)) => HttpResponse::Ok().json(serde_json::json!({
            "last_import_date": date,
        })),
        Ok(None) => problem(
            StatusCode::NOT_FOUND,
            "Not Found",
            "No completed import yet",
        ),
        Err(e) => {
            log::error!("Failed to read last import date: {e}");
            internal_error("Failed to read last import date")
        }
    }
}

/// `GET /imports/scheduler`
pub async fn scheduler_status(state: web::Data<AppState>) -> HttpResponse {
    let last_import_date = match jobs::last_import_date(state.db.as_ref()).await {
        Ok(date) => date,
        Err(e) => {
            log::warn!("Failed to read last import date for scheduler status: {e}");
            None
        }
    };

    HttpResponse::Ok().json(state.scheduler.status(last_import_date))
}

/// `GET /imports/{job_id}`
pub async fn get_import(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let job_id = path.into_inner();

    match jobs::get_job(state.db.as_ref(), &job_id).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => problem(
            StatusCode::NOT_FOUND,
            "Not Found",
            "No import job with this id",
        ),
        Err(e) => {
            log::error!("Failed to read import job {job_id}: {e}");
            internal_error("Failed to read import job")
        }
    }
}

/// `POST /imports/{job_id}/abort` and `DELETE /imports/{job_id}`
///
/// Succeeds only while the job is still non-terminal; an unknown id and
/// an already-finished job are the same 404 to the caller.
pub async fn abort_import(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let job_id = path.into_inner();

    match jobs::abort_job(state.db.as_ref(), &job_id).await {
        Ok(true) => {
            log::info!("Abort requested for import job {job_id}");
            HttpResponse::NoContent().finish()
        }
        Ok(false) => problem(
            StatusCode::NOT_FOUND,
            "Not Found",
            "No active import job with this id",
        ),
        Err(e) => {
            log::error!("Failed to abort import job {job_id}: {e}");
            internal_error("Failed to abort import job")
        }
    }
}
