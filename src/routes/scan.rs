use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Deserialize;

use super::error_response;
use crate::orchestrator::Orchestrator;

#[derive(Deserialize)]
pub struct RunQueryParams {
    /// Attach a NIC to the guest; defaults to the configured policy
    pub network: Option<bool>,
}

#[post("/vm/scan/{id}")]
pub async fn post_vm_scan_handler(
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<(String,)>,
    query: web::Query<RunQueryParams>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match orchestrator.run(&job_id, query.network).await {
        Ok(job) => {
            log::info!("VM started successfully for job {job_id}");
            HttpResponse::Ok().json(serde_json::json!({
                "status": "vm_started",
                "jobID": job.id,
                "vmState": job.vm_state,
            }))
        }
        Err(e) => {
            log::error!("Failed to start VM for job {job_id}: {e}");
            error_response(&job_id, &e)
        }
    }
}

#[post("/scan/{id}")]
pub async fn post_scan_handler(
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match orchestrator.rescan(&job_id).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            log::error!("YARA scan error for job {job_id}: {e}");
            error_response(&job_id, &e)
        }
    }
}

#[get("/scan/{id}")]
pub async fn get_scan_handler(
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match orchestrator.report(&job_id).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            log::info!("Scan results not found for job {job_id}: {e}");
            error_response(&job_id, &e)
        }
    }
}
