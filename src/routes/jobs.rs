use actix_web::{HttpResponse, Responder, delete, get, web};
use serde::Deserialize;

use super::error_response;
use crate::database::{JobFilter, VmState};
use crate::error::Error;
use crate::orchestrator::Orchestrator;

#[derive(Deserialize)]
pub struct JobsQueryParams {
    /// Return only the N most recent jobs
    pub limit: Option<u32>,
    pub vm_state: Option<String>,
    pub hash: Option<String>,
}

impl JobsQueryParams {
    fn into_filter(self) -> Result<JobFilter, Error> {
        let vm_state = match self.vm_state {
            Some(raw) => Some(raw.parse::<VmState>().map_err(Error::Validation)?),
            None => None,
        };
        Ok(JobFilter {
            limit: self.limit,
            vm_state,
            hash: self.hash,
        })
    }
}

#[get("/jobs")]
pub async fn get_jobs_handler(
    orchestrator: web::Data<Orchestrator>,
    query: web::Query<JobsQueryParams>,
) -> impl Responder {
    let filter = match query.into_inner().into_filter() {
        Ok(filter) => filter,
        Err(e) => return error_response("", &e),
    };

    match orchestrator.list(&filter).await {
        Ok(jobs) => {
            log::info!("Got {} job records", jobs.len());
            HttpResponse::Ok().json(jobs)
        }
        Err(e) => {
            log::error!("Failed to retrieve job records: {e}");
            error_response("", &e)
        }
    }
}

#[get("/jobs/{id}")]
pub async fn get_job_by_id_handler(
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match orchestrator.get(&job_id).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(e @ Error::NotFound(_)) => {
            log::info!("Got nothing with job id {job_id} from store");
            error_response(&job_id, &e)
        }
        Err(e) => {
            log::error!("Failed to retrieve job {job_id}: {e}");
            error_response(&job_id, &e)
        }
    }
}

#[delete("/jobs/{id}")]
pub async fn delete_job_handler(
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let job_id = path.into_inner().0;

    match orchestrator.delete(&job_id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "cleaned",
            "jobID": job_id,
        })),
        Err(e @ Error::PartialCleanup(_)) => {
            log::warn!("Cleanup for job {job_id} was partial: {e}");
            error_response(&job_id, &e)
        }
        Err(e) => {
            log::error!("Cleanup error for job {job_id}: {e}");
            error_response(&job_id, &e)
        }
    }
}

#[get("/stats")]
pub async fn get_stats_handler(orchestrator: web::Data<Orchestrator>) -> impl Responder {
    match orchestrator.stats().await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => {
            log::error!("Failed to compute job stats: {e}");
            error_response("", &e)
        }
    }
}
