mod jobs;
mod scan;
mod upload;

pub use jobs::{delete_job_handler, get_job_by_id_handler, get_jobs_handler, get_stats_handler};
pub use scan::{get_scan_handler, post_scan_handler, post_vm_scan_handler};
pub use upload::post_upload_handler;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::{CleanupFailure, Error};

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

#[derive(Serialize)]
struct PartialCleanupResponse {
    reason: &'static str,
    code: u32,
    #[serde(rename = "jobID")]
    job_id: String,
    failures: Vec<CleanupFailure>,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

/// Maps a core error onto the wire shape shared by every handler.
pub(crate) fn error_response(job_id: &str, err: &Error) -> HttpResponse {
    match err {
        Error::Validation(_) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message: err.to_string(),
        }),
        Error::InvalidState { .. } => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_STATE",
            code: 2,
            message: err.to_string(),
        }),
        Error::NotFound(_) => HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: err.to_string(),
        }),
        Error::CapacityExceeded { .. } => {
            HttpResponse::PayloadTooLarge().json(ErrorResponseWithMessage {
                reason: "ERR_CAPACITY",
                code: 4,
                message: err.to_string(),
            })
        }
        Error::ExternalTool { .. } | Error::Store(_) | Error::Io(_) => {
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
        Error::Protocol { .. } => HttpResponse::BadGateway().json(ErrorResponseWithMessage {
            reason: "ERR_PROTOCOL",
            code: 7,
            message: err.to_string(),
        }),
        Error::SupervisorTimeout(_) => {
            HttpResponse::GatewayTimeout().json(ErrorResponseWithMessage {
                reason: "ERR_TIMEOUT",
                code: 8,
                message: err.to_string(),
            })
        }
        // the attempt completed; report what is left rather than a bare 5xx
        Error::PartialCleanup(failures) => HttpResponse::Ok().json(PartialCleanupResponse {
            reason: "ERR_PARTIAL_CLEANUP",
            code: 9,
            job_id: job_id.to_string(),
            failures: failures.clone(),
        }),
    }
}
