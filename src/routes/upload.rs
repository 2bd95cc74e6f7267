use actix_multipart::Multipart;
use actix_web::{HttpResponse, Responder, post, web};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::error_response;
use crate::error::Error;
use crate::orchestrator::{Orchestrator, SubmitOptions};

#[derive(Serialize)]
pub struct UploadResponse {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub hash: String,
    pub status: &'static str,
}

#[derive(Deserialize)]
pub struct UploadQueryParams {
    /// Per-job override of the input image size
    pub image_size_mib: Option<u64>,
}

#[post("/upload")]
pub async fn post_upload_handler(
    orchestrator: web::Data<Orchestrator>,
    query: web::Query<UploadQueryParams>,
    mut payload: Multipart,
) -> impl Responder {
    let mut upload: Option<(String, Vec<u8>)> = None;

    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                log::info!("upload rejected, malformed multipart body: {e}");
                return error_response(
                    "",
                    &Error::Validation(format!("malformed multipart body: {e}")),
                );
            }
        };
        if field.name() != Some("file") {
            // drain the unwanted part so the stream can advance
            while let Ok(Some(_)) = field.try_next().await {}
            continue;
        }

        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or("upload.bin")
            .to_string();
        let mut data = Vec::new();
        loop {
            match field.try_next().await {
                Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    log::info!("upload rejected, truncated file part: {e}");
                    return error_response(
                        "",
                        &Error::Validation(format!("truncated file part: {e}")),
                    );
                }
            }
        }
        upload = Some((name, data));
    }

    let Some((name, data)) = upload else {
        return error_response(
            "",
            &Error::Validation("multipart field 'file' is required".to_string()),
        );
    };

    let options = SubmitOptions {
        image_size_mib: query.image_size_mib,
    };

    match orchestrator.submit(&data, &name, options).await {
        Ok(job) => HttpResponse::Ok().json(UploadResponse {
            job_id: job.id,
            hash: job.content_hash,
            status: "disk_created",
        }),
        Err(e) => {
            log::error!("upload failed: {e}");
            error_response("", &e)
        }
    }
}
