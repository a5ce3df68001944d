use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::database as db;
use crate::language::LanguageRegistry;
use crate::queue::SubmissionQueue;
use crate::submission::{NewSubmission, Status, SubmissionId};
use crate::worker::WakeSignal;

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmissionRequest {
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: String,
    pub source_code: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmissionResponse {
    pub id: SubmissionId,
    pub status: Status,
}

/// Stores a pending submission, queues it and nudges a triggered dispatcher
pub async fn post_submission_handler<Q: SubmissionQueue>(
    queue: web::Data<Q>,
    pool: web::Data<SqlitePool>,
    languages: web::Data<LanguageRegistry>,
    wake: web::Data<WakeSignal>,
    body: web::Json<SubmissionRequest>,
) -> HttpResponse {
    if !languages.contains(&body.language) {
        return HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Language {} is not supported.", body.language),
        });
    }

    match db::problem_exists(&pool, body.problem_id).await {
        Ok(true) => {}
        Ok(false) => {
            return HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message: format!("Problem {} not found.", body.problem_id),
            });
        }
        Err(e) => {
            log::error!("Failed to check problem existence: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    }

    let submission = NewSubmission {
        problem_id: body.problem_id,
        contest_id: body.contest_id,
        language: &body.language,
        source_code: &body.source_code,
    };
    let id = match queue.submit(&pool, &submission).await {
        Ok(id) => {
            log::info!("Submission {id} stored and queued");
            id
        }
        Err(e) if e.downcast_ref::<sqlx::Error>().is_some() => {
            log::error!("Failed to store submission: {e:#}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
        Err(e) => {
            log::error!("Failed to queue submission: {e:#}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            });
        }
    };

    // Counted even in continuous mode, where nobody consumes it
    wake.notify();

    HttpResponse::Ok().json(SubmissionResponse {
        id,
        status: Status::Pending,
    })
}

/// Status while the submission is in flight, the full verdict once done
pub async fn get_submission_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<(SubmissionId,)>,
) -> HttpResponse {
    let id = path.into_inner().0;

    match db::fetch_status_view(&pool, id).await {
        Ok(Some(view)) => {
            log::debug!("Submission {id} is {}", view.status());
            HttpResponse::Ok().json(view)
        }
        Ok(None) => HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: format!("Submission {id} not found."),
        }),
        Err(e) => {
            log::error!("Failed to retrieve submission {id} from database: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

/// External wake signal for the triggered-batch dispatcher
pub async fn wake_handler(wake: web::Data<WakeSignal>) -> HttpResponse {
    log::info!("Wake signal received");
    wake.notify();
    HttpResponse::Accepted().finish()
}
