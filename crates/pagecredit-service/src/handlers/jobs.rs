//! Batch job handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use pagecredit_core::{BatchJob, FileState, JobId, JobState, Operation, Progress};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::jobs::SubmitRequest;
use crate::state::AppState;

/// Header accepted in place of `request_id`.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Job submission body.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Operation name, e.g. `"compress"`.
    pub operation: String,
    /// Input document references.
    pub files: Vec<String>,
    /// Operation options.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Client request id making retries idempotent.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Submission acknowledgement.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    /// Job id.
    pub job_id: JobId,
    /// Credits held for the job.
    pub reserved_credits: i64,
    /// Current state.
    pub state: JobState,
}

/// Per-file status.
#[derive(Debug, Serialize)]
pub struct FileResponse {
    /// Position in the submission.
    pub index: u32,
    /// Input reference.
    pub input_ref: String,
    /// Output reference, once completed.
    pub output_ref: Option<String>,
    /// File state.
    pub state: FileState,
    /// Attempts made.
    pub attempts: u32,
    /// Last error.
    pub error: Option<String>,
}

/// Full job status.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    /// Job id.
    pub job_id: JobId,
    /// Operation.
    pub operation: Operation,
    /// Job state.
    pub state: JobState,
    /// File counters.
    pub progress: Progress,
    /// Completed fraction, 0.0 to 1.0.
    pub percent_complete: f64,
    /// Credits held at submission.
    pub reserved_credits: i64,
    /// Credits consumed, once finished.
    pub actual_credits: Option<i64>,
    /// Credits returned, once finished.
    pub refunded_credits: Option<i64>,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
    /// Per-file detail.
    pub files: Vec<FileResponse>,
    /// Creation time.
    pub created_at: String,
    /// Last update time.
    pub updated_at: String,
}

impl From<BatchJob> for JobResponse {
    #[allow(clippy::cast_precision_loss)]
    fn from(job: BatchJob) -> Self {
        let progress = job.progress();
        let percent_complete = if progress.total == 0 {
            0.0
        } else {
            progress.completed as f64 / progress.total as f64
        };

        Self {
            job_id: job.id,
            operation: job.operation,
            state: job.state,
            progress,
            percent_complete,
            reserved_credits: job.reserved_credits,
            actual_credits: job.actual_credits,
            refunded_credits: job.refunded_credits,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            files: job
                .files
                .into_iter()
                .map(|task| FileResponse {
                    index: task.index,
                    input_ref: task.input_ref,
                    output_ref: task.output_ref,
                    state: task.state,
                    attempts: task.attempts,
                    error: task.error,
                })
                .collect(),
        }
    }
}

/// Submit a batch job.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let operation = request.operation.parse::<Operation>()?;
    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let job = state
        .jobs
        .submit(
            &auth.account_id,
            SubmitRequest {
                operation,
                files: request.files,
                options: request.options,
                request_key: header_key.or(request.request_id),
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job.id,
            reserved_credits: job.reserved_credits,
            state: job.state,
        }),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("job not found: {raw}")))
}

/// Get job status.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.jobs.get(&auth.account_id, &job_id).await?;
    Ok(Json(job.into()))
}

/// Cancel a job.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.jobs.cancel(&auth.account_id, &job_id).await?;
    Ok(Json(job.into()))
}
