use std::collections::BTreeMap;

use anyhow::anyhow;
use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::maskflow_core::{
    AddObjectBoxRequest, AddObjectRequest, AnnotationEngine, CloseSessionResponse, EngineError,
    FrameMasksResponse, Job, JobStatus, Mask, MaskUpdateResponse, ObjectResponse,
    OpenSessionRequest, OpenSessionResponse, OverrideMaskRequest, PropagateRequest,
    PropagateResponse, RefineRequest, SessionInfoResponse,
};
use crate::server::error::ApiError;

// Engine calls block on per-session locks (a propagation can hold one for
// minutes), so every handler hops onto the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::from(EngineError::Internal(anyhow!("worker task failed: {e}"))))?;
    joined.map_err(ApiError::from)
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "service": "maskflow",
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

pub async fn open_session(
    State(engine): State<AnnotationEngine>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    let response = blocking(move || engine.open_session(&req)).await?;
    Ok(Json(response))
}

pub async fn get_session(
    State(engine): State<AnnotationEngine>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfoResponse>, ApiError> {
    let response = blocking(move || engine.session_info(&session_id)).await?;
    Ok(Json(response))
}

pub async fn close_session(
    State(engine): State<AnnotationEngine>,
    Path(session_id): Path<String>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    let response = blocking(move || {
        engine.close_session(&session_id);
        Ok(CloseSessionResponse { session_id })
    })
    .await?;
    Ok(Json(response))
}

pub async fn add_object(
    State(engine): State<AnnotationEngine>,
    Path(session_id): Path<String>,
    Json(req): Json<AddObjectRequest>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let response = blocking(move || engine.add_object(&session_id, &req)).await?;
    Ok(Json(response))
}

pub async fn add_object_with_box(
    State(engine): State<AnnotationEngine>,
    Path(session_id): Path<String>,
    Json(req): Json<AddObjectBoxRequest>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let response = blocking(move || engine.add_object_with_box(&session_id, &req)).await?;
    Ok(Json(response))
}

fn mask_update_response(
    (object_id, frame_idx, mask): (u32, usize, Mask),
) -> Result<MaskUpdateResponse, EngineError> {
    Ok(MaskUpdateResponse {
        object_id,
        frame_idx,
        mask: mask
            .to_png_base64()
            .map_err(|e| EngineError::Internal(anyhow::Error::new(e)))?,
    })
}

pub async fn refine_object(
    State(engine): State<AnnotationEngine>,
    Path((session_id, object_id)): Path<(String, u32)>,
    Json(req): Json<RefineRequest>,
) -> Result<Json<MaskUpdateResponse>, ApiError> {
    let response = blocking(move || {
        let update = engine.refine(&session_id, object_id, &req)?;
        mask_update_response(update)
    })
    .await?;
    Ok(Json(response))
}

pub async fn override_mask(
    State(engine): State<AnnotationEngine>,
    Path((session_id, object_id)): Path<(String, u32)>,
    Json(req): Json<OverrideMaskRequest>,
) -> Result<Json<MaskUpdateResponse>, ApiError> {
    let response = blocking(move || {
        let update = engine.override_mask(&session_id, object_id, &req)?;
        mask_update_response(update)
    })
    .await?;
    Ok(Json(response))
}

pub async fn get_frame_masks(
    State(engine): State<AnnotationEngine>,
    Path((session_id, frame_idx)): Path<(String, usize)>,
) -> Result<Json<FrameMasksResponse>, ApiError> {
    let response = blocking(move || {
        let masks = engine.get_frame_masks(&session_id, frame_idx)?;
        let mut encoded = BTreeMap::new();
        for (object_id, mask) in masks {
            encoded.insert(
                object_id,
                mask.to_png_base64()
                    .map_err(|e| EngineError::Internal(anyhow::Error::new(e)))?,
            );
        }
        Ok(FrameMasksResponse {
            frame_idx,
            masks: encoded,
        })
    })
    .await?;
    Ok(Json(response))
}

pub async fn start_propagation(
    State(engine): State<AnnotationEngine>,
    Path(session_id): Path<String>,
    Json(req): Json<PropagateRequest>,
) -> Result<Json<PropagateResponse>, ApiError> {
    let response = blocking(move || {
        let job_id = engine.start_propagation(&session_id, &req)?;
        Ok(PropagateResponse { job_id })
    })
    .await?;
    Ok(Json(response))
}

pub async fn get_job(
    State(engine): State<AnnotationEngine>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = blocking(move || engine.job(&job_id)).await?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

pub async fn cancel_job(
    State(engine): State<AnnotationEngine>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let job = blocking(move || engine.cancel_job(&job_id)).await?;
    Ok(Json(CancelJobResponse {
        job_id: job.job_id,
        status: job.status,
    }))
}
