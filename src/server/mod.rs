use axum::Router;
use axum::routing::{get, post, put};

use crate::maskflow_core::AnnotationEngine;

mod error;
mod handlers;

pub use error::ApiError;

/// Build the orchestrator's HTTP surface over an engine.
pub fn router(engine: AnnotationEngine) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/sessions", post(handlers::open_session))
        .route(
            "/api/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route(
            "/api/sessions/{session_id}/objects",
            post(handlers::add_object),
        )
        .route(
            "/api/sessions/{session_id}/objects/box",
            post(handlers::add_object_with_box),
        )
        .route(
            "/api/sessions/{session_id}/objects/{object_id}/refine",
            post(handlers::refine_object),
        )
        .route(
            "/api/sessions/{session_id}/objects/{object_id}/mask",
            put(handlers::override_mask),
        )
        .route(
            "/api/sessions/{session_id}/frames/{frame_idx}/masks",
            get(handlers::get_frame_masks),
        )
        .route(
            "/api/sessions/{session_id}/propagate",
            post(handlers::start_propagation),
        )
        .route("/api/jobs/{job_id}", get(handlers::get_job))
        .route("/api/jobs/{job_id}/cancel", post(handlers::cancel_job))
        .with_state(engine)
}
