// src/handlers/ride_handler.rs
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::handlers::{ActorRole, AuthenticatedActor};
use crate::models::ride::{CancelRideRequest, CreateRideRequest};
use crate::services::ride_service::RideOperations;
use crate::state::AppState;

pub async fn create_ride(
    State(state): State<Arc<AppState>>,
    actor: AuthenticatedActor,
    Json(request): Json<CreateRideRequest>,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Passenger)?;
    let response = state.ride_service.create_ride(actor.id, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    actor: AuthenticatedActor,
    Json(request): Json<CancelRideRequest>,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Passenger)?;
    let response = state.ride_service.cancel_ride(ride_id, actor.id, request.reason).await?;
    Ok(Json(response))
}
