// src/handlers/driver_handler.rs
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::handlers::{ActorRole, AuthenticatedActor};
use crate::models::coordinate::LocationUpdate;
use crate::models::driver::GoOnlineRequest;
use crate::models::ride::CompleteRideRequest;
use crate::services::driver_service::DriverActions;
use crate::services::ride_service::RideOperations;
use crate::state::AppState;

pub async fn go_online(
    State(state): State<Arc<AppState>>,
    actor: AuthenticatedActor,
    Json(request): Json<GoOnlineRequest>,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state
        .driver_service
        .go_online(actor.id, request.latitude, request.longitude)
        .await?;
    Ok(Json(response))
}

pub async fn go_offline(
    State(state): State<Arc<AppState>>,
    actor: AuthenticatedActor,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.driver_service.go_offline(actor.id).await?;
    Ok(Json(response))
}

pub async fn update_location(
    State(state): State<Arc<AppState>>,
    actor: AuthenticatedActor,
    Json(update): Json<LocationUpdate>,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.driver_service.update_location(actor.id, update).await?;
    Ok(Json(response))
}

pub async fn start_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    actor: AuthenticatedActor,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.ride_service.start_ride(ride_id, actor.id).await?;
    Ok(Json(response))
}

pub async fn arrive_at_pickup(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    actor: AuthenticatedActor,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.ride_service.arrive_at_pickup(ride_id, actor.id).await?;
    Ok(Json(response))
}

pub async fn begin_trip(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    actor: AuthenticatedActor,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.ride_service.begin_trip(ride_id, actor.id).await?;
    Ok(Json(response))
}

pub async fn complete_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    actor: AuthenticatedActor,
    Json(request): Json<CompleteRideRequest>,
) -> DispatchResult<impl IntoResponse> {
    actor.require_role(ActorRole::Driver)?;
    let response = state.ride_service.complete_ride(ride_id, actor.id, request).await?;
    Ok(Json(response))
}
