// src/handlers/mod.rs
pub mod driver_handler;
pub mod ride_handler;
pub mod ws_handler;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::DispatchError;
use crate::services::event_bus::EventPublisher;
use crate::state::AppState;

/// The authenticated subject, as established by the auth collaborator in
/// front of this service. It forwards the validated identity in headers;
/// commands here never see credentials.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedActor {
    pub id: Uuid,
    pub role: ActorRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Passenger,
    Driver,
}

impl AuthenticatedActor {
    pub fn require_role(&self, role: ActorRole) -> Result<(), DispatchError> {
        if self.role == role {
            Ok(())
        } else {
            Err(DispatchError::forbidden("wrong role for this operation"))
        }
    }
}

impl<S> FromRequestParts<S> for AuthenticatedActor
where
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-actor-id")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| DispatchError::forbidden("missing authenticated subject"))?;
        let id = Uuid::parse_str(id)?;

        let role = parts
            .headers
            .get("x-actor-role")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| DispatchError::forbidden("missing subject role"))?;
        let role = match role {
            "passenger" => ActorRole::Passenger,
            "driver" => ActorRole::Driver,
            other => {
                return Err(DispatchError::forbidden(format!("unknown role: {}", other)))
            }
        };

        Ok(AuthenticatedActor { id, role })
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "broker_alive": state.event_bus.is_alive(),
        "connected_drivers": state.session_hub.connected_count(),
    }))
}
