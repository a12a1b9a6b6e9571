// src/handlers/ws_handler.rs
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::handlers::{ActorRole, AuthenticatedActor};
use crate::models::coordinate::LocationUpdate;
use crate::models::messages::{
    WsEnvelope, MSG_LOCATION_UPDATE, MSG_PING, MSG_PONG, MSG_RIDE_OFFER_RESPONSE,
};
use crate::models::offer::RideOfferResponse;
use crate::services::driver_service::DriverActions;
use crate::state::AppState;

/// Ping cadence on every driver connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no inbound traffic for this long is dead.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Inbound control frames are small; anything bigger is hostile.
const MAX_INBOUND_BYTES: usize = 512;

pub async fn driver_ws(
    State(state): State<Arc<AppState>>,
    actor: AuthenticatedActor,
    ws: WebSocketUpgrade,
) -> DispatchResult<Response> {
    actor.require_role(ActorRole::Driver)?;
    let driver_id = actor.id;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, driver_id, socket)))
}

async fn handle_socket(state: Arc<AppState>, driver_id: Uuid, socket: WebSocket) {
    let (conn_id, mut outbound) = state.session_hub.register(driver_id);
    let (mut sink, mut stream) = socket.split();

    // The writer task is the only task that touches the sink. It drains the
    // session's outbound queue and keeps the ping cadence.
    let writer = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ping = tokio::time::interval_at(start, PING_INTERVAL);
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the hub dropped or superseded this session.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    let frame = WsEnvelope::new(MSG_PING, json!({}));
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader loop: any frame refreshes the read deadline.
    loop {
        let message = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                tracing::info!(%driver_id, "read deadline expired, closing session");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(%driver_id, "websocket read error: {}", err);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_INBOUND_BYTES {
                    tracing::warn!(%driver_id, bytes = text.len(), "oversized frame, closing");
                    break;
                }
                if let Err(err) = handle_frame(&state, driver_id, text.as_str()).await {
                    tracing::warn!(%driver_id, "inbound frame failed: {}", err);
                }
            }
            Message::Pong(_) => {}
            Message::Ping(_) => {} // answered automatically by the transport
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::warn!(%driver_id, "binary frame ignored");
            }
        }
    }

    state.session_hub.unregister(driver_id, conn_id);
    writer.abort();
}

/// Route one framed JSON message by its type.
async fn handle_frame(state: &Arc<AppState>, driver_id: Uuid, text: &str) -> DispatchResult<()> {
    let envelope: WsEnvelope = serde_json::from_str(text)?;
    match envelope.message_type.as_str() {
        MSG_LOCATION_UPDATE => {
            let update: LocationUpdate = serde_json::from_value(envelope.payload)?;
            state.driver_service.update_location(driver_id, update).await?;
            Ok(())
        }
        MSG_RIDE_OFFER_RESPONSE => {
            let response: RideOfferResponse = serde_json::from_value(envelope.payload)?;
            state.matcher.handle_offer_response(driver_id, response);
            Ok(())
        }
        MSG_PONG => Ok(()),
        other => {
            tracing::debug!(%driver_id, "unknown message type: {}", other);
            Ok(())
        }
    }
}
