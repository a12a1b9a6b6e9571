// src/models/messages.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Server -> driver frame types
pub const MSG_RIDE_OFFER: &str = "ride_offer";
pub const MSG_RIDE_OFFER_CANCELLED: &str = "ride_offer_cancelled";
pub const MSG_RIDE_OFFER_LOST: &str = "ride_offer_lost";
pub const MSG_RIDE_STATUS: &str = "ride_status";
pub const MSG_SESSION_SUPERSEDED: &str = "session_superseded";
pub const MSG_PING: &str = "ping";

// Driver -> server frame types
pub const MSG_LOCATION_UPDATE: &str = "location_update";
pub const MSG_RIDE_OFFER_RESPONSE: &str = "ride_offer_response";
pub const MSG_PONG: &str = "pong";

/// One framed JSON message on a driver session. Every outbound frame carries
/// the server timestamp.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WsEnvelope {
    pub fn new(message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
