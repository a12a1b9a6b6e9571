// src/services/session_hub.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::json;
use tokio::sync::mpsc;
use tracing;
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::messages::{WsEnvelope, MSG_SESSION_SUPERSEDED};

/// Outbound frames buffered per session before the connection is deemed
/// unhealthy and dropped.
pub const OUTBOUND_BUFFER: usize = 256;

struct Session {
    conn_id: u64,
    tx: mpsc::Sender<String>,
}

/// The in-process registry of live driver connections.
///
/// The hub holds the only sender half of each session's outbound queue, so
/// unregistering a session closes the queue and lets the writer task unwind.
/// Registration says a driver is reachable; driver `status` remains the
/// authoritative readiness signal.
pub struct SessionHub {
    sessions: Mutex<HashMap<Uuid, Session>>,
    next_conn_id: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a driver connection, superseding any existing one. Returns
    /// the connection id and the receiver the writer task drains.
    pub fn register(&self, driver_id: Uuid) -> (u64, mpsc::Receiver<String>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);

        let old = self
            .sessions
            .lock()
            .unwrap()
            .insert(driver_id, Session { conn_id, tx });

        if let Some(old) = old {
            tracing::info!(%driver_id, "superseding existing session");
            let frame = WsEnvelope::new(MSG_SESSION_SUPERSEDED, json!({}));
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = old.tx.try_send(text);
            }
            // Dropping the old sender closes its queue and its connection.
        } else {
            tracing::info!(%driver_id, "driver session registered");
        }

        (conn_id, rx)
    }

    /// Remove a session, but only the one identified by `conn_id`; a stale
    /// reader unwinding after being superseded must not evict its successor.
    pub fn unregister(&self, driver_id: Uuid, conn_id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.get(&driver_id).map(|s| s.conn_id) == Some(conn_id) {
            sessions.remove(&driver_id);
            tracing::info!(%driver_id, "driver session unregistered");
        }
    }

    pub fn is_connected(&self, driver_id: Uuid) -> bool {
        self.sessions.lock().unwrap().contains_key(&driver_id)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Non-blocking enqueue of one frame. A full buffer means the consumer
    /// stopped draining; the session is dropped and the send reports
    /// SessionGone.
    pub fn send_to_driver(
        &self,
        driver_id: Uuid,
        message_type: &str,
        payload: serde_json::Value,
    ) -> DispatchResult<()> {
        let frame = WsEnvelope::new(message_type, payload);
        let text = serde_json::to_string(&frame)?;

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(&driver_id)
            .ok_or_else(|| DispatchError::SessionGone(driver_id.to_string()))?;

        match session.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%driver_id, "outbound buffer full, dropping session");
                sessions.remove(&driver_id);
                Err(DispatchError::SessionGone(driver_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                sessions.remove(&driver_id);
                Err(DispatchError::SessionGone(driver_id.to_string()))
            }
        }
    }

    /// Best-effort delivery to a set of drivers.
    pub fn broadcast(&self, driver_ids: &[Uuid], message_type: &str, payload: serde_json::Value) {
        for &driver_id in driver_ids {
            if let Err(err) = self.send_to_driver(driver_id, message_type, payload.clone()) {
                tracing::debug!(%driver_id, "broadcast skipped: {}", err);
            }
        }
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::MSG_RIDE_STATUS;

    fn recv_frame(rx: &mut mpsc::Receiver<String>) -> WsEnvelope {
        let text = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&text).expect("frame must be a valid envelope")
    }

    #[test]
    fn test_send_reaches_registered_driver() {
        let hub = SessionHub::new();
        let driver_id = Uuid::new_v4();
        let (_conn, mut rx) = hub.register(driver_id);

        hub.send_to_driver(driver_id, MSG_RIDE_STATUS, json!({"status": "MATCHED"})).unwrap();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.message_type, MSG_RIDE_STATUS);
        assert_eq!(frame.payload["status"], "MATCHED");
    }

    #[test]
    fn test_send_to_unknown_driver_is_session_gone() {
        let hub = SessionHub::new();
        let result = hub.send_to_driver(Uuid::new_v4(), MSG_RIDE_STATUS, json!({}));
        assert!(matches!(result, Err(DispatchError::SessionGone(_))));
    }

    #[test]
    fn test_register_supersedes_previous_session() {
        let hub = SessionHub::new();
        let driver_id = Uuid::new_v4();
        let (old_conn, mut old_rx) = hub.register(driver_id);
        let (new_conn, mut new_rx) = hub.register(driver_id);
        assert_ne!(old_conn, new_conn);

        let frame = recv_frame(&mut old_rx);
        assert_eq!(frame.message_type, MSG_SESSION_SUPERSEDED);
        // The old queue is closed once its superseded frame is drained.
        assert!(old_rx.try_recv().is_err());

        hub.send_to_driver(driver_id, MSG_RIDE_STATUS, json!({})).unwrap();
        assert_eq!(recv_frame(&mut new_rx).message_type, MSG_RIDE_STATUS);
    }

    #[test]
    fn test_stale_unregister_keeps_new_session() {
        let hub = SessionHub::new();
        let driver_id = Uuid::new_v4();
        let (old_conn, _old_rx) = hub.register(driver_id);
        let (_new_conn, _new_rx) = hub.register(driver_id);

        hub.unregister(driver_id, old_conn);
        assert!(hub.is_connected(driver_id));
    }

    #[test]
    fn test_full_buffer_drops_session() {
        let hub = SessionHub::new();
        let driver_id = Uuid::new_v4();
        let (_conn, _rx) = hub.register(driver_id);

        for _ in 0..OUTBOUND_BUFFER {
            hub.send_to_driver(driver_id, MSG_RIDE_STATUS, json!({})).unwrap();
        }
        let overflow = hub.send_to_driver(driver_id, MSG_RIDE_STATUS, json!({}));
        assert!(matches!(overflow, Err(DispatchError::SessionGone(_))));
        assert!(!hub.is_connected(driver_id));
    }
}
