// src/models/coordinate.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Driver,
    Passenger,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Driver => "driver",
            EntityType::Passenger => "passenger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "driver" => Some(EntityType::Driver),
            "passenger" => Some(EntityType::Passenger),
            _ => None,
        }
    }
}

/// A bare WGS84 point as carried on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocationWithAddress {
    #[serde(flatten)]
    pub location: Location,
    pub address: String,
}

/// A stored coordinate row. At most one row per (entity_id, entity_type)
/// carries is_current = true; location updates supersede the previous one.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Coordinate {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub fare_amount: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<i64>,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coordinate {
    /// A fresh current coordinate for an entity, with generated id.
    pub fn current(entity_id: Uuid, entity_type: EntityType, address: String, latitude: f64, longitude: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id,
            entity_type,
            address,
            latitude,
            longitude,
            fare_amount: None,
            distance_km: None,
            duration_minutes: None,
            is_current: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_degrees: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationUpdateResponse {
    pub coordinate_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record, one per driver location update. `ride_id` is
/// set iff the driver had an active ride when the sample was taken.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocationLogEntry {
    pub coordinate_id: Uuid,
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub ride_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Broadcast payload emitted on the location fanout exchange.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocationMessage {
    pub driver_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<Uuid>,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_degrees: Option<f64>,
    pub timestamp: DateTime<Utc>,
}
