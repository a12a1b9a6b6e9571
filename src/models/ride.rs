// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::coordinate::Location;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,  // Persisted, waiting for a driver match
    Matched,    // A driver accepted the offer
    EnRoute,    // Driver is on the way to pickup
    Arrived,    // Driver arrived at pickup location
    InProgress, // Passenger on board, trip running
    Completed,  // Trip finished, fare settled
    Cancelled,  // Cancelled by the passenger or the system
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::EnRoute => "EN_ROUTE",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(RideStatus::Requested),
            "MATCHED" => Some(RideStatus::Matched),
            "EN_ROUTE" => Some(RideStatus::EnRoute),
            "ARRIVED" => Some(RideStatus::Arrived),
            "IN_PROGRESS" => Some(RideStatus::InProgress),
            "COMPLETED" => Some(RideStatus::Completed),
            "CANCELLED" => Some(RideStatus::Cancelled),
            _ => None,
        }
    }

    /// The single allowed forward step from each non-terminal status, plus
    /// cancellation where the passenger may still back out.
    pub fn can_transition_to(&self, next: RideStatus) -> bool {
        matches!(
            (self, next),
            (RideStatus::Requested, RideStatus::Matched)
                | (RideStatus::Requested, RideStatus::Cancelled)
                | (RideStatus::Matched, RideStatus::EnRoute)
                | (RideStatus::Matched, RideStatus::Cancelled)
                | (RideStatus::EnRoute, RideStatus::Arrived)
                | (RideStatus::EnRoute, RideStatus::Cancelled)
                | (RideStatus::Arrived, RideStatus::InProgress)
                | (RideStatus::Arrived, RideStatus::Cancelled)
                | (RideStatus::InProgress, RideStatus::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        self.can_transition_to(RideStatus::Cancelled)
    }

    /// Statuses in which a ride holds a driver exclusively.
    pub fn is_active_for_driver(&self) -> bool {
        matches!(
            self,
            RideStatus::Matched | RideStatus::EnRoute | RideStatus::Arrived | RideStatus::InProgress
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    Economy,
    Premium,
    Xl,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Economy => "ECONOMY",
            VehicleType::Premium => "PREMIUM",
            VehicleType::Xl => "XL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ECONOMY" => Some(VehicleType::Economy),
            "PREMIUM" => Some(VehicleType::Premium),
            "XL" => Some(VehicleType::Xl),
            _ => None,
        }
    }

    /// (base fare, rate per km, rate per minute) in minor currency units.
    pub fn fare_rates(&self) -> (f64, f64, f64) {
        match self {
            VehicleType::Economy => (500.0, 100.0, 50.0),
            VehicleType::Premium => (800.0, 120.0, 60.0),
            VehicleType::Xl => (1000.0, 150.0, 75.0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ride {
    pub id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub vehicle_type: VehicleType,
    pub status: RideStatus,

    // Lifecycle timestamps
    pub requested_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,

    // Fare information
    pub estimated_fare: f64,
    pub final_fare: Option<f64>,

    // Client-supplied dedup key; a repeated request with the same key maps
    // back to this row instead of minting a new ride.
    pub idempotency_key: Option<String>,

    // Coordinate references
    pub pickup_coordinate_id: Uuid,
    pub destination_coordinate_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateRideRequest {
    pub pickup_address: String,
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub destination_address: String,
    pub destination_latitude: f64,
    pub destination_longitude: f64,
    /// Raw wire value; validated against the known classes on create.
    pub vehicle_type: String,
    /// Optional client dedup key. Two requests carrying the same key
    /// produce at most one ride row.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RideResponse {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub status: RideStatus,
    pub estimated_fare: f64,
    pub estimated_distance_km: f64,
    pub estimated_duration_minutes: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRideRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRideRequest {
    pub actual_distance_km: f64,
    pub actual_duration_minutes: i64,
    pub final_location: Location,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub completed_at: DateTime<Utc>,
    pub final_fare: f64,
    pub driver_earnings: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub updated_at: DateTime<Utc>,
}

// Event payloads
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRequestMessage {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub vehicle_type: VehicleType,
    pub pickup_location: Location,
    pub pickup_address: String,
    pub destination_location: Location,
    pub destination_address: String,
    pub estimated_fare: f64,
    pub estimated_duration_minutes: i64,
    pub max_distance_km: f64,
    pub timeout_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideStatusMessage {
    pub ride_id: Uuid,
    pub status: RideStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
