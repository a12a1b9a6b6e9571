// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ride::VehicleType;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Offline,   // Not working
    Available, // Online, reachable for offers
    Busy,      // Servicing an active ride
    Banned,    // Blocked from going online
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Offline => "OFFLINE",
            DriverStatus::Available => "AVAILABLE",
            DriverStatus::Busy => "BUSY",
            DriverStatus::Banned => "BANNED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(DriverStatus::Offline),
            "AVAILABLE" => Some(DriverStatus::Available),
            "BUSY" => Some(DriverStatus::Busy),
            "BANNED" => Some(DriverStatus::Banned),
            _ => None,
        }
    }
}

/// A driver shares its id with the corresponding user row.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Driver {
    pub id: Uuid,
    pub license_plate: String,
    pub vehicle_type: VehicleType,
    pub vehicle_make: String,
    pub vehicle_model: String,
    pub vehicle_year: i32,
    pub status: DriverStatus,
    pub rating: f64,
    pub total_rides: i64,
    pub total_earnings: f64,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One work interval framed by go-online / go-offline.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriverSession {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_rides: i64,
    pub total_earnings: f64,
}

/// A matching candidate as returned by the registry query, annotated with
/// the driver's current position.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CandidateDriver {
    pub driver_id: Uuid,
    pub rating: f64,
    pub latitude: f64,
    pub longitude: f64,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize)]
pub struct GoOnlineRequest {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineResponse {
    pub status: DriverStatus,
    pub session_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionSummary {
    pub duration_hours: f64,
    pub rides_completed: i64,
    pub earnings: f64,
}

impl SessionSummary {
    pub fn zero() -> Self {
        Self { duration_hours: 0.0, rides_completed: 0, earnings: 0.0 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OfflineResponse {
    pub status: DriverStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub session_summary: SessionSummary,
    pub message: String,
}

// Event payloads
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriverStatusMessage {
    pub driver_id: Uuid,
    pub status: DriverStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}
