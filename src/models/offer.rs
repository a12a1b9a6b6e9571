// src/models/offer.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::coordinate::LocationWithAddress;

/// A time-bounded proposal of one ride to one driver. Offers live only in
/// the matcher's memory while the ride is still REQUESTED.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideOffer {
    pub offer_id: String,
    pub ride_id: Uuid,
    pub ride_number: String,
    pub pickup_location: LocationWithAddress,
    pub destination_location: LocationWithAddress,
    pub estimated_fare: f64,
    pub driver_earnings: f64,
    pub distance_to_pickup_km: f64,
    pub estimated_ride_duration_minutes: i64,
    pub expires_at: DateTime<Utc>,
}

impl RideOffer {
    /// Offer ids are deterministic per (ride, driver) so the pair acts as
    /// the offer's identity on both ends of the wire.
    pub fn offer_id_for(ride_id: Uuid, driver_id: Uuid) -> String {
        format!("offer_{}_{}", ride_id, driver_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfferDecision {
    Accept,
    Reject,
}

/// Inbound `ride_offer_response` frame payload.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideOfferResponse {
    pub offer_id: String,
    pub ride_id: Uuid,
    pub decision: OfferDecision,
}

/// Payload for `ride_offer_cancelled` / `ride_offer_lost` frames.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OfferClosedMessage {
    pub offer_id: String,
    pub ride_id: Uuid,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_offer_id_is_deterministic() {
        let ride = Uuid::new_v4();
        let driver = Uuid::new_v4();
        assert_eq!(RideOffer::offer_id_for(ride, driver), RideOffer::offer_id_for(ride, driver));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let offer = RideOffer {
            offer_id: "offer_x".to_string(),
            ride_id: Uuid::new_v4(),
            ride_number: "RIDE_20260101_000000_001".to_string(),
            pickup_location: LocationWithAddress {
                location: crate::models::coordinate::Location { latitude: 0.0, longitude: 0.0 },
                address: "A".to_string(),
            },
            destination_location: LocationWithAddress {
                location: crate::models::coordinate::Location { latitude: 1.0, longitude: 1.0 },
                address: "B".to_string(),
            },
            estimated_fare: 1000.0,
            driver_earnings: 750.0,
            distance_to_pickup_km: 0.5,
            estimated_ride_duration_minutes: 10,
            expires_at: now + Duration::seconds(30),
        };
        assert!(!offer.is_expired(now));
        assert!(offer.is_expired(now + Duration::seconds(31)));
    }
}
