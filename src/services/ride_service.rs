// src/services/ride_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::coordinate::{Coordinate, EntityType, Location};
use crate::models::driver::{DriverStatus, DriverStatusMessage};
use crate::models::messages::MSG_RIDE_STATUS;
use crate::models::ride::{
    CancelRideResponse, CompleteRideRequest, CompleteRideResponse, CreateRideRequest, Ride,
    RideRequestMessage, RideResponse, RideStatus, RideStatusMessage, TransitionResponse,
    VehicleType,
};
use crate::repo::RideRepository;
use crate::services::event_bus::{EventPublisher, EXCHANGE_DRIVER_TOPIC, EXCHANGE_RIDE_TOPIC};
use crate::services::session_hub::SessionHub;
use crate::utils::geo;
use crate::utils::id_generator::RideNumberGenerator;

/// Share of the final fare credited to the driver.
const DRIVER_EARNINGS_SHARE: f64 = 0.75;
/// Safety clamp: a final fare never exceeds this multiple of the estimate.
const FARE_CLAMP_FACTOR: f64 = 3.0;
/// Conservative urban average used for duration estimates.
const AVERAGE_SPEED_KMH: f64 = 30.0;

const DEFAULT_OFFER_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAX_DISTANCE_KM: f64 = 5.0;

/// fare = base + rate_per_km * distance + rate_per_min * duration, with
/// per-class constants. Unknown classes fall back to ECONOMY rates.
pub fn calculate_fare(vehicle_type: &str, distance_km: f64, duration_min: i64) -> f64 {
    let (base, per_km, per_min) = VehicleType::parse(vehicle_type)
        .unwrap_or(VehicleType::Economy)
        .fare_rates();
    base + distance_km * per_km + duration_min as f64 * per_min
}

fn estimate_duration_minutes(distance_km: f64) -> i64 {
    ((distance_km / AVERAGE_SPEED_KMH) * 60.0).ceil() as i64
}

#[async_trait]
pub trait RideOperations: Send + Sync {
    async fn create_ride(
        &self,
        passenger_id: Uuid,
        request: CreateRideRequest,
    ) -> DispatchResult<RideResponse>;

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Uuid,
        reason: Option<String>,
    ) -> DispatchResult<CancelRideResponse>;

    /// Commit a winning acceptance. MatchRejected tells the matcher to try
    /// the next pending acceptance instead.
    async fn on_driver_accepted(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride>;

    async fn start_ride(&self, ride_id: Uuid, driver_id: Uuid)
        -> DispatchResult<TransitionResponse>;
    async fn arrive_at_pickup(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<TransitionResponse>;
    async fn begin_trip(&self, ride_id: Uuid, driver_id: Uuid)
        -> DispatchResult<TransitionResponse>;

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        request: CompleteRideRequest,
    ) -> DispatchResult<CompleteRideResponse>;

    /// Invoked when the matcher exhausts its retries without a match.
    async fn auto_cancel_no_drivers(&self, ride_id: Uuid) -> DispatchResult<()>;
}

pub struct RideService {
    ride_repo: Arc<dyn RideRepository>,
    publisher: Arc<dyn EventPublisher>,
    hub: Arc<SessionHub>,
    ride_numbers: RideNumberGenerator,
}

impl RideService {
    pub fn new(
        ride_repo: Arc<dyn RideRepository>,
        publisher: Arc<dyn EventPublisher>,
        hub: Arc<SessionHub>,
    ) -> Self {
        Self {
            ride_repo,
            publisher,
            hub,
            ride_numbers: RideNumberGenerator::new(),
        }
    }

    fn validate_create(request: &CreateRideRequest) -> DispatchResult<VehicleType> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("pickup_latitude", request.pickup_latitude),
            ("destination_latitude", request.destination_latitude),
        ] {
            if !(-90.0..=90.0).contains(&value) {
                errors.push(crate::errors::ValidationError {
                    field: field.to_string(),
                    message: "must be within [-90, 90]".to_string(),
                });
            }
        }
        for (field, value) in [
            ("pickup_longitude", request.pickup_longitude),
            ("destination_longitude", request.destination_longitude),
        ] {
            if !(-180.0..=180.0).contains(&value) {
                errors.push(crate::errors::ValidationError {
                    field: field.to_string(),
                    message: "must be within [-180, 180]".to_string(),
                });
            }
        }
        if request.pickup_address.trim().is_empty() {
            errors.push(crate::errors::ValidationError {
                field: "pickup_address".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if request.destination_address.trim().is_empty() {
            errors.push(crate::errors::ValidationError {
                field: "destination_address".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        let vehicle_type = match VehicleType::parse(&request.vehicle_type) {
            Some(v) => Some(v),
            None => {
                errors.push(crate::errors::ValidationError {
                    field: "vehicle_type".to_string(),
                    message: format!("unknown vehicle type: {}", request.vehicle_type),
                });
                None
            }
        };
        if !errors.is_empty() {
            return Err(DispatchError::ValidationFailed(errors));
        }
        Ok(vehicle_type.expect("validated above"))
    }

    async fn publish_ride_status(&self, ride: &Ride, reason: Option<String>) {
        let message = RideStatusMessage {
            ride_id: ride.id,
            status: ride.status,
            driver_id: ride.driver_id,
            reason,
            timestamp: Utc::now(),
        };
        let routing_key = format!("ride.status.{}", ride.status.as_str().to_lowercase());
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_RIDE_TOPIC, &routing_key, serde_json::json!(message))
            .await
        {
            tracing::warn!(ride_id = %ride.id, "ride status publish failed: {}", err);
        }
    }

    async fn publish_driver_status(&self, driver_id: Uuid, status: DriverStatus, ride_id: Option<Uuid>) {
        let message = DriverStatusMessage {
            driver_id,
            status,
            ride_id,
            timestamp: Utc::now(),
        };
        let routing_key = format!("driver.status.{}", driver_id);
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_DRIVER_TOPIC, &routing_key, serde_json::json!(message))
            .await
        {
            tracing::warn!(%driver_id, "driver status publish failed: {}", err);
        }
    }

    /// Push the new ride status down the driver's live session, if any.
    fn notify_driver(&self, ride: &Ride, reason: Option<&str>) {
        if let Some(driver_id) = ride.driver_id {
            let payload = serde_json::json!({
                "ride_id": ride.id,
                "status": ride.status,
                "reason": reason,
            });
            if let Err(err) = self.hub.send_to_driver(driver_id, MSG_RIDE_STATUS, payload) {
                tracing::debug!(%driver_id, "ride status frame not delivered: {}", err);
            }
        }
    }

    async fn transition(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        to: RideStatus,
    ) -> DispatchResult<TransitionResponse> {
        let ride = self.ride_repo.transition_ride(ride_id, driver_id, to).await?;
        tracing::info!(%ride_id, %driver_id, status = ride.status.as_str(), "ride transitioned");

        self.publish_ride_status(&ride, None).await;
        self.notify_driver(&ride, None);

        Ok(TransitionResponse {
            ride_id: ride.id,
            status: ride.status,
            updated_at: ride.updated_at,
        })
    }
}

#[async_trait]
impl RideOperations for RideService {
    async fn create_ride(
        &self,
        passenger_id: Uuid,
        request: CreateRideRequest,
    ) -> DispatchResult<RideResponse> {
        let vehicle_type = Self::validate_create(&request)?;

        let distance_km = geo::haversine_km(
            request.pickup_latitude,
            request.pickup_longitude,
            request.destination_latitude,
            request.destination_longitude,
        );
        let duration_min = estimate_duration_minutes(distance_km);
        let estimated_fare = calculate_fare(vehicle_type.as_str(), distance_km, duration_min);

        let pickup = Coordinate::current(
            passenger_id,
            EntityType::Passenger,
            request.pickup_address.clone(),
            request.pickup_latitude,
            request.pickup_longitude,
        );
        let mut destination = Coordinate::current(
            passenger_id,
            EntityType::Passenger,
            request.destination_address.clone(),
            request.destination_latitude,
            request.destination_longitude,
        );
        destination.is_current = false;
        destination.fare_amount = Some(estimated_fare);
        destination.distance_km = Some(distance_km);
        destination.duration_minutes = Some(duration_min);

        let now = Utc::now();
        let ride = Ride {
            id: Uuid::new_v4(),
            ride_number: self.ride_numbers.next(),
            passenger_id,
            driver_id: None,
            vehicle_type,
            status: RideStatus::Requested,
            requested_at: now,
            matched_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            estimated_fare,
            final_fare: None,
            idempotency_key: request
                .idempotency_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            pickup_coordinate_id: pickup.id,
            destination_coordinate_id: destination.id,
            created_at: now,
            updated_at: now,
        };

        let persisted = self.ride_repo.create_ride(&ride, &pickup, &destination).await?;
        if persisted.id != ride.id {
            // Same idempotency key as an earlier request: the original ride
            // row stands and its request event was already published.
            tracing::info!(
                ride_id = %persisted.id,
                number = %persisted.ride_number,
                "ride request replayed, returning existing ride"
            );
            return Ok(RideResponse {
                ride_id: persisted.id,
                ride_number: persisted.ride_number,
                status: persisted.status,
                estimated_fare: persisted.estimated_fare,
                estimated_distance_km: distance_km,
                estimated_duration_minutes: duration_min,
            });
        }
        tracing::info!(ride_id = %ride.id, number = %ride.ride_number, "ride created");

        let message = RideRequestMessage {
            ride_id: ride.id,
            ride_number: ride.ride_number.clone(),
            passenger_id,
            vehicle_type,
            pickup_location: Location {
                latitude: request.pickup_latitude,
                longitude: request.pickup_longitude,
            },
            pickup_address: request.pickup_address,
            destination_location: Location {
                latitude: request.destination_latitude,
                longitude: request.destination_longitude,
            },
            destination_address: request.destination_address,
            estimated_fare,
            estimated_duration_minutes: duration_min,
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECONDS,
            timestamp: now,
        };
        let routing_key = format!("ride.request.{}", vehicle_type.as_str());
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_RIDE_TOPIC, &routing_key, serde_json::json!(message))
            .await
        {
            // The ride stays; the bus has the message queued for replay.
            tracing::warn!(ride_id = %ride.id, "ride request publish failed: {}", err);
        }

        Ok(RideResponse {
            ride_id: ride.id,
            ride_number: ride.ride_number,
            status: ride.status,
            estimated_fare,
            estimated_distance_km: distance_km,
            estimated_duration_minutes: duration_min,
        })
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Uuid,
        reason: Option<String>,
    ) -> DispatchResult<CancelRideResponse> {
        let ride = self
            .ride_repo
            .get_ride(ride_id)
            .await?
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        if ride.passenger_id != passenger_id {
            return Err(DispatchError::forbidden("ride belongs to another passenger"));
        }

        let reason = reason.unwrap_or_else(|| "cancelled by passenger".to_string());
        let (cancelled, released_driver) = self.ride_repo.cancel_ride(ride_id, &reason).await?;
        tracing::info!(%ride_id, "ride cancelled: {}", reason);

        let message = RideStatusMessage {
            ride_id: cancelled.id,
            status: cancelled.status,
            driver_id: released_driver,
            reason: Some(reason.clone()),
            timestamp: Utc::now(),
        };
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_RIDE_TOPIC, "ride.status.cancelled", serde_json::json!(message))
            .await
        {
            tracing::warn!(%ride_id, "cancel publish failed: {}", err);
        }

        if let Some(driver_id) = released_driver {
            let payload = serde_json::json!({
                "ride_id": cancelled.id,
                "status": cancelled.status,
                "reason": reason,
            });
            if let Err(err) = self.hub.send_to_driver(driver_id, MSG_RIDE_STATUS, payload) {
                tracing::debug!(%driver_id, "cancel frame not delivered: {}", err);
            }
            self.publish_driver_status(driver_id, DriverStatus::Available, None).await;
        }

        Ok(CancelRideResponse {
            ride_id: cancelled.id,
            status: cancelled.status,
            cancelled_at: cancelled.cancelled_at.unwrap_or_else(Utc::now),
        })
    }

    async fn on_driver_accepted(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride> {
        let ride = self.ride_repo.assign_driver(ride_id, driver_id).await?;
        tracing::info!(%ride_id, %driver_id, "ride matched");

        self.publish_ride_status(&ride, None).await;
        self.publish_driver_status(driver_id, DriverStatus::Busy, Some(ride_id)).await;
        self.notify_driver(&ride, None);

        Ok(ride)
    }

    async fn start_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<TransitionResponse> {
        self.transition(ride_id, driver_id, RideStatus::EnRoute).await
    }

    async fn arrive_at_pickup(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<TransitionResponse> {
        self.transition(ride_id, driver_id, RideStatus::Arrived).await
    }

    async fn begin_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> DispatchResult<TransitionResponse> {
        self.transition(ride_id, driver_id, RideStatus::InProgress).await
    }

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        request: CompleteRideRequest,
    ) -> DispatchResult<CompleteRideResponse> {
        if request.actual_distance_km < 0.0 || request.actual_duration_minutes < 0 {
            return Err(DispatchError::invalid_input("actuals must be non-negative"));
        }

        let ride = self
            .ride_repo
            .get_ride(ride_id)
            .await?
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;

        let mut final_fare = calculate_fare(
            ride.vehicle_type.as_str(),
            request.actual_distance_km,
            request.actual_duration_minutes,
        );
        let clamp = ride.estimated_fare * FARE_CLAMP_FACTOR;
        if final_fare > clamp {
            tracing::warn!(
                %ride_id,
                final_fare,
                clamp,
                "final fare exceeds clamp, capping"
            );
            final_fare = clamp;
        }
        let driver_earnings = final_fare * DRIVER_EARNINGS_SHARE;

        let completed = self
            .ride_repo
            .complete_ride(ride_id, driver_id, final_fare, driver_earnings, request.final_location)
            .await?;
        tracing::info!(%ride_id, %driver_id, final_fare, "ride completed");

        self.publish_ride_status(&completed, None).await;
        self.publish_driver_status(driver_id, DriverStatus::Available, None).await;
        self.notify_driver(&completed, None);

        Ok(CompleteRideResponse {
            ride_id: completed.id,
            status: completed.status,
            completed_at: completed.completed_at.unwrap_or_else(Utc::now),
            final_fare,
            driver_earnings,
        })
    }

    async fn auto_cancel_no_drivers(&self, ride_id: Uuid) -> DispatchResult<()> {
        match self.ride_repo.cancel_if_requested(ride_id, "no drivers").await? {
            Some(cancelled) => {
                tracing::info!(%ride_id, "ride auto-cancelled: no drivers");
                self.publish_ride_status(&cancelled, Some("no drivers".to_string())).await;
            }
            None => {
                tracing::debug!(%ride_id, "auto-cancel skipped, ride already progressed");
            }
        }
        Ok(())
    }
}
