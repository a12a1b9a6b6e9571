// src/repo/mod.rs
pub mod driver_repo;
pub mod ride_repo;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::models::coordinate::{Coordinate, Location, LocationUpdate};
use crate::models::driver::{CandidateDriver, Driver, SessionSummary};
use crate::models::ride::{Ride, RideStatus, VehicleType};

pub use driver_repo::PostgresDriverRepository;
pub use ride_repo::PostgresRideRepository;

/// Upper bounds on store calls. Writes cover multi-statement transactions.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Run a transactional unit, retrying once more on a transient store error.
pub(crate) async fn with_retry<T, F, Fut>(op: F) -> DispatchResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DispatchResult<T>>,
{
    match op().await {
        Err(err) if err.is_transient() => {
            tracing::warn!("transient store error, retrying once: {}", err);
            tokio::time::sleep(TRANSIENT_RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}

/// Authoritative ride persistence. Every method that changes more than one
/// row runs as a single transaction; ride transitions take a row lock so a
/// ride cannot be transitioned concurrently.
#[async_trait]
pub trait RideRepository: Send + Sync {
    /// Persist a new ride with its coordinates. When the ride carries an
    /// idempotency key the passenger already used, nothing is written and
    /// the existing row comes back, so the caller can tell a replay from a
    /// first insert by comparing ride ids.
    async fn create_ride(
        &self,
        ride: &Ride,
        pickup: &Coordinate,
        destination: &Coordinate,
    ) -> DispatchResult<Ride>;

    async fn get_ride(&self, ride_id: Uuid) -> DispatchResult<Option<Ride>>;

    /// Cancel from any still-cancellable status. An assigned driver is
    /// released back to AVAILABLE and detached from the ride in the same
    /// transaction; the released driver id is returned alongside the ride.
    async fn cancel_ride(&self, ride_id: Uuid, reason: &str)
        -> DispatchResult<(Ride, Option<Uuid>)>;

    /// Cancel only while still REQUESTED; Ok(None) if the ride moved on.
    async fn cancel_if_requested(&self, ride_id: Uuid, reason: &str)
        -> DispatchResult<Option<Ride>>;

    /// The match commit point: ride REQUESTED, driver AVAILABLE with no
    /// other active ride, both flipped atomically. Violations surface as
    /// MatchRejected so the matcher can fall through to the next acceptance.
    async fn assign_driver(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride>;

    /// One forward lifecycle step, verified against the acting driver.
    async fn transition_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        to: RideStatus,
    ) -> DispatchResult<Ride>;

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        final_location: Location,
    ) -> DispatchResult<Ride>;
}

/// Driver registry persistence: status, sessions, coordinates.
#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn get_driver(&self, driver_id: Uuid) -> DispatchResult<Option<Driver>>;

    /// Flip to AVAILABLE (unless banned), open a session, store the current
    /// coordinate. Returns the open session id.
    async fn go_online(&self, driver_id: Uuid, latitude: f64, longitude: f64)
        -> DispatchResult<Uuid>;

    /// Close the open session and flip to OFFLINE. Returns the closed
    /// session id and its summary; a zero summary when no session was open.
    async fn go_offline(&self, driver_id: Uuid)
        -> DispatchResult<(Option<Uuid>, SessionSummary)>;

    /// Supersede the current coordinate and append to the location log.
    /// Returns the new coordinate and the driver's active ride id, if any.
    async fn update_location(
        &self,
        driver_id: Uuid,
        update: &LocationUpdate,
    ) -> DispatchResult<(Coordinate, Option<Uuid>)>;

    /// All AVAILABLE drivers of the requested class with a current
    /// coordinate. Distance filtering and ranking happen in the matcher.
    async fn find_available(&self, vehicle_type: VehicleType)
        -> DispatchResult<Vec<CandidateDriver>>;
}

#[cfg(test)]
pub mod memory {
    //! In-memory store backing both repository traits for service tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::errors::DispatchError;
    use crate::models::coordinate::{EntityType, LocationLogEntry};
    use crate::models::driver::{DriverSession, DriverStatus};

    #[derive(Default)]
    pub struct InMemoryStore {
        pub rides: Mutex<HashMap<Uuid, Ride>>,
        pub coordinates: Mutex<HashMap<Uuid, Coordinate>>,
        pub drivers: Mutex<HashMap<Uuid, Driver>>,
        pub sessions: Mutex<HashMap<Uuid, DriverSession>>,
        pub location_log: Mutex<Vec<LocationLogEntry>>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_driver(&self, driver: Driver) {
            self.drivers.lock().unwrap().insert(driver.id, driver);
        }

        pub fn driver_status(&self, driver_id: Uuid) -> Option<DriverStatus> {
            self.drivers.lock().unwrap().get(&driver_id).map(|d| d.status)
        }

        fn active_ride_for(&self, driver_id: Uuid) -> Option<Uuid> {
            self.rides
                .lock()
                .unwrap()
                .values()
                .find(|r| r.driver_id == Some(driver_id) && r.status.is_active_for_driver())
                .map(|r| r.id)
        }

        fn open_session_for(&self, driver_id: Uuid) -> Option<Uuid> {
            self.sessions
                .lock()
                .unwrap()
                .values()
                .find(|s| s.driver_id == driver_id && s.ended_at.is_none())
                .map(|s| s.id)
        }
    }

    #[async_trait]
    impl RideRepository for InMemoryStore {
        async fn create_ride(
            &self,
            ride: &Ride,
            pickup: &Coordinate,
            destination: &Coordinate,
        ) -> DispatchResult<Ride> {
            if let Some(key) = &ride.idempotency_key {
                let rides = self.rides.lock().unwrap();
                if let Some(existing) = rides.values().find(|r| {
                    r.passenger_id == ride.passenger_id
                        && r.idempotency_key.as_deref() == Some(key.as_str())
                }) {
                    return Ok(existing.clone());
                }
            }
            let mut coords = self.coordinates.lock().unwrap();
            for coordinate in coords.values_mut() {
                if coordinate.entity_id == ride.passenger_id
                    && coordinate.entity_type == EntityType::Passenger
                {
                    coordinate.is_current = false;
                }
            }
            coords.insert(pickup.id, pickup.clone());
            coords.insert(destination.id, destination.clone());
            drop(coords);
            self.rides.lock().unwrap().insert(ride.id, ride.clone());
            Ok(ride.clone())
        }

        async fn get_ride(&self, ride_id: Uuid) -> DispatchResult<Option<Ride>> {
            Ok(self.rides.lock().unwrap().get(&ride_id).cloned())
        }

        async fn cancel_ride(
            &self,
            ride_id: Uuid,
            reason: &str,
        ) -> DispatchResult<(Ride, Option<Uuid>)> {
            let released_driver;
            let updated = {
                let mut rides = self.rides.lock().unwrap();
                let ride = rides
                    .get_mut(&ride_id)
                    .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
                if !ride.status.is_cancellable() {
                    return Err(DispatchError::RideNotCancellable(
                        ride.status.as_str().to_string(),
                    ));
                }
                released_driver = ride.driver_id.take();
                ride.status = RideStatus::Cancelled;
                ride.cancelled_at = Some(Utc::now());
                ride.cancellation_reason = Some(reason.to_string());
                ride.updated_at = Utc::now();
                ride.clone()
            };
            if let Some(driver_id) = released_driver {
                if let Some(driver) = self.drivers.lock().unwrap().get_mut(&driver_id) {
                    driver.status = DriverStatus::Available;
                }
            }
            Ok((updated, released_driver))
        }

        async fn cancel_if_requested(
            &self,
            ride_id: Uuid,
            reason: &str,
        ) -> DispatchResult<Option<Ride>> {
            let status = self.rides.lock().unwrap().get(&ride_id).map(|r| r.status);
            match status {
                Some(RideStatus::Requested) => {
                    self.cancel_ride(ride_id, reason).await.map(|(ride, _)| Some(ride))
                }
                Some(_) => Ok(None),
                None => Err(DispatchError::RideNotFound(ride_id.to_string())),
            }
        }

        async fn assign_driver(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride> {
            match self.driver_status(driver_id) {
                Some(DriverStatus::Available) => {}
                Some(other) => {
                    return Err(DispatchError::MatchRejected(format!(
                        "driver {} is {}",
                        driver_id,
                        other.as_str()
                    )))
                }
                None => {
                    return Err(DispatchError::MatchRejected(format!(
                        "driver {} not found",
                        driver_id
                    )))
                }
            }
            if self.active_ride_for(driver_id).is_some() {
                return Err(DispatchError::MatchRejected(format!(
                    "driver {} already has an active ride",
                    driver_id
                )));
            }
            let updated = {
                let mut rides = self.rides.lock().unwrap();
                let ride = rides
                    .get_mut(&ride_id)
                    .ok_or_else(|| DispatchError::MatchRejected("ride not found".to_string()))?;
                if ride.status != RideStatus::Requested {
                    return Err(DispatchError::MatchRejected(format!(
                        "ride is {}",
                        ride.status.as_str()
                    )));
                }
                ride.status = RideStatus::Matched;
                ride.driver_id = Some(driver_id);
                ride.matched_at = Some(Utc::now());
                ride.updated_at = Utc::now();
                ride.clone()
            };
            self.drivers
                .lock()
                .unwrap()
                .get_mut(&driver_id)
                .map(|d| d.status = DriverStatus::Busy);
            Ok(updated)
        }

        async fn transition_ride(
            &self,
            ride_id: Uuid,
            driver_id: Uuid,
            to: RideStatus,
        ) -> DispatchResult<Ride> {
            let mut rides = self.rides.lock().unwrap();
            let ride = rides
                .get_mut(&ride_id)
                .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
            if ride.driver_id != Some(driver_id) {
                return Err(DispatchError::forbidden("ride is assigned to another driver"));
            }
            if !ride.status.can_transition_to(to) {
                return Err(DispatchError::invalid_transition(ride.status.as_str(), to.as_str()));
            }
            ride.status = to;
            if to == RideStatus::InProgress {
                ride.started_at = Some(Utc::now());
            }
            ride.updated_at = Utc::now();
            Ok(ride.clone())
        }

        async fn complete_ride(
            &self,
            ride_id: Uuid,
            driver_id: Uuid,
            final_fare: f64,
            driver_earnings: f64,
            _final_location: Location,
        ) -> DispatchResult<Ride> {
            let updated = {
                let mut rides = self.rides.lock().unwrap();
                let ride = rides
                    .get_mut(&ride_id)
                    .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
                if ride.driver_id != Some(driver_id) {
                    return Err(DispatchError::forbidden("ride is assigned to another driver"));
                }
                if !ride.status.can_transition_to(RideStatus::Completed) {
                    return Err(DispatchError::invalid_transition(
                        ride.status.as_str(),
                        RideStatus::Completed.as_str(),
                    ));
                }
                ride.status = RideStatus::Completed;
                ride.completed_at = Some(Utc::now());
                ride.final_fare = Some(final_fare);
                ride.updated_at = Utc::now();
                ride.clone()
            };
            if let Some(driver) = self.drivers.lock().unwrap().get_mut(&driver_id) {
                driver.status = DriverStatus::Available;
                driver.total_rides += 1;
                driver.total_earnings += driver_earnings;
            }
            if let Some(session_id) = self.open_session_for(driver_id) {
                if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
                    session.total_rides += 1;
                    session.total_earnings += driver_earnings;
                }
            }
            Ok(updated)
        }
    }

    #[async_trait]
    impl DriverRepository for InMemoryStore {
        async fn get_driver(&self, driver_id: Uuid) -> DispatchResult<Option<Driver>> {
            Ok(self.drivers.lock().unwrap().get(&driver_id).cloned())
        }

        async fn go_online(
            &self,
            driver_id: Uuid,
            latitude: f64,
            longitude: f64,
        ) -> DispatchResult<Uuid> {
            {
                let mut drivers = self.drivers.lock().unwrap();
                let driver = drivers
                    .get_mut(&driver_id)
                    .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))?;
                if driver.status == DriverStatus::Banned {
                    return Err(DispatchError::DriverBanned(driver_id.to_string()));
                }
                driver.status = DriverStatus::Available;
            }
            {
                let mut coords = self.coordinates.lock().unwrap();
                for coordinate in coords.values_mut() {
                    if coordinate.entity_id == driver_id
                        && coordinate.entity_type == EntityType::Driver
                    {
                        coordinate.is_current = false;
                    }
                }
                let coordinate = Coordinate::current(
                    driver_id,
                    EntityType::Driver,
                    "Online location".to_string(),
                    latitude,
                    longitude,
                );
                coords.insert(coordinate.id, coordinate);
            }
            if let Some(existing) = self.open_session_for(driver_id) {
                return Ok(existing);
            }
            let session = DriverSession {
                id: Uuid::new_v4(),
                driver_id,
                started_at: Utc::now(),
                ended_at: None,
                total_rides: 0,
                total_earnings: 0.0,
            };
            let id = session.id;
            self.sessions.lock().unwrap().insert(id, session);
            Ok(id)
        }

        async fn go_offline(
            &self,
            driver_id: Uuid,
        ) -> DispatchResult<(Option<Uuid>, SessionSummary)> {
            {
                let mut drivers = self.drivers.lock().unwrap();
                let driver = drivers
                    .get_mut(&driver_id)
                    .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))?;
                driver.status = DriverStatus::Offline;
            }
            let open = self.open_session_for(driver_id);
            match open {
                Some(session_id) => {
                    let mut sessions = self.sessions.lock().unwrap();
                    let session = sessions.get_mut(&session_id).unwrap();
                    let now = Utc::now();
                    session.ended_at = Some(now);
                    let summary = SessionSummary {
                        duration_hours: (now - session.started_at).num_seconds() as f64 / 3600.0,
                        rides_completed: session.total_rides,
                        earnings: session.total_earnings,
                    };
                    Ok((Some(session_id), summary))
                }
                None => Ok((None, SessionSummary::zero())),
            }
        }

        async fn update_location(
            &self,
            driver_id: Uuid,
            update: &LocationUpdate,
        ) -> DispatchResult<(Coordinate, Option<Uuid>)> {
            if !self.drivers.lock().unwrap().contains_key(&driver_id) {
                return Err(DispatchError::DriverNotFound(driver_id.to_string()));
            }
            let active_ride = self.active_ride_for(driver_id);
            let mut coords = self.coordinates.lock().unwrap();
            for coordinate in coords.values_mut() {
                if coordinate.entity_id == driver_id && coordinate.entity_type == EntityType::Driver
                {
                    coordinate.is_current = false;
                }
            }
            let coordinate = Coordinate::current(
                driver_id,
                EntityType::Driver,
                update.address.clone().unwrap_or_default(),
                update.latitude,
                update.longitude,
            );
            coords.insert(coordinate.id, coordinate.clone());
            drop(coords);
            self.location_log.lock().unwrap().push(LocationLogEntry {
                coordinate_id: coordinate.id,
                driver_id,
                latitude: update.latitude,
                longitude: update.longitude,
                accuracy_meters: update.accuracy_meters,
                speed_kmh: update.speed_kmh,
                heading_degrees: update.heading_degrees,
                ride_id: active_ride,
                created_at: Utc::now(),
            });
            Ok((coordinate, active_ride))
        }

        async fn find_available(
            &self,
            vehicle_type: VehicleType,
        ) -> DispatchResult<Vec<CandidateDriver>> {
            let drivers = self.drivers.lock().unwrap();
            let coords = self.coordinates.lock().unwrap();
            let mut candidates = Vec::new();
            for driver in drivers.values() {
                if driver.status != DriverStatus::Available || driver.vehicle_type != vehicle_type
                {
                    continue;
                }
                let current = coords.values().find(|c| {
                    c.entity_id == driver.id
                        && c.entity_type == EntityType::Driver
                        && c.is_current
                });
                if let Some(coordinate) = current {
                    candidates.push(CandidateDriver {
                        driver_id: driver.id,
                        rating: driver.rating,
                        latitude: coordinate.latitude,
                        longitude: coordinate.longitude,
                    });
                }
            }
            Ok(candidates)
        }
    }

    /// A verified AVAILABLE driver with sensible defaults for tests.
    pub fn test_driver(vehicle_type: VehicleType, rating: f64) -> Driver {
        let now = Utc::now();
        Driver {
            id: Uuid::new_v4(),
            license_plate: "KZ 777 ABC".to_string(),
            vehicle_type,
            vehicle_make: "Toyota".to_string(),
            vehicle_model: "Camry".to_string(),
            vehicle_year: 2021,
            status: DriverStatus::Available,
            rating,
            total_rides: 0,
            total_earnings: 0.0,
            is_verified: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_retries_transient_once() {
        let calls = AtomicU32::new(0);
        let result: DispatchResult<u32> = with_retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(DispatchError::StoreTimeout)
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_second_failure() {
        let calls = AtomicU32::new(0);
        let result: DispatchResult<u32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::StoreTimeout)
        })
        .await;
        assert!(matches!(result, Err(DispatchError::StoreTimeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_caller_errors() {
        let calls = AtomicU32::new(0);
        let result: DispatchResult<u32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::conflict("duplicate"))
        })
        .await;
        assert!(matches!(result, Err(DispatchError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
