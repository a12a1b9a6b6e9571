// src/repo/ride_repo.rs
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::coordinate::{Coordinate, Location};
use crate::models::ride::{Ride, RideStatus, VehicleType};
use crate::repo::{with_retry, RideRepository, READ_TIMEOUT, WRITE_TIMEOUT};

pub struct PostgresRideRepository {
    pool: PgPool,
}

impl PostgresRideRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RIDE_COLUMNS: &str = "id, ride_number, passenger_id, driver_id, vehicle_type, status, \
     requested_at, matched_at, started_at, completed_at, cancelled_at, cancellation_reason, \
     estimated_fare, final_fare, idempotency_key, pickup_coordinate_id, \
     destination_coordinate_id, created_at, updated_at";

fn ride_from_row(row: &PgRow) -> DispatchResult<Ride> {
    let status_raw: String = row.try_get("status")?;
    let status = RideStatus::parse(&status_raw)
        .ok_or_else(|| DispatchError::Store(format!("unknown ride status in store: {}", status_raw)))?;
    let vehicle_raw: String = row.try_get("vehicle_type")?;
    let vehicle_type = VehicleType::parse(&vehicle_raw).ok_or_else(|| {
        DispatchError::Store(format!("unknown vehicle type in store: {}", vehicle_raw))
    })?;

    Ok(Ride {
        id: row.try_get("id")?,
        ride_number: row.try_get("ride_number")?,
        passenger_id: row.try_get("passenger_id")?,
        driver_id: row.try_get("driver_id")?,
        vehicle_type,
        status,
        requested_at: row.try_get("requested_at")?,
        matched_at: row.try_get("matched_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        estimated_fare: row.try_get("estimated_fare")?,
        final_fare: row.try_get("final_fare")?,
        idempotency_key: row.try_get("idempotency_key")?,
        pickup_coordinate_id: row.try_get("pickup_coordinate_id")?,
        destination_coordinate_id: row.try_get("destination_coordinate_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_coordinate(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    coordinate: &Coordinate,
) -> DispatchResult<()> {
    sqlx::query(
        "INSERT INTO coordinates (id, entity_id, entity_type, address, latitude, longitude, \
         fare_amount, distance_km, duration_minutes, is_current) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(coordinate.id)
    .bind(coordinate.entity_id)
    .bind(coordinate.entity_type.as_str())
    .bind(&coordinate.address)
    .bind(coordinate.latitude)
    .bind(coordinate.longitude)
    .bind(coordinate.fare_amount)
    .bind(coordinate.distance_km)
    .bind(coordinate.duration_minutes)
    .bind(coordinate.is_current)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock the ride row for the remainder of the transaction.
async fn lock_ride(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ride_id: Uuid,
) -> DispatchResult<Option<Ride>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM rides WHERE id = $1 FOR UPDATE",
        RIDE_COLUMNS
    ))
    .bind(ride_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(ride_from_row).transpose()
}

impl PostgresRideRepository {
    async fn find_by_idempotency_key(
        &self,
        passenger_id: Uuid,
        key: &str,
    ) -> DispatchResult<Option<Ride>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rides WHERE passenger_id = $1 AND idempotency_key = $2",
            RIDE_COLUMNS
        ))
        .bind(passenger_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ride_from_row).transpose()
    }

    async fn create_ride_tx(
        &self,
        ride: &Ride,
        pickup: &Coordinate,
        destination: &Coordinate,
    ) -> DispatchResult<Ride> {
        if let Some(key) = ride.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency_key(ride.passenger_id, key).await? {
                return Ok(existing);
            }
        }

        let mut tx = self.pool.begin().await?;

        // The pickup becomes the passenger's current coordinate.
        sqlx::query(
            "UPDATE coordinates SET is_current = FALSE, updated_at = NOW() \
             WHERE entity_id = $1 AND entity_type = 'passenger' AND is_current",
        )
        .bind(ride.passenger_id)
        .execute(&mut *tx)
        .await?;

        insert_coordinate(&mut tx, pickup).await?;
        insert_coordinate(&mut tx, destination).await?;

        let inserted = sqlx::query(
            "INSERT INTO rides (id, ride_number, passenger_id, vehicle_type, status, \
             requested_at, estimated_fare, idempotency_key, pickup_coordinate_id, \
             destination_coordinate_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (passenger_id, idempotency_key) WHERE idempotency_key IS NOT NULL \
             DO NOTHING",
        )
        .bind(ride.id)
        .bind(&ride.ride_number)
        .bind(ride.passenger_id)
        .bind(ride.vehicle_type.as_str())
        .bind(ride.status.as_str())
        .bind(ride.requested_at)
        .bind(ride.estimated_fare)
        .bind(&ride.idempotency_key)
        .bind(ride.pickup_coordinate_id)
        .bind(ride.destination_coordinate_id)
        .execute(&mut *tx)
        .await?;

        // Lost a same-key race: drop the transaction and surface the winner.
        if inserted.rows_affected() == 0 {
            drop(tx);
            let key = ride.idempotency_key.as_deref().unwrap_or_default();
            return self
                .find_by_idempotency_key(ride.passenger_id, key)
                .await?
                .ok_or_else(|| DispatchError::Store("idempotent ride vanished".to_string()));
        }

        tx.commit().await?;
        Ok(ride.clone())
    }

    async fn cancel_ride_tx(
        &self,
        ride_id: Uuid,
        reason: &str,
    ) -> DispatchResult<(Ride, Option<Uuid>)> {
        let mut tx = self.pool.begin().await?;

        let ride = lock_ride(&mut tx, ride_id)
            .await?
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        if !ride.status.is_cancellable() {
            return Err(DispatchError::RideNotCancellable(ride.status.as_str().to_string()));
        }
        let released_driver = ride.driver_id;

        let row = sqlx::query(&format!(
            "UPDATE rides SET status = 'CANCELLED', driver_id = NULL, cancelled_at = NOW(), \
             cancellation_reason = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            RIDE_COLUMNS
        ))
        .bind(ride_id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;
        let cancelled = ride_from_row(&row)?;

        if let Some(driver_id) = released_driver {
            sqlx::query(
                "UPDATE drivers SET status = 'AVAILABLE', updated_at = NOW() WHERE id = $1",
            )
            .bind(driver_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((cancelled, released_driver))
    }

    async fn cancel_if_requested_tx(
        &self,
        ride_id: Uuid,
        reason: &str,
    ) -> DispatchResult<Option<Ride>> {
        let mut tx = self.pool.begin().await?;

        let ride = lock_ride(&mut tx, ride_id)
            .await?
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        if ride.status != RideStatus::Requested {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "UPDATE rides SET status = 'CANCELLED', cancelled_at = NOW(), \
             cancellation_reason = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            RIDE_COLUMNS
        ))
        .bind(ride_id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;
        let cancelled = ride_from_row(&row)?;

        tx.commit().await?;
        Ok(Some(cancelled))
    }

    async fn assign_driver_tx(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride> {
        let mut tx = self.pool.begin().await?;

        let ride = lock_ride(&mut tx, ride_id)
            .await?
            .ok_or_else(|| DispatchError::MatchRejected(format!("ride {} not found", ride_id)))?;
        if ride.status != RideStatus::Requested {
            return Err(DispatchError::MatchRejected(format!(
                "ride is {}",
                ride.status.as_str()
            )));
        }

        let driver_status: Option<String> =
            sqlx::query_scalar("SELECT status FROM drivers WHERE id = $1 FOR UPDATE")
                .bind(driver_id)
                .fetch_optional(&mut *tx)
                .await?;
        match driver_status.as_deref() {
            Some("AVAILABLE") => {}
            Some(other) => {
                return Err(DispatchError::MatchRejected(format!(
                    "driver {} is {}",
                    driver_id, other
                )))
            }
            None => {
                return Err(DispatchError::MatchRejected(format!(
                    "driver {} not found",
                    driver_id
                )))
            }
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rides WHERE driver_id = $1 \
             AND status IN ('MATCHED', 'EN_ROUTE', 'ARRIVED', 'IN_PROGRESS')",
        )
        .bind(driver_id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(DispatchError::MatchRejected(format!(
                "driver {} already has an active ride",
                driver_id
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE rides SET status = 'MATCHED', driver_id = $2, matched_at = NOW(), \
             updated_at = NOW() WHERE id = $1 RETURNING {}",
            RIDE_COLUMNS
        ))
        .bind(ride_id)
        .bind(driver_id)
        .fetch_one(&mut *tx)
        .await?;
        let matched = ride_from_row(&row)?;

        sqlx::query("UPDATE drivers SET status = 'BUSY', updated_at = NOW() WHERE id = $1")
            .bind(driver_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(matched)
    }

    async fn transition_ride_tx(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        to: RideStatus,
    ) -> DispatchResult<Ride> {
        let mut tx = self.pool.begin().await?;

        let ride = lock_ride(&mut tx, ride_id)
            .await?
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        if ride.driver_id != Some(driver_id) {
            return Err(DispatchError::forbidden("ride is assigned to another driver"));
        }
        if !ride.status.can_transition_to(to) {
            return Err(DispatchError::invalid_transition(ride.status.as_str(), to.as_str()));
        }

        let statement = if to == RideStatus::InProgress {
            format!(
                "UPDATE rides SET status = $2, started_at = NOW(), updated_at = NOW() \
                 WHERE id = $1 RETURNING {}",
                RIDE_COLUMNS
            )
        } else {
            format!(
                "UPDATE rides SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
                RIDE_COLUMNS
            )
        };
        let row = sqlx::query(&statement)
            .bind(ride_id)
            .bind(to.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let updated = ride_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn complete_ride_tx(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        final_location: Location,
    ) -> DispatchResult<Ride> {
        let mut tx = self.pool.begin().await?;

        let ride = lock_ride(&mut tx, ride_id)
            .await?
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

        let row = sqlx::query(&format!(
            "UPDATE rides SET status = 'COMPLETED', completed_at = NOW(), final_fare = $2, \
             updated_at = NOW() WHERE id = $1 RETURNING {}",
            RIDE_COLUMNS
        ))
        .bind(ride_id)
        .bind(final_fare)
        .fetch_one(&mut *tx)
        .await?;
        let completed = ride_from_row(&row)?;

        // The driver's closing position becomes the authoritative destination.
        sqlx::query(
            "UPDATE coordinates SET latitude = $2, longitude = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(completed.destination_coordinate_id)
        .bind(final_location.latitude)
        .bind(final_location.longitude)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE drivers SET status = 'AVAILABLE', total_rides = total_rides + 1, \
             total_earnings = total_earnings + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(driver_id)
        .bind(driver_earnings)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE driver_sessions SET total_rides = total_rides + 1, \
             total_earnings = total_earnings + $2 \
             WHERE driver_id = $1 AND ended_at IS NULL",
        )
        .bind(driver_id)
        .bind(driver_earnings)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(completed)
    }
}

#[async_trait]
impl RideRepository for PostgresRideRepository {
    async fn create_ride(
        &self,
        ride: &Ride,
        pickup: &Coordinate,
        destination: &Coordinate,
    ) -> DispatchResult<Ride> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.create_ride_tx(ride, pickup, destination)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn get_ride(&self, ride_id: Uuid) -> DispatchResult<Option<Ride>> {
        let query = format!("SELECT {} FROM rides WHERE id = $1", RIDE_COLUMNS);
        let row = tokio::time::timeout(
            READ_TIMEOUT,
            sqlx::query(&query).bind(ride_id).fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)??;
        row.as_ref().map(ride_from_row).transpose()
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        reason: &str,
    ) -> DispatchResult<(Ride, Option<Uuid>)> {
        tokio::time::timeout(WRITE_TIMEOUT, with_retry(|| self.cancel_ride_tx(ride_id, reason)))
            .await
            .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn cancel_if_requested(
        &self,
        ride_id: Uuid,
        reason: &str,
    ) -> DispatchResult<Option<Ride>> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.cancel_if_requested_tx(ride_id, reason)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn assign_driver(&self, ride_id: Uuid, driver_id: Uuid) -> DispatchResult<Ride> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.assign_driver_tx(ride_id, driver_id)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn transition_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        to: RideStatus,
    ) -> DispatchResult<Ride> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.transition_ride_tx(ride_id, driver_id, to)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn complete_ride(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        final_location: Location,
    ) -> DispatchResult<Ride> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| {
                self.complete_ride_tx(ride_id, driver_id, final_fare, driver_earnings, final_location)
            }),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }
}
