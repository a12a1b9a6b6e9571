// src/repo/driver_repo.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::coordinate::{Coordinate, EntityType, LocationUpdate};
use crate::models::driver::{CandidateDriver, Driver, DriverStatus, SessionSummary};
use crate::models::ride::VehicleType;
use crate::repo::{with_retry, DriverRepository, READ_TIMEOUT, WRITE_TIMEOUT};

pub struct PostgresDriverRepository {
    pool: PgPool,
}

impl PostgresDriverRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn driver_from_row(row: &PgRow) -> DispatchResult<Driver> {
    let status_raw: String = row.try_get("status")?;
    let status = DriverStatus::parse(&status_raw).ok_or_else(|| {
        DispatchError::Store(format!("unknown driver status in store: {}", status_raw))
    })?;
    let vehicle_raw: String = row.try_get("vehicle_type")?;
    let vehicle_type = VehicleType::parse(&vehicle_raw).ok_or_else(|| {
        DispatchError::Store(format!("unknown vehicle type in store: {}", vehicle_raw))
    })?;

    Ok(Driver {
        id: row.try_get("id")?,
        license_plate: row.try_get("license_plate")?,
        vehicle_type,
        vehicle_make: row.try_get("vehicle_make")?,
        vehicle_model: row.try_get("vehicle_model")?,
        vehicle_year: row.try_get("vehicle_year")?,
        status,
        rating: row.try_get("rating")?,
        total_rides: row.try_get("total_rides")?,
        total_earnings: row.try_get("total_earnings")?,
        is_verified: row.try_get("is_verified")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Flip any previous current coordinate off and insert the new one.
async fn supersede_coordinate(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    driver_id: Uuid,
    address: &str,
    latitude: f64,
    longitude: f64,
) -> DispatchResult<Coordinate> {
    sqlx::query(
        "UPDATE coordinates SET is_current = FALSE, updated_at = NOW() \
         WHERE entity_id = $1 AND entity_type = 'driver' AND is_current",
    )
    .bind(driver_id)
    .execute(&mut **tx)
    .await?;

    let coordinate_id = Uuid::new_v4();
    let row = sqlx::query(
        "INSERT INTO coordinates (id, entity_id, entity_type, address, latitude, longitude, is_current) \
         VALUES ($1, $2, 'driver', $3, $4, $5, TRUE) \
         RETURNING id, created_at, updated_at",
    )
    .bind(coordinate_id)
    .bind(driver_id)
    .bind(address)
    .bind(latitude)
    .bind(longitude)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Coordinate {
        id: row.try_get("id")?,
        entity_id: driver_id,
        entity_type: EntityType::Driver,
        address: address.to_string(),
        latitude,
        longitude,
        fare_amount: None,
        distance_km: None,
        duration_minutes: None,
        is_current: true,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PostgresDriverRepository {
    async fn go_online_tx(
        &self,
        driver_id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> DispatchResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM drivers WHERE id = $1 FOR UPDATE")
                .bind(driver_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => return Err(DispatchError::DriverNotFound(driver_id.to_string())),
            Some("BANNED") => return Err(DispatchError::DriverBanned(driver_id.to_string())),
            Some(_) => {}
        }

        sqlx::query("UPDATE drivers SET status = 'AVAILABLE', updated_at = NOW() WHERE id = $1")
            .bind(driver_id)
            .execute(&mut *tx)
            .await?;

        supersede_coordinate(&mut tx, driver_id, "Online location", latitude, longitude).await?;

        // Going online twice keeps the already-open session.
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM driver_sessions WHERE driver_id = $1 AND ended_at IS NULL",
        )
        .bind(driver_id)
        .fetch_optional(&mut *tx)
        .await?;
        let session_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO driver_sessions (id, driver_id, started_at) VALUES ($1, $2, NOW())",
                )
                .bind(id)
                .bind(driver_id)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        tx.commit().await?;
        Ok(session_id)
    }

    async fn go_offline_tx(&self, driver_id: Uuid) -> DispatchResult<(Option<Uuid>, SessionSummary)> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM drivers WHERE id = $1 FOR UPDATE")
                .bind(driver_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(DispatchError::DriverNotFound(driver_id.to_string()));
        }

        sqlx::query("UPDATE drivers SET status = 'OFFLINE', updated_at = NOW() WHERE id = $1")
            .bind(driver_id)
            .execute(&mut *tx)
            .await?;

        let session = sqlx::query(
            "UPDATE driver_sessions SET ended_at = NOW() \
             WHERE driver_id = $1 AND ended_at IS NULL \
             RETURNING id, started_at, ended_at, total_rides, total_earnings",
        )
        .bind(driver_id)
        .fetch_optional(&mut *tx)
        .await?;

        let result = match session {
            Some(row) => {
                let id: Uuid = row.try_get("id")?;
                let started_at: DateTime<Utc> = row.try_get("started_at")?;
                let ended_at: DateTime<Utc> = row.try_get("ended_at")?;
                let summary = SessionSummary {
                    duration_hours: (ended_at - started_at).num_seconds() as f64 / 3600.0,
                    rides_completed: row.try_get("total_rides")?,
                    earnings: row.try_get("total_earnings")?,
                };
                (Some(id), summary)
            }
            // No open session: going offline is idempotent.
            None => (None, SessionSummary::zero()),
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn update_location_tx(
        &self,
        driver_id: Uuid,
        update: &LocationUpdate,
    ) -> DispatchResult<(Coordinate, Option<Uuid>)> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM drivers WHERE id = $1")
            .bind(driver_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DispatchError::DriverNotFound(driver_id.to_string()));
        }

        let active_ride: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM rides WHERE driver_id = $1 \
             AND status IN ('MATCHED', 'EN_ROUTE', 'ARRIVED', 'IN_PROGRESS') LIMIT 1",
        )
        .bind(driver_id)
        .fetch_optional(&mut *tx)
        .await?;

        let address = update.address.as_deref().unwrap_or("Current location");
        let coordinate =
            supersede_coordinate(&mut tx, driver_id, address, update.latitude, update.longitude)
                .await?;

        sqlx::query(
            "INSERT INTO location_history (coordinate_id, driver_id, latitude, longitude, \
             accuracy_meters, speed_kmh, heading_degrees, ride_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(coordinate.id)
        .bind(driver_id)
        .bind(update.latitude)
        .bind(update.longitude)
        .bind(update.accuracy_meters)
        .bind(update.speed_kmh)
        .bind(update.heading_degrees)
        .bind(active_ride)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((coordinate, active_ride))
    }
}

#[async_trait]
impl DriverRepository for PostgresDriverRepository {
    async fn get_driver(&self, driver_id: Uuid) -> DispatchResult<Option<Driver>> {
        let row = tokio::time::timeout(
            READ_TIMEOUT,
            sqlx::query(
                "SELECT id, license_plate, vehicle_type, vehicle_make, vehicle_model, \
                 vehicle_year, status, rating, total_rides, total_earnings, is_verified, \
                 created_at, updated_at FROM drivers WHERE id = $1",
            )
            .bind(driver_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)??;
        row.as_ref().map(driver_from_row).transpose()
    }

    async fn go_online(
        &self,
        driver_id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> DispatchResult<Uuid> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.go_online_tx(driver_id, latitude, longitude)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn go_offline(&self, driver_id: Uuid) -> DispatchResult<(Option<Uuid>, SessionSummary)> {
        tokio::time::timeout(WRITE_TIMEOUT, with_retry(|| self.go_offline_tx(driver_id)))
            .await
            .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn update_location(
        &self,
        driver_id: Uuid,
        update: &LocationUpdate,
    ) -> DispatchResult<(Coordinate, Option<Uuid>)> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            with_retry(|| self.update_location_tx(driver_id, update)),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)?
    }

    async fn find_available(
        &self,
        vehicle_type: VehicleType,
    ) -> DispatchResult<Vec<CandidateDriver>> {
        let rows = tokio::time::timeout(
            READ_TIMEOUT,
            sqlx::query(
                "SELECT d.id AS driver_id, d.rating, c.latitude, c.longitude \
                 FROM drivers d \
                 JOIN coordinates c ON c.entity_id = d.id \
                   AND c.entity_type = 'driver' AND c.is_current \
                 WHERE d.status = 'AVAILABLE' AND d.vehicle_type = $1",
            )
            .bind(vehicle_type.as_str())
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::StoreTimeout)??;

        rows.iter()
            .map(|row| {
                Ok(CandidateDriver {
                    driver_id: row.try_get("driver_id")?,
                    rating: row.try_get("rating")?,
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                })
            })
            .collect()
    }
}
