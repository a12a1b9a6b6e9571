// src/services/driver_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::models::coordinate::{Location, LocationMessage, LocationUpdate, LocationUpdateResponse};
use crate::models::driver::{
    DriverStatus, DriverStatusMessage, OfflineResponse, OnlineResponse,
};
use crate::repo::DriverRepository;
use crate::services::event_bus::{
    EventPublisher, EXCHANGE_DRIVER_TOPIC, EXCHANGE_LOCATION_FANOUT,
};

#[async_trait]
pub trait DriverActions: Send + Sync {
    async fn go_online(
        &self,
        driver_id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> DispatchResult<OnlineResponse>;

    async fn go_offline(&self, driver_id: Uuid) -> DispatchResult<OfflineResponse>;

    async fn update_location(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> DispatchResult<LocationUpdateResponse>;
}

pub struct DriverService {
    driver_repo: Arc<dyn DriverRepository>,
    publisher: Arc<dyn EventPublisher>,
}

impl DriverService {
    pub fn new(driver_repo: Arc<dyn DriverRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { driver_repo, publisher }
    }

    async fn publish_driver_status(&self, driver_id: Uuid, status: DriverStatus) {
        let message = DriverStatusMessage {
            driver_id,
            status,
            ride_id: None,
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
}

#[async_trait]
impl DriverActions for DriverService {
    async fn go_online(
        &self,
        driver_id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> DispatchResult<OnlineResponse> {
        let session_id = self.driver_repo.go_online(driver_id, latitude, longitude).await?;
        tracing::info!(%driver_id, %session_id, "driver online");

        self.publish_driver_status(driver_id, DriverStatus::Available).await;

        Ok(OnlineResponse {
            status: DriverStatus::Available,
            session_id,
            message: "You are now online and ready to accept rides".to_string(),
        })
    }

    async fn go_offline(&self, driver_id: Uuid) -> DispatchResult<OfflineResponse> {
        let (session_id, summary) = self.driver_repo.go_offline(driver_id).await?;
        tracing::info!(
            %driver_id,
            rides = summary.rides_completed,
            earnings = summary.earnings,
            "driver offline"
        );

        self.publish_driver_status(driver_id, DriverStatus::Offline).await;

        Ok(OfflineResponse {
            status: DriverStatus::Offline,
            session_id,
            session_summary: summary,
            message: "You are now offline".to_string(),
        })
    }

    async fn update_location(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
    ) -> DispatchResult<LocationUpdateResponse> {
        let (coordinate, active_ride) = self.driver_repo.update_location(driver_id, &update).await?;
        tracing::debug!(%driver_id, "location updated");

        let message = LocationMessage {
            driver_id,
            ride_id: active_ride,
            location: Location { latitude: update.latitude, longitude: update.longitude },
            speed_kmh: update.speed_kmh,
            heading_degrees: update.heading_degrees,
            timestamp: Utc::now(),
        };
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_LOCATION_FANOUT, "", serde_json::json!(message))
            .await
        {
            tracing::warn!(%driver_id, "location publish failed: {}", err);
        }

        Ok(LocationUpdateResponse {
            coordinate_id: coordinate.id,
            updated_at: coordinate.updated_at,
        })
    }
}
