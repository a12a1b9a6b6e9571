// src/services/matcher_service.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing;
use uuid::Uuid;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::coordinate::LocationWithAddress;
use crate::models::driver::CandidateDriver;
use crate::models::messages::{MSG_RIDE_OFFER, MSG_RIDE_OFFER_CANCELLED, MSG_RIDE_OFFER_LOST};
use crate::models::offer::{OfferClosedMessage, OfferDecision, RideOffer, RideOfferResponse};
use crate::models::ride::RideRequestMessage;
use crate::repo::DriverRepository;
use crate::services::event_bus::{
    EventBus, EventPublisher, MessageHandler, QUEUE_DRIVER_MATCHING, EXCHANGE_RIDE_TOPIC,
};
use crate::services::ride_service::RideOperations;
use crate::services::session_hub::SessionHub;
use crate::utils::geo;

/// Driver share of the estimated fare shown on an offer.
const OFFER_EARNINGS_SHARE: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Top-K candidates per round.
    pub max_candidates: usize,
    /// Pause between search rounds.
    pub retry_interval: Duration,
    /// Search rounds before giving up on a ride.
    pub max_attempts: u32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            retry_interval: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// A candidate with its computed distance to the pickup point.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub driver_id: Uuid,
    pub rating: f64,
    pub distance_km: f64,
}

/// Filter to the search radius and rank by ascending distance, then by
/// descending rating, keeping the top K.
pub fn rank_candidates(
    candidates: Vec<CandidateDriver>,
    pickup_latitude: f64,
    pickup_longitude: f64,
    max_distance_km: f64,
    limit: usize,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let distance_km = geo::haversine_km(
                pickup_latitude,
                pickup_longitude,
                candidate.latitude,
                candidate.longitude,
            );
            (distance_km <= max_distance_km).then_some(RankedCandidate {
                driver_id: candidate.driver_id,
                rating: candidate.rating,
                distance_km,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then(b.rating.total_cmp(&a.rating))
    });
    ranked.truncate(limit);
    ranked
}

struct PendingRide {
    offers: HashMap<Uuid, RideOffer>,
    responses: mpsc::Sender<(Uuid, OfferDecision)>,
}

/// Turns a ride request into one assigned driver: candidate search, timed
/// offer fan-out over live sessions, and first-accept-wins resolution.
pub struct MatcherService {
    driver_repo: Arc<dyn DriverRepository>,
    ride_service: Arc<dyn RideOperations>,
    hub: Arc<SessionHub>,
    publisher: Arc<dyn EventPublisher>,
    // Offer bookkeeping per ride; never held across an await.
    pending: Mutex<HashMap<Uuid, PendingRide>>,
    config: MatcherConfig,
}

impl MatcherService {
    pub fn new(
        driver_repo: Arc<dyn DriverRepository>,
        ride_service: Arc<dyn RideOperations>,
        hub: Arc<SessionHub>,
        publisher: Arc<dyn EventPublisher>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            driver_repo,
            ride_service,
            hub,
            publisher,
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Bind the matcher to its queue on the bus. One consumer task; each
    /// ride request is matched on its own task.
    pub fn start(self: &Arc<Self>, bus: &Arc<EventBus>) -> crate::services::event_bus::ConsumerHandle {
        bus.consume(QUEUE_DRIVER_MATCHING, Arc::new(RideRequestConsumer { matcher: Arc::clone(self) }))
    }

    /// Entry point for `ride_offer_response` frames from driver sessions.
    /// Stale or mismatched responses are dropped.
    pub fn handle_offer_response(&self, driver_id: Uuid, response: RideOfferResponse) {
        let pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get(&response.ride_id) else {
            tracing::debug!(%driver_id, ride_id = %response.ride_id, "response for unknown ride");
            return;
        };
        let Some(offer) = entry.offers.get(&driver_id) else {
            tracing::debug!(%driver_id, ride_id = %response.ride_id, "no offer for this driver");
            return;
        };
        if offer.offer_id != response.offer_id {
            tracing::debug!(%driver_id, "offer id mismatch, dropping response");
            return;
        }
        if offer.is_expired(Utc::now()) {
            tracing::debug!(%driver_id, "offer already expired, dropping response");
            return;
        }
        // Arrival order at this channel breaks acceptance ties.
        if entry.responses.try_send((driver_id, response.decision)).is_err() {
            tracing::debug!(%driver_id, "matching round no longer accepting responses");
        }
    }

    pub async fn handle_ride_request(self: Arc<Self>, request: RideRequestMessage) {
        let ride_id = request.ride_id;
        tracing::info!(%ride_id, vehicle_type = request.vehicle_type.as_str(), "matching started");

        for attempt in 1..=self.config.max_attempts {
            let ranked = match self.search_candidates(&request).await {
                Ok(ranked) => ranked,
                Err(err) => {
                    tracing::error!(%ride_id, attempt, "candidate search failed: {}", err);
                    Vec::new()
                }
            };

            if ranked.is_empty() {
                tracing::info!(%ride_id, attempt, "no candidates in range");
                if attempt < self.config.max_attempts {
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                continue;
            }

            let Some(rx) = self.fan_out(&request, &ranked) else {
                // Every candidate session died between the query and the send.
                if attempt < self.config.max_attempts {
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                continue;
            };

            let winner = self.wait_for_acceptance(ride_id, request.timeout_seconds, rx).await;
            let entry = self.pending.lock().unwrap().remove(&ride_id);

            if let Some((winner_id, late_acceptors)) = winner {
                if let Some(entry) = entry {
                    self.close_losing_offers(&entry, winner_id, &late_acceptors);
                }
                tracing::info!(%ride_id, driver_id = %winner_id, "matched");
                return;
            }
            tracing::info!(%ride_id, attempt, "offer round expired without a match");
        }

        self.give_up(&request).await;
    }

    async fn search_candidates(
        &self,
        request: &RideRequestMessage,
    ) -> DispatchResult<Vec<RankedCandidate>> {
        let available = self.driver_repo.find_available(request.vehicle_type).await?;
        let mut ranked = rank_candidates(
            available,
            request.pickup_location.latitude,
            request.pickup_location.longitude,
            request.max_distance_km,
            self.config.max_candidates,
        );
        // A driver without a live session cannot receive the offer.
        ranked.retain(|candidate| self.hub.is_connected(candidate.driver_id));
        Ok(ranked)
    }

    /// Send an offer to every ranked candidate. Returns the response channel
    /// for the round, or None when no offer could be delivered.
    fn fan_out(
        &self,
        request: &RideRequestMessage,
        ranked: &[RankedCandidate],
    ) -> Option<mpsc::Receiver<(Uuid, OfferDecision)>> {
        let expires_at = Utc::now() + chrono::Duration::seconds(request.timeout_seconds as i64);
        let (tx, rx) = mpsc::channel(ranked.len().max(1));

        let mut offers = HashMap::new();
        for candidate in ranked {
            let offer = RideOffer {
                offer_id: RideOffer::offer_id_for(request.ride_id, candidate.driver_id),
                ride_id: request.ride_id,
                ride_number: request.ride_number.clone(),
                pickup_location: LocationWithAddress {
                    location: request.pickup_location,
                    address: request.pickup_address.clone(),
                },
                destination_location: LocationWithAddress {
                    location: request.destination_location,
                    address: request.destination_address.clone(),
                },
                estimated_fare: request.estimated_fare,
                driver_earnings: request.estimated_fare * OFFER_EARNINGS_SHARE,
                distance_to_pickup_km: candidate.distance_km,
                estimated_ride_duration_minutes: request.estimated_duration_minutes,
                expires_at,
            };
            match self.hub.send_to_driver(
                candidate.driver_id,
                MSG_RIDE_OFFER,
                serde_json::json!(offer),
            ) {
                Ok(()) => {
                    offers.insert(candidate.driver_id, offer);
                }
                Err(err) => {
                    tracing::debug!(driver_id = %candidate.driver_id, "offer not delivered: {}", err);
                }
            }
        }

        if offers.is_empty() {
            return None;
        }
        tracing::info!(ride_id = %request.ride_id, count = offers.len(), "offers sent");
        self.pending
            .lock()
            .unwrap()
            .insert(request.ride_id, PendingRide { offers, responses: tx });
        Some(rx)
    }

    /// Resolve responses until a valid acceptance commits or the round
    /// deadline passes. First accept wins; a MatchRejected acceptance falls
    /// through to the next response.
    async fn wait_for_acceptance(
        &self,
        ride_id: Uuid,
        timeout_seconds: u64,
        mut rx: mpsc::Receiver<(Uuid, OfferDecision)>,
    ) -> Option<(Uuid, Vec<Uuid>)> {
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let response = match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => return None,
                Err(_) => return None,
            };

            match response {
                (driver_id, OfferDecision::Reject) => {
                    tracing::debug!(%ride_id, %driver_id, "offer rejected");
                    let mut pending = self.pending.lock().unwrap();
                    if let Some(entry) = pending.get_mut(&ride_id) {
                        entry.offers.remove(&driver_id);
                        if entry.offers.is_empty() {
                            // Everybody said no; end the round early.
                            return None;
                        }
                    }
                }
                (driver_id, OfferDecision::Accept) => {
                    match self.ride_service.on_driver_accepted(ride_id, driver_id).await {
                        Ok(_) => {
                            // Acceptances already queued behind the winner
                            // lost the race.
                            let mut late_acceptors = Vec::new();
                            while let Ok((late_id, decision)) = rx.try_recv() {
                                if decision == OfferDecision::Accept && late_id != driver_id {
                                    late_acceptors.push(late_id);
                                }
                            }
                            return Some((driver_id, late_acceptors));
                        }
                        Err(DispatchError::MatchRejected(reason)) => {
                            tracing::info!(%ride_id, %driver_id, "acceptance rejected: {}", reason);
                            let mut pending = self.pending.lock().unwrap();
                            if let Some(entry) = pending.get_mut(&ride_id) {
                                entry.offers.remove(&driver_id);
                                if entry.offers.is_empty() {
                                    return None;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!(%ride_id, %driver_id, "acceptance failed: {}", err);
                        }
                    }
                }
            }
        }
    }

    /// Tell everyone who didn't win. Late acceptors lost the race; everyone
    /// else sees a plain cancellation.
    fn close_losing_offers(&self, entry: &PendingRide, winner_id: Uuid, late_acceptors: &[Uuid]) {
        for (driver_id, offer) in &entry.offers {
            if *driver_id == winner_id {
                continue;
            }
            let message = OfferClosedMessage {
                offer_id: offer.offer_id.clone(),
                ride_id: offer.ride_id,
                reason: "ride matched to another driver".to_string(),
            };
            let frame_type = if late_acceptors.contains(driver_id) {
                MSG_RIDE_OFFER_LOST
            } else {
                MSG_RIDE_OFFER_CANCELLED
            };
            if let Err(err) =
                self.hub.send_to_driver(*driver_id, frame_type, serde_json::json!(message))
            {
                tracing::debug!(%driver_id, "offer close frame not delivered: {}", err);
            }
        }
    }

    async fn give_up(&self, request: &RideRequestMessage) {
        let ride_id = request.ride_id;
        tracing::warn!(%ride_id, "no drivers available after {} attempts", self.config.max_attempts);

        let payload = serde_json::json!({
            "ride_id": ride_id,
            "vehicle_type": request.vehicle_type,
            "timestamp": Utc::now(),
        });
        if let Err(err) = self
            .publisher
            .publish(EXCHANGE_RIDE_TOPIC, "ride.status.no_drivers_available", payload)
            .await
        {
            tracing::warn!(%ride_id, "no-drivers publish failed: {}", err);
        }

        if let Err(err) = self.ride_service.auto_cancel_no_drivers(ride_id).await {
            tracing::error!(%ride_id, "auto-cancel failed: {}", err);
        }
    }
}

struct RideRequestConsumer {
    matcher: Arc<MatcherService>,
}

#[async_trait]
impl MessageHandler for RideRequestConsumer {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> DispatchResult<()> {
        if !routing_key.starts_with("ride.request.") {
            tracing::debug!(routing_key, "ignoring message");
            return Ok(());
        }
        let request: RideRequestMessage = serde_json::from_slice(payload)?;
        let matcher = Arc::clone(&self.matcher);
        tokio::spawn(matcher.handle_ride_request(request));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::coordinate::Location;
    use crate::models::driver::DriverStatus;
    use crate::models::messages::WsEnvelope;
    use crate::models::ride::{CreateRideRequest, RideResponse, RideStatus, VehicleType};
    use crate::repo::memory::{test_driver, InMemoryStore};
    use crate::services::event_bus::testing::MockEventPublisher;
    use crate::services::ride_service::RideService;

    fn test_config() -> MatcherConfig {
        MatcherConfig {
            max_candidates: 10,
            retry_interval: Duration::from_millis(10),
            max_attempts: 2,
        }
    }

    struct Fixture {
        matcher: Arc<MatcherService>,
        store: Arc<InMemoryStore>,
        hub: Arc<SessionHub>,
        publisher: Arc<MockEventPublisher>,
        ride_service: Arc<RideService>,
    }

    fn fixture(config: MatcherConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let hub = Arc::new(SessionHub::new());
        let ride_service =
            Arc::new(RideService::new(store.clone(), publisher.clone(), hub.clone()));
        let matcher = Arc::new(MatcherService::new(
            store.clone(),
            ride_service.clone(),
            hub.clone(),
            publisher.clone(),
            config,
        ));
        Fixture { matcher, store, hub, publisher, ride_service }
    }

    async fn create_economy_ride(fixture: &Fixture) -> RideResponse {
        fixture
            .ride_service
            .create_ride(
                Uuid::new_v4(),
                CreateRideRequest {
                    pickup_address: "Abay Ave 10".to_string(),
                    pickup_latitude: 43.2389,
                    pickup_longitude: 76.8897,
                    destination_address: "Seifullin St 5".to_string(),
                    destination_latitude: 43.2220,
                    destination_longitude: 76.8515,
                    vehicle_type: "ECONOMY".to_string(),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap()
    }

    fn request_for(response: &RideResponse, timeout_seconds: u64) -> RideRequestMessage {
        RideRequestMessage {
            ride_id: response.ride_id,
            ride_number: response.ride_number.clone(),
            passenger_id: Uuid::new_v4(),
            vehicle_type: VehicleType::Economy,
            pickup_location: Location { latitude: 43.2389, longitude: 76.8897 },
            pickup_address: "Abay Ave 10".to_string(),
            destination_location: Location { latitude: 43.2220, longitude: 76.8515 },
            destination_address: "Seifullin St 5".to_string(),
            estimated_fare: response.estimated_fare,
            estimated_duration_minutes: response.estimated_duration_minutes,
            max_distance_km: 5.0,
            timeout_seconds,
            timestamp: Utc::now(),
        }
    }

    /// Register a driver with a current coordinate and a live session.
    async fn online_driver(
        fixture: &Fixture,
        rating: f64,
        latitude: f64,
        longitude: f64,
    ) -> (Uuid, tokio::sync::mpsc::Receiver<String>) {
        use crate::repo::DriverRepository;
        let driver = test_driver(VehicleType::Economy, rating);
        let driver_id = driver.id;
        fixture.store.insert_driver(driver);
        fixture.store.go_online(driver_id, latitude, longitude).await.unwrap();
        let (_conn, rx) = fixture.hub.register(driver_id);
        (driver_id, rx)
    }

    async fn next_frame(rx: &mut tokio::sync::mpsc::Receiver<String>) -> WsEnvelope {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed");
        serde_json::from_str(&text).unwrap()
    }

    fn accept(ride_id: Uuid, driver_id: Uuid) -> RideOfferResponse {
        RideOfferResponse {
            offer_id: RideOffer::offer_id_for(ride_id, driver_id),
            ride_id,
            decision: OfferDecision::Accept,
        }
    }

    fn reject(ride_id: Uuid, driver_id: Uuid) -> RideOfferResponse {
        RideOfferResponse {
            offer_id: RideOffer::offer_id_for(ride_id, driver_id),
            ride_id,
            decision: OfferDecision::Reject,
        }
    }

    #[test]
    fn test_ranking_orders_by_distance_then_rating() {
        let pickup = (43.2389, 76.8897);
        let near_low = CandidateDriver {
            driver_id: Uuid::new_v4(),
            rating: 3.0,
            latitude: 43.2400,
            longitude: 76.8900,
        };
        let near_high = CandidateDriver {
            driver_id: Uuid::new_v4(),
            rating: 4.9,
            latitude: 43.2400,
            longitude: 76.8900,
        };
        let far = CandidateDriver {
            driver_id: Uuid::new_v4(),
            rating: 5.0,
            latitude: 43.2500,
            longitude: 76.9000,
        };
        let out_of_range = CandidateDriver {
            driver_id: Uuid::new_v4(),
            rating: 5.0,
            latitude: 44.0,
            longitude: 77.5,
        };

        let ranked = rank_candidates(
            vec![far.clone(), near_low.clone(), out_of_range, near_high.clone()],
            pickup.0,
            pickup.1,
            5.0,
            10,
        );

        let ids: Vec<Uuid> = ranked.iter().map(|c| c.driver_id).collect();
        assert_eq!(ids, vec![near_high.driver_id, near_low.driver_id, far.driver_id]);
    }

    #[test]
    fn test_ranking_truncates_to_limit() {
        let candidates: Vec<CandidateDriver> = (0..15)
            .map(|i| CandidateDriver {
                driver_id: Uuid::new_v4(),
                rating: 4.0,
                latitude: 43.2389 + i as f64 * 0.001,
                longitude: 76.8897,
            })
            .collect();
        let ranked = rank_candidates(candidates, 43.2389, 76.8897, 5.0, 10);
        assert_eq!(ranked.len(), 10);
    }

    #[tokio::test]
    async fn test_first_accept_wins_race_loser_notified() {
        let fixture = fixture(test_config());
        let (d1, mut rx1) = online_driver(&fixture, 4.9, 43.2400, 76.8900).await;
        let (d2, mut rx2) = online_driver(&fixture, 4.7, 43.2500, 76.9000).await;

        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 5);
        let task = tokio::spawn(Arc::clone(&fixture.matcher).handle_ride_request(request));

        let offer1 = next_frame(&mut rx1).await;
        let offer2 = next_frame(&mut rx2).await;
        assert_eq!(offer1.message_type, MSG_RIDE_OFFER);
        assert_eq!(offer2.message_type, MSG_RIDE_OFFER);

        // Both accept inside the same window; arrival order decides.
        fixture.matcher.handle_offer_response(d1, accept(response.ride_id, d1));
        fixture.matcher.handle_offer_response(d2, accept(response.ride_id, d2));
        task.await.unwrap();

        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.status, RideStatus::Matched);
        assert_eq!(ride.driver_id, Some(d1));
        assert_eq!(fixture.store.driver_status(d1), Some(DriverStatus::Busy));
        assert_eq!(fixture.store.driver_status(d2), Some(DriverStatus::Available));

        // d1 gets the matched ride_status frame, d2 learns it lost the race.
        let lost = next_frame(&mut rx2).await;
        assert_eq!(lost.message_type, MSG_RIDE_OFFER_LOST);
    }

    #[tokio::test]
    async fn test_rejection_falls_through_to_next_acceptance() {
        let fixture = fixture(test_config());
        let (d1, mut rx1) = online_driver(&fixture, 4.9, 43.2400, 76.8900).await;
        let (d2, mut rx2) = online_driver(&fixture, 4.7, 43.2500, 76.9000).await;

        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 5);
        let task = tokio::spawn(Arc::clone(&fixture.matcher).handle_ride_request(request));

        next_frame(&mut rx1).await;
        next_frame(&mut rx2).await;

        fixture.matcher.handle_offer_response(d1, reject(response.ride_id, d1));
        fixture.matcher.handle_offer_response(d2, accept(response.ride_id, d2));
        task.await.unwrap();

        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.driver_id, Some(d2));
        assert_eq!(fixture.store.driver_status(d2), Some(DriverStatus::Busy));
        assert_eq!(fixture.store.driver_status(d1), Some(DriverStatus::Available));
    }

    #[tokio::test]
    async fn test_no_drivers_emits_event_and_auto_cancels() {
        let fixture = fixture(test_config());
        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 1);

        Arc::clone(&fixture.matcher).handle_ride_request(request).await;

        assert!(fixture
            .publisher
            .routing_keys()
            .contains(&"ride.status.no_drivers_available".to_string()));
        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.status, RideStatus::Cancelled);
        assert_eq!(ride.cancellation_reason.as_deref(), Some("no drivers"));
    }

    #[tokio::test]
    async fn test_driver_without_session_is_skipped() {
        use crate::repo::DriverRepository;
        let fixture = fixture(test_config());

        // Available in the registry, but its connection is gone.
        let driver = test_driver(VehicleType::Economy, 4.9);
        let driver_id = driver.id;
        fixture.store.insert_driver(driver);
        fixture.store.go_online(driver_id, 43.2400, 76.8900).await.unwrap();

        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 1);
        Arc::clone(&fixture.matcher).handle_ride_request(request).await;

        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.status, RideStatus::Cancelled);
        assert_eq!(fixture.store.driver_status(driver_id), Some(DriverStatus::Available));
    }

    #[tokio::test]
    async fn test_duplicate_request_cannot_double_match() {
        let fixture = fixture(MatcherConfig {
            max_candidates: 10,
            retry_interval: Duration::from_millis(10),
            max_attempts: 1,
        });
        let (d1, mut rx1) = online_driver(&fixture, 4.9, 43.2400, 76.8900).await;
        let (d2, mut rx2) = online_driver(&fixture, 4.7, 43.2500, 76.9000).await;

        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 5);

        let task =
            tokio::spawn(Arc::clone(&fixture.matcher).handle_ride_request(request.clone()));
        next_frame(&mut rx1).await;
        next_frame(&mut rx2).await;
        fixture.matcher.handle_offer_response(d1, accept(response.ride_id, d1));
        task.await.unwrap();

        let cancelled = next_frame(&mut rx2).await;
        assert_eq!(cancelled.message_type, MSG_RIDE_OFFER_CANCELLED);

        // The same request delivered again (at-least-once bus). d2 accepts,
        // but the ride is no longer REQUESTED, so nothing changes.
        let replay = tokio::spawn(Arc::clone(&fixture.matcher).handle_ride_request(request));
        let reoffer = next_frame(&mut rx2).await;
        assert_eq!(reoffer.message_type, MSG_RIDE_OFFER);
        fixture.matcher.handle_offer_response(d2, accept(response.ride_id, d2));
        replay.await.unwrap();

        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.driver_id, Some(d1));
        assert_eq!(fixture.store.driver_status(d2), Some(DriverStatus::Available));
    }

    #[tokio::test]
    async fn test_stale_response_is_ignored() {
        let fixture = fixture(test_config());
        let driver_id = Uuid::new_v4();
        // No pending ride at all; must be dropped silently.
        fixture.matcher.handle_offer_response(driver_id, accept(Uuid::new_v4(), driver_id));
    }

    #[tokio::test]
    async fn test_unavailable_winner_falls_through() {
        let fixture = fixture(test_config());
        let (d1, mut rx1) = online_driver(&fixture, 4.9, 43.2400, 76.8900).await;
        let (d2, mut rx2) = online_driver(&fixture, 4.7, 43.2500, 76.9000).await;

        let response = create_economy_ride(&fixture).await;
        let request = request_for(&response, 5);
        let task = tokio::spawn(Arc::clone(&fixture.matcher).handle_ride_request(request));

        next_frame(&mut rx1).await;
        next_frame(&mut rx2).await;

        // d1 went busy on another ride between offer and accept.
        fixture
            .store
            .drivers
            .lock()
            .unwrap()
            .get_mut(&d1)
            .map(|d| d.status = DriverStatus::Busy);

        fixture.matcher.handle_offer_response(d1, accept(response.ride_id, d1));
        fixture.matcher.handle_offer_response(d2, accept(response.ride_id, d2));
        task.await.unwrap();

        let ride = fixture.store.rides.lock().unwrap().get(&response.ride_id).cloned().unwrap();
        assert_eq!(ride.driver_id, Some(d2));
        assert_eq!(fixture.store.driver_status(d2), Some(DriverStatus::Busy));
    }
}
