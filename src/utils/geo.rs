// src/utils/geo.rs

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two WGS84 points in kilometers (haversine).
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    haversine_km(lat1, lng1, lat2, lng2) * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_is_zero() {
        assert_eq!(haversine_km(43.2389, 76.8897, 43.2389, 76.8897), 0.0);
    }

    #[test]
    fn test_cross_town_distance() {
        // Central Almaty to the south-west, roughly 3.6 km as the crow flies.
        let d = haversine_km(43.2389, 76.8897, 43.2220, 76.8515);
        assert!(d > 3.0 && d < 4.5, "unexpected distance: {}", d);
    }

    #[test]
    fn test_short_hop() {
        // A driver a couple of blocks from the pickup.
        let d = haversine_km(43.2400, 76.8900, 43.2389, 76.8897);
        assert!(d < 0.2, "unexpected distance: {}", d);
    }

    #[test]
    fn test_meters_scale() {
        let km = haversine_km(43.2389, 76.8897, 43.2220, 76.8515);
        let m = haversine_meters(43.2389, 76.8897, 43.2220, 76.8515);
        assert!((m - km * 1000.0).abs() < 1e-9);
    }
}
