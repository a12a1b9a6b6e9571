// src/utils/id_generator.rs
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};

/// Generates human-readable ride numbers: RIDE_<yyyymmdd_HHMMSS>_<seq>.
///
/// The sequence is process-local and wraps at 1000; together with the
/// second-resolution timestamp it keeps numbers unique for any realistic
/// request rate on a single instance.
pub struct RideNumberGenerator {
    sequence: AtomicU32,
}

impl RideNumberGenerator {
    pub fn new() -> Self {
        Self { sequence: AtomicU32::new(0) }
    }

    pub fn next(&self) -> String {
        self.next_with_timestamp(Utc::now())
    }

    /// Generate with a specific timestamp (useful for testing).
    pub fn next_with_timestamp(&self, timestamp: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 1000;
        format!("RIDE_{}_{:03}", timestamp.format("%Y%m%d_%H%M%S"), seq)
    }

    /// Parse a ride number back to its timestamp component.
    pub fn parse_timestamp(ride_number: &str) -> Option<DateTime<Utc>> {
        let rest = ride_number.strip_prefix("RIDE_")?;
        // yyyymmdd_HHMMSS is 15 characters, then _seq
        if rest.len() < 15 {
            return None;
        }
        let stamp = &rest[..15];
        NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn is_valid(ride_number: &str) -> bool {
        match ride_number.strip_prefix("RIDE_") {
            Some(rest) => {
                let parts: Vec<&str> = rest.split('_').collect();
                parts.len() == 3
                    && parts[0].len() == 8
                    && parts[1].len() == 6
                    && parts[2].len() == 3
                    && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
                    && Self::parse_timestamp(ride_number).is_some()
            }
            None => false,
        }
    }
}

impl Default for RideNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}
