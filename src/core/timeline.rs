//! Sample timestamp reconstruction
//!
//! The sensor samples at a fixed interval, buffers a batch and sends it in
//! one packet. Readings are back-dated from the batch's arrival time so the
//! freshest reading lands exactly on the arrival instant.

use crate::core::protocol::Packet;
use chrono::{DateTime, Duration, Local, SubsecRound};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default spacing between readings of one batch
pub const DEFAULT_SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Longest accepted spacing between readings (one day)
pub const MAX_SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(86_400);

/// One timestamped temperature reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Reconstructed sampling time
    pub timestamp: DateTime<Local>,
    /// Meat probe temperature, degrees
    pub meat_temp: f32,
    /// Fire probe temperature, degrees
    pub fire_temp: f32,
    /// Originating sensor
    pub sensor_id: u8,
    /// Sequence id of the carrying packet
    pub packet_id: u8,
    /// Position inside the batch (0 = oldest)
    pub reading_index: usize,
}

/// Back-dates batch readings from their arrival time
#[derive(Debug, Clone)]
pub struct TimeReconstructor {
    interval: Duration,
    round_to_second: bool,
}

impl Default for TimeReconstructor {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl TimeReconstructor {
    /// Create a reconstructor with the given sampling interval
    ///
    /// Intervals above [`MAX_SAMPLE_INTERVAL`] are clamped to it.
    pub fn new(interval: std::time::Duration) -> Self {
        if interval > MAX_SAMPLE_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                max_secs = MAX_SAMPLE_INTERVAL.as_secs(),
                "Sample interval clamped"
            );
        }
        let interval = interval.min(MAX_SAMPLE_INTERVAL);
        Self {
            interval: Duration::from_std(interval).unwrap_or_else(|_| Duration::days(1)),
            round_to_second: false,
        }
    }

    /// Truncate arrival times to whole seconds
    #[must_use]
    pub fn round_to_second(mut self, enable: bool) -> Self {
        self.round_to_second = enable;
        self
    }

    /// Arrival time after the rounding policy
    pub fn normalize(&self, arrival: DateTime<Local>) -> DateTime<Local> {
        if self.round_to_second {
            arrival.trunc_subsecs(0)
        } else {
            arrival
        }
    }

    /// Timestamp of reading `index` in a batch of `len`
    ///
    /// Falls back to the arrival time when the offset is not representable.
    pub fn timestamp_for(&self, arrival: DateTime<Local>, len: usize, index: usize) -> DateTime<Local> {
        let arrival = self.normalize(arrival);
        let steps = len.saturating_sub(index.saturating_add(1));
        let steps = i32::try_from(steps).unwrap_or(i32::MAX);
        self.interval
            .checked_mul(steps)
            .and_then(|back| arrival.checked_sub_signed(back))
            .unwrap_or(arrival)
    }

    /// Turn a readings packet into samples, oldest first
    ///
    /// Heartbeats carry no readings and produce nothing.
    pub fn reconstruct(&self, arrival: DateTime<Local>, packet: &Packet) -> Vec<Sample> {
        let readings = packet.readings();
        readings
            .iter()
            .enumerate()
            .map(|(index, reading)| Sample {
                timestamp: self.timestamp_for(arrival, readings.len(), index),
                meat_temp: reading.meat_temp,
                fire_temp: reading.fire_temp,
                sensor_id: packet.sensor_id,
                packet_id: packet.sequence_id,
                reading_index: index,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{Payload, Reading};
    use chrono::TimeZone;

    fn batch(len: usize) -> Packet {
        Packet {
            sequence_id: 12,
            sensor_id: 2,
            payload: Payload::Readings(
                (0..len)
                    .map(|i| Reading {
                        meat_temp: i as f32,
                        fire_temp: 100.0 + i as f32,
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_five_readings_at_24s() {
        let t = Local.with_ymd_and_hms(2024, 7, 4, 12, 0, 0).unwrap();
        let recon = TimeReconstructor::new(std::time::Duration::from_secs(24));
        let samples = recon.reconstruct(t, &batch(5));

        let stamps: Vec<_> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                t - Duration::seconds(96),
                t - Duration::seconds(72),
                t - Duration::seconds(48),
                t - Duration::seconds(24),
                t,
            ]
        );
    }

    #[test]
    fn test_sample_fields() {
        let t = Local.with_ymd_and_hms(2024, 7, 4, 12, 0, 0).unwrap();
        let samples = TimeReconstructor::default().reconstruct(t, &batch(3));

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].reading_index, 1);
        assert_eq!(samples[1].packet_id, 12);
        assert_eq!(samples[1].sensor_id, 2);
        assert_eq!(samples[1].meat_temp, 1.0);
        assert_eq!(samples[1].fire_temp, 101.0);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_rounding_truncates_subseconds() {
        let t = Local.with_ymd_and_hms(2024, 7, 4, 12, 0, 0).unwrap();
        let arrival = t + Duration::milliseconds(750);
        let recon = TimeReconstructor::default().round_to_second(true);

        let samples = recon.reconstruct(arrival, &batch(2));
        assert_eq!(samples[1].timestamp, t);
        assert_eq!(samples[0].timestamp, t - Duration::seconds(2));
    }

    #[test]
    fn test_oversized_interval_is_clamped() {
        let t = Local.with_ymd_and_hms(2024, 7, 4, 12, 0, 0).unwrap();
        let recon = TimeReconstructor::new(std::time::Duration::from_secs(10_000_000_000_000));

        let samples = recon.reconstruct(t, &batch(5));
        assert_eq!(samples[3].timestamp, t - Duration::days(1));
        assert_eq!(samples[0].timestamp, t - Duration::days(4));
    }

    #[test]
    fn test_unrepresentable_offset_keeps_arrival() {
        let t = Local.with_ymd_and_hms(2024, 7, 4, 12, 0, 0).unwrap();
        let recon = TimeReconstructor::new(MAX_SAMPLE_INTERVAL);
        assert_eq!(recon.timestamp_for(t, usize::MAX, 0), t);
        assert_eq!(recon.timestamp_for(t, 3, usize::MAX), t);
    }

    #[test]
    fn test_heartbeat_yields_nothing() {
        let packet = Packet {
            sequence_id: 0,
            sensor_id: 0xFF,
            payload: Payload::Heartbeat("ok".into()),
        };
        assert!(TimeReconstructor::default().reconstruct(Local::now(), &packet).is_empty());
    }
}
