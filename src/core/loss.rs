//! Per-sensor packet loss accounting
//!
//! Sequence ids are 8-bit and wrap, so every gap is computed modulo 256.
//! [`LossTracker`] is owned by the reader thread; other threads observe it
//! through a [`LossMonitor`] snapshot handle.

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Missed sequence numbers between two consecutive observations
///
/// `last=254, current=0` gives 1; a repeated id counts as a full wrap (255).
pub fn sequence_gap(last: u8, current: u8) -> u8 {
    current.wrapping_sub(last).wrapping_sub(1)
}

fn percent(received: u64, missing: u64) -> f64 {
    let total = received + missing;
    if total == 0 {
        100.0
    } else {
        received as f64 / total as f64 * 100.0
    }
}

/// Loss state of one sensor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorLossState {
    /// Last observed sequence id
    pub last_sequence_id: Option<u8>,
    /// Packets received
    pub received_count: u64,
    /// Packets inferred missing from sequence gaps
    pub missing_count: u64,
    /// Arrival time of the last packet
    pub last_packet_at: Option<DateTime<Local>>,
}

impl SensorLossState {
    /// Percentage of packets received (100 when nothing was recorded)
    pub fn percent_received(&self) -> f64 {
        percent(self.received_count, self.missing_count)
    }
}

// Totals and per-sensor rows change together under one lock.
type SharedLoss = RwLock<LossSnapshot>;

/// Sequence-gap tracker, one state per sensor id
///
/// Sensor ids are never evicted; at most 256 states can exist.
#[derive(Debug, Default)]
pub struct LossTracker {
    sensors: BTreeMap<u8, SensorLossState>,
    received: u64,
    missing: u64,
    last_packet_at: Option<DateTime<Local>>,
    shared: Arc<SharedLoss>,
}

impl LossTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet arriving now; returns the gap before it
    pub fn record(&mut self, sensor_id: u8, sequence_id: u8) -> u8 {
        self.record_at(sensor_id, sequence_id, Local::now())
    }

    /// Record a packet with an explicit arrival time; returns the gap before it
    pub fn record_at(&mut self, sensor_id: u8, sequence_id: u8, arrived_at: DateTime<Local>) -> u8 {
        let state = self.sensors.entry(sensor_id).or_default();

        let gap = state
            .last_sequence_id
            .map_or(0, |last| sequence_gap(last, sequence_id));

        state.last_sequence_id = Some(sequence_id);
        state.received_count += 1;
        state.missing_count += u64::from(gap);
        state.last_packet_at = Some(arrived_at);

        self.received += 1;
        self.missing += u64::from(gap);
        self.last_packet_at = Some(arrived_at);

        trace!(sensor_id, sequence_id, gap, "Sequence recorded");

        let snapshot = state.clone();
        self.publish(sensor_id, snapshot);
        gap
    }

    fn publish(&self, sensor_id: u8, state: SensorLossState) {
        let mut shared = self.shared.write();
        shared.received_count = self.received;
        shared.missing_count = self.missing;
        shared.last_packet_at = self.last_packet_at;
        shared.sensors.insert(sensor_id, state);
    }

    /// State of one sensor
    pub fn sensor(&self, sensor_id: u8) -> Option<&SensorLossState> {
        self.sensors.get(&sensor_id)
    }

    /// Iterate over all tracked sensors in id order
    pub fn sensors(&self) -> impl Iterator<Item = (u8, &SensorLossState)> {
        self.sensors.iter().map(|(id, state)| (*id, state))
    }

    /// Packets received across all sensors
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Packets missing across all sensors
    pub fn missing_count(&self) -> u64 {
        self.missing
    }

    /// Percentage of packets received across all sensors
    pub fn percent_received(&self) -> f64 {
        percent(self.received, self.missing)
    }

    /// Handle for reading the counters from other threads
    pub fn monitor(&self) -> LossMonitor {
        LossMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only, thread-safe view of a [`LossTracker`]
#[derive(Debug, Clone)]
pub struct LossMonitor {
    shared: Arc<SharedLoss>,
}

impl LossMonitor {
    /// Packets received across all sensors
    pub fn received_count(&self) -> u64 {
        self.shared.read().received_count
    }

    /// Packets missing across all sensors
    pub fn missing_count(&self) -> u64 {
        self.shared.read().missing_count
    }

    /// Point-in-time copy of every counter
    ///
    /// Totals always equal the sum of the per-sensor rows.
    pub fn snapshot(&self) -> LossSnapshot {
        self.shared.read().clone()
    }
}

/// Copy of the loss counters at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LossSnapshot {
    /// Packets received across all sensors
    pub received_count: u64,
    /// Packets missing across all sensors
    pub missing_count: u64,
    /// Arrival time of the last non-heartbeat packet
    pub last_packet_at: Option<DateTime<Local>>,
    /// Per-sensor state
    pub sensors: BTreeMap<u8, SensorLossState>,
}

impl LossSnapshot {
    /// Percentage of packets received (100 when nothing was recorded)
    pub fn percent_received(&self) -> f64 {
        percent(self.received_count, self.missing_count)
    }

    /// Minutes since the last packet, or 0 before the first one
    pub fn minutes_since_last(&self, now: DateTime<Local>) -> f64 {
        self.last_packet_at
            .map_or(0.0, |at| (now - at).num_milliseconds() as f64 / 60_000.0)
    }
}
