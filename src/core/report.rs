//! Periodic loss statistics

use crate::core::channel::SampleChannel;
use crate::core::loss::{LossMonitor, LossSnapshot};
use crate::core::stop::StopSignal;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

/// Default reporting period
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// One-line summary plus a line per sensor
pub fn format_report(snapshot: &LossSnapshot, dropped: u64, now: DateTime<Local>) -> String {
    let mut out = format!(
        "received {} | missing {} | {:.1}% received | last packet {:.1} min ago | dropped {}",
        snapshot.received_count,
        snapshot.missing_count,
        snapshot.percent_received(),
        snapshot.minutes_since_last(now),
        dropped
    );
    for (id, sensor) in &snapshot.sensors {
        let _ = write!(
            out,
            "\n  sensor {id}: received {} | missing {} | {:.1}%",
            sensor.received_count,
            sensor.missing_count,
            sensor.percent_received()
        );
    }
    out
}

/// Log a report every `interval` until stopped or the channel closes
pub fn spawn_stats_reporter(
    monitor: LossMonitor,
    channel: SampleChannel,
    interval: Duration,
    stop: StopSignal,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stats-reporter".into())
        .spawn(move || {
            while !stop.sleep(interval) && !channel.is_closed() {
                let snapshot = monitor.snapshot();
                info!(
                    received = snapshot.received_count,
                    missing = snapshot.missing_count,
                    percent = snapshot.percent_received(),
                    "{}",
                    format_report(&snapshot, channel.dropped(), Local::now())
                );
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss::LossTracker;
    use chrono::TimeZone;

    #[test]
    fn test_report_before_any_packet() {
        let snapshot = LossTracker::new().monitor().snapshot();
        let text = format_report(&snapshot, 0, Local::now());
        assert_eq!(
            text,
            "received 0 | missing 0 | 100.0% received | last packet 0.0 min ago | dropped 0"
        );
    }

    #[test]
    fn test_report_lists_sensors() {
        let start = Local.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let mut tracker = LossTracker::new();
        tracker.record_at(0, 1, start);
        tracker.record_at(0, 3, start);
        tracker.record_at(4, 9, start);

        let now = start + chrono::Duration::seconds(90);
        let text = format_report(&tracker.monitor().snapshot(), 2, now);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "received 3 | missing 1 | 75.0% received | last packet 1.5 min ago | dropped 2"
        );
        assert_eq!(lines[1], "  sensor 0: received 2 | missing 1 | 66.7%");
        assert_eq!(lines[2], "  sensor 4: received 1 | missing 0 | 100.0%");
    }

    #[test]
    fn test_reporter_exits_on_stop() {
        let stop = StopSignal::new();
        let handle = spawn_stats_reporter(
            LossTracker::new().monitor(),
            SampleChannel::default(),
            Duration::from_secs(3600),
            stop.clone(),
        )
        .unwrap();
        stop.request_stop();
        handle.join().unwrap();
    }
}
