//! End-to-end tests driving the reader over replayed byte streams

use chrono::{Local, TimeZone};
use sensorgate_core::core::channel::{BackpressurePolicy, ChannelConfig, Record, SampleChannel};
use sensorgate_core::core::protocol::{encode_frame, encode_heartbeat, encode_readings};
use sensorgate_core::core::reader::{GatewayReader, ReaderOptions, ReaderStats};
use sensorgate_core::core::sink::{spawn_sink_consumer, FileSink, RecordFormat, CSV_HEADER};
use sensorgate_core::core::stop::StopSignal;
use sensorgate_core::core::transport::ReplayTransport;
use sensorgate_core::{LossSnapshot, Sample};
use std::io::Cursor;
use std::time::Duration;

struct Outcome {
    stats: ReaderStats,
    loss: LossSnapshot,
    records: Vec<Record>,
}

/// Replay `bytes` in `chunk`-sized reads and collect everything published
fn replay(bytes: Vec<u8>, chunk: usize) -> Outcome {
    let channel = SampleChannel::default();
    let stream = channel.subscribe("test");
    let options = ReaderOptions {
        read_chunk: chunk,
        ..ReaderOptions::default()
    };
    let reader = GatewayReader::new(
        ReplayTransport::from_reader(Cursor::new(bytes), "memory"),
        options,
        channel,
        StopSignal::new(),
    );
    let monitor = reader.loss_monitor();
    let stats = reader.run().expect("replay ends cleanly");

    Outcome {
        stats,
        loss: monitor.snapshot(),
        records: stream.iter().collect(),
    }
}

fn samples(records: &[Record]) -> Vec<&Sample> {
    records
        .iter()
        .filter_map(|r| match r {
            Record::Sample(s) => Some(s),
            Record::Heartbeat(_) => None,
        })
        .collect()
}

#[test]
fn test_single_packet_end_to_end() {
    let mut bytes = vec![0x55, 0xAA, 0x01, 0x00];
    for _ in 0..5 {
        bytes.extend_from_slice(&[0xC8, 0x00, 0x00, 0x00]);
    }
    bytes.extend_from_slice(&[0xAA, 0x55]);

    let out = replay(bytes, 4096);
    assert_eq!(out.stats.packets_decoded, 1);
    assert_eq!(out.loss.received_count, 1);
    assert_eq!(out.loss.missing_count, 0);

    let samples = samples(&out.records);
    assert_eq!(samples.len(), 5);
    for (i, s) in samples.iter().enumerate() {
        assert_eq!(s.meat_temp, 20.0);
        assert_eq!(s.fire_temp, 0.0);
        assert_eq!(s.sensor_id, 0);
        assert_eq!(s.packet_id, 1);
        assert_eq!(s.reading_index, i);
    }
    // Oldest first, two seconds apart
    assert_eq!(
        samples[4].timestamp - samples[0].timestamp,
        chrono::Duration::seconds(8)
    );
}

#[test]
fn test_byte_at_a_time_delivery() {
    let mut bytes = Vec::new();
    for seq in 0..4 {
        bytes.extend(encode_readings(seq, 2, &[(300, 1200); 5]));
    }

    let out = replay(bytes, 1);
    assert_eq!(out.stats.packets_decoded, 4);
    assert_eq!(samples(&out.records).len(), 20);
    assert_eq!(out.loss.missing_count, 0);
}

#[test]
fn test_resync_after_truncated_frame() {
    // A frame whose end marker was lost, then a good frame
    let mut bytes = vec![0x55, 0xAA, 0x07, 0x00, 0x10, 0x00];
    bytes.extend(encode_readings(8, 0, &[(100, 100); 5]));

    let out = replay(bytes, 3);
    assert_eq!(out.stats.packets_decoded, 1);
    assert_eq!(out.stats.decode_errors, 0);
    assert_eq!(out.stats.resyncs, 1);

    let samples = samples(&out.records);
    assert_eq!(samples.len(), 5);
    assert!(samples.iter().all(|s| s.packet_id == 8));
}

#[test]
fn test_frames_containing_start_marker_survive() {
    // Sensor 0x55 with a 17.0 degree reading carries 55 AA inside the body
    let mut bytes = encode_readings(1, 0x55, &[(170, 426); 5]);
    bytes.extend(encode_readings(2, 0x55, &[(682, 170); 5]));
    bytes.extend(encode_readings(0, 4, &[(0, 0); 5]));

    let out = replay(bytes, 5);
    assert_eq!(out.stats.packets_decoded, 3);
    assert_eq!(out.stats.decode_errors, 0);
    assert_eq!(out.stats.resyncs, 0);
    assert_eq!(out.loss.received_count, 3);
    assert_eq!(out.loss.missing_count, 0);

    let samples = samples(&out.records);
    assert_eq!(samples.iter().filter(|s| s.sensor_id == 0x55).count(), 10);
    assert_eq!(samples[0].meat_temp, 17.0);
    assert_eq!(samples[0].fire_temp, 42.5);
}

#[test]
fn test_garbage_between_frames_is_ignored() {
    let mut bytes = vec![0x00, 0x13, 0x55, 0x42];
    bytes.extend(encode_readings(1, 0, &[(0, 0); 5]));
    bytes.extend_from_slice(b"noise");
    bytes.extend(encode_readings(2, 0, &[(0, 0); 5]));

    let out = replay(bytes, 16);
    assert_eq!(out.stats.packets_decoded, 2);
    assert_eq!(out.loss.missing_count, 0);
}

#[test]
fn test_loss_with_wraparound() {
    let mut bytes = Vec::new();
    for seq in [253u8, 254, 0, 3] {
        bytes.extend(encode_readings(seq, 0, &[(0, 0); 5]));
    }

    let out = replay(bytes, 64);
    assert_eq!(out.loss.received_count, 4);
    // 255 missing, then 1 and 2
    assert_eq!(out.loss.missing_count, 3);
    assert!((out.loss.percent_received() - 400.0 / 7.0).abs() < 1e-9);
}

#[test]
fn test_sensors_are_tracked_independently() {
    let mut bytes = Vec::new();
    bytes.extend(encode_readings(10, 1, &[(0, 0); 5]));
    bytes.extend(encode_readings(50, 2, &[(0, 0); 5]));
    bytes.extend(encode_readings(11, 1, &[(0, 0); 5]));
    bytes.extend(encode_readings(51, 2, &[(0, 0); 5]));

    let out = replay(bytes, 4096);
    assert_eq!(out.loss.received_count, 4);
    assert_eq!(out.loss.missing_count, 0);
    assert_eq!(out.loss.sensors[&1].last_sequence_id, Some(11));
    assert_eq!(out.loss.sensors[&2].last_sequence_id, Some(51));
}

#[test]
fn test_heartbeats_do_not_affect_loss() {
    let mut bytes = Vec::new();
    bytes.extend(encode_readings(1, 0, &[(0, 0); 5]));
    bytes.extend(encode_heartbeat(200, "gateway ok"));
    bytes.extend(encode_heartbeat(17, "gateway ok"));
    bytes.extend(encode_readings(2, 0, &[(0, 0); 5]));

    let out = replay(bytes, 4096);
    assert_eq!(out.stats.heartbeats, 2);
    assert_eq!(out.loss.received_count, 2);
    assert_eq!(out.loss.missing_count, 0);

    let texts: Vec<&str> = out
        .records
        .iter()
        .filter_map(|r| match r {
            Record::Heartbeat(h) => Some(h.text.as_str()),
            Record::Sample(_) => None,
        })
        .collect();
    assert_eq!(texts, vec!["gateway ok", "gateway ok"]);
}

#[test]
fn test_malformed_bodies_do_not_stop_the_loop() {
    let mut bytes = Vec::new();
    bytes.extend(encode_frame(&[]));
    bytes.extend(encode_frame(&[0x05]));
    bytes.extend(encode_readings(3, 0, &[(0, 0); 4]));
    bytes.extend(encode_readings(4, 0, &[(0, 0); 5]));

    let out = replay(bytes, 4096);
    assert_eq!(out.stats.decode_errors, 3);
    assert_eq!(out.stats.packets_decoded, 1);
    assert_eq!(out.loss.received_count, 1);
    assert_eq!(out.loss.sensors[&0].last_sequence_id, Some(4));
}

#[test]
fn test_half_degree_rounding_and_negatives() {
    let bytes = encode_readings(0, 0, &[(237, -55), (232, -52), (0, 0), (0, 0), (0, 0)]);

    let out = replay(bytes, 4096);
    let samples = samples(&out.records);
    assert_eq!(samples[0].meat_temp, 23.5);
    assert_eq!(samples[0].fire_temp, -5.5);
    assert_eq!(samples[1].meat_temp, 23.0);
    assert_eq!(samples[1].fire_temp, -5.0);
}

#[test]
fn test_two_consumers_see_every_record() {
    let channel = SampleChannel::default();
    let first = channel.subscribe("file");
    let second = channel.subscribe("live");

    let mut bytes = Vec::new();
    for seq in 0..3 {
        bytes.extend(encode_readings(seq, 0, &[(0, 0); 5]));
    }
    GatewayReader::new(
        ReplayTransport::from_reader(Cursor::new(bytes), "memory"),
        ReaderOptions::default(),
        channel,
        StopSignal::new(),
    )
    .spawn()
    .unwrap()
    .join()
    .unwrap();

    assert_eq!(first.iter().count(), 15);
    assert_eq!(second.iter().count(), 15);
}

#[test]
fn test_drop_oldest_keeps_newest() {
    let channel = SampleChannel::new(ChannelConfig {
        capacity: 4,
        policy: BackpressurePolicy::DropOldest,
        ..ChannelConfig::default()
    });
    let stream = channel.subscribe("stalled");

    let mut bytes = Vec::new();
    for seq in 0..2 {
        bytes.extend(encode_readings(seq, 0, &[(0, 0); 5]));
    }
    let stats = GatewayReader::new(
        ReplayTransport::from_reader(Cursor::new(bytes), "memory"),
        ReaderOptions::default(),
        channel.clone(),
        StopSignal::new(),
    )
    .run()
    .unwrap();

    assert_eq!(stats.records_dropped, 6);
    assert_eq!(channel.dropped(), 6);
    let kept: Vec<(u8, usize)> = stream
        .samples()
        .map(|s| (s.packet_id, s.reading_index))
        .collect();
    assert_eq!(kept, vec![(1, 1), (1, 2), (1, 3), (1, 4)]);
}

#[test]
fn test_blocking_consumer_receives_everything() {
    let channel = SampleChannel::new(ChannelConfig {
        capacity: 2,
        policy: BackpressurePolicy::Block,
        send_timeout: Duration::from_millis(5),
    });
    let stream = channel.subscribe("slow");

    let consumer = std::thread::spawn(move || {
        stream
            .samples()
            .inspect(|_| std::thread::sleep(Duration::from_millis(1)))
            .count()
    });

    let mut bytes = Vec::new();
    for seq in 0..10 {
        bytes.extend(encode_readings(seq, 0, &[(0, 0); 5]));
    }
    let stats = GatewayReader::new(
        ReplayTransport::from_reader(Cursor::new(bytes), "memory"),
        ReaderOptions::default(),
        channel,
        StopSignal::new(),
    )
    .run()
    .unwrap();

    assert_eq!(stats.records_dropped, 0);
    assert_eq!(consumer.join().unwrap(), 50);
}

#[test]
fn test_file_sink_receives_pipeline_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readings.csv");
    let channel = SampleChannel::default();

    let sink = FileSink::open(&path, RecordFormat::Csv).unwrap();
    let consumer = spawn_sink_consumer(channel.subscribe("file"), sink).unwrap();

    let arrival = Local.with_ymd_and_hms(2024, 3, 9, 19, 45, 10).unwrap();
    let mut bytes = encode_readings(42, 3, &[(615, 2040); 5]);
    bytes.extend(encode_heartbeat(1, "ok"));

    GatewayReader::new(
        ReplayTransport::from_reader(Cursor::new(bytes), "memory"),
        ReaderOptions::default(),
        channel,
        StopSignal::new(),
    )
    .with_clock(move || arrival)
    .run()
    .unwrap();

    assert_eq!(consumer.join().unwrap().unwrap(), 6);

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines[1], "sample,2024-03-09 19:45:02,42,3,0,61.5,204.0,");
    assert_eq!(lines[5], "sample,2024-03-09 19:45:10,42,3,4,61.5,204.0,");
    assert_eq!(lines[6], "heartbeat,2024-03-09 19:45:10,1,,,,,ok");
}

#[test]
fn test_stop_signal_ends_paced_replay() {
    let mut bytes = Vec::new();
    for seq in 0..=255u8 {
        bytes.extend(encode_readings(seq, 0, &[(0, 0); 5]));
    }
    let options = ReaderOptions {
        read_chunk: 24,
        ..ReaderOptions::default()
    };
    let transport =
        ReplayTransport::from_reader(Cursor::new(bytes), "memory").paced(Duration::from_millis(2));
    let handle = GatewayReader::new(transport, options, SampleChannel::default(), StopSignal::new())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(40));
    handle.stop();
    let stats = handle.join().unwrap();
    assert!(stats.packets_decoded < 256);
}
