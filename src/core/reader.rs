//! Gateway reader loop
//!
//! One dedicated thread owns the transport, the byte buffer and the loss
//! counters. It pulls bytes, extracts frames, decodes them and publishes
//! records to the [`SampleChannel`]. Framing and decode problems are logged
//! and skipped; only a transport that keeps failing past the retry budget
//! ends the loop with an error.

use crate::core::channel::{Heartbeat, Record, SampleChannel};
use crate::core::loss::{LossMonitor, LossTracker};
use crate::core::protocol::{
    AssemblerStats, DecoderConfig, Packet, PacketDecoder, Payload, StreamAssembler,
    DEFAULT_MAX_FRAME_LEN,
};
use crate::core::stop::StopSignal;
use crate::core::timeline::{TimeReconstructor, DEFAULT_SAMPLE_INTERVAL};
use crate::core::transport::{RetryPolicy, Transport, TransportError};
use chrono::{DateTime, Local};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Fatal reader errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport kept failing after every retry
    #[error("Transport failed after {attempts} attempts: {source}")]
    TransportExhausted {
        /// Consecutive failed reads
        attempts: u32,
        /// Last transport error
        #[source]
        source: TransportError,
    },

    /// Reader thread could not be started
    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reader thread panicked
    #[error("Reader thread panicked")]
    Panicked,
}

/// Reader loop settings
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Largest single transport read
    pub read_chunk: usize,
    /// Transport read timeout
    pub read_timeout: Duration,
    /// Frame length cap for the assembler
    pub max_frame_len: usize,
    /// Transport retry policy
    pub retry: RetryPolicy,
    /// Decoder settings
    pub decoder: DecoderConfig,
    /// Spacing between readings of one batch
    pub sample_interval: Duration,
    /// Truncate arrival times to whole seconds
    pub round_timestamps: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            read_timeout: Duration::from_millis(100),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            retry: RetryPolicy::default(),
            decoder: DecoderConfig::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            round_timestamps: true,
        }
    }
}

/// Reader counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Bytes pulled from the transport
    pub bytes_read: u64,
    /// Packets decoded successfully
    pub packets_decoded: u64,
    /// Frame bodies the decoder rejected
    pub decode_errors: u64,
    /// Packets recovered from a frame nested after a truncated one
    pub resyncs: u64,
    /// Heartbeats seen
    pub heartbeats: u64,
    /// Samples handed to the channel
    pub samples_published: u64,
    /// Records dropped by the channel
    pub records_dropped: u64,
    /// Failed transport reads
    pub transport_errors: u64,
    /// Framing counters
    pub framing: AssemblerStats,
}

type Clock = Box<dyn Fn() -> DateTime<Local> + Send>;

/// The ingestion loop
pub struct GatewayReader<T> {
    transport: T,
    options: ReaderOptions,
    assembler: StreamAssembler,
    decoder: PacketDecoder,
    tracker: LossTracker,
    reconstructor: TimeReconstructor,
    channel: SampleChannel,
    stop: StopSignal,
    clock: Clock,
    stats: ReaderStats,
}

impl<T: Transport> GatewayReader<T> {
    /// Build a reader publishing into `channel`
    pub fn new(transport: T, options: ReaderOptions, channel: SampleChannel, stop: StopSignal) -> Self {
        Self {
            assembler: StreamAssembler::new(options.max_frame_len),
            decoder: PacketDecoder::new(options.decoder.clone()),
            reconstructor: TimeReconstructor::new(options.sample_interval)
                .round_to_second(options.round_timestamps),
            tracker: LossTracker::new(),
            transport,
            options,
            channel,
            stop,
            clock: Box::new(Local::now),
            stats: ReaderStats::default(),
        }
    }

    /// Replace the arrival clock
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Local> + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Handle for reading loss counters from other threads
    pub fn loss_monitor(&self) -> LossMonitor {
        self.tracker.monitor()
    }

    /// Stop signal observed by the loop
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until stopped, end of stream, or transport exhaustion
    pub fn run(mut self) -> Result<ReaderStats, GatewayError> {
        info!(transport = %self.transport.describe(), "Gateway reader started");

        let outcome = self.read_loop();

        if let Err(e) = self.transport.close() {
            warn!(error = %e, "Failed to close transport");
        }
        self.channel.close();

        self.stats.framing = self.assembler.stats();
        info!(
            packets = self.stats.packets_decoded,
            decode_errors = self.stats.decode_errors,
            heartbeats = self.stats.heartbeats,
            samples = self.stats.samples_published,
            dropped = self.stats.records_dropped,
            received = self.tracker.received_count(),
            missing = self.tracker.missing_count(),
            "Gateway reader stopped"
        );

        outcome.map(|()| self.stats)
    }

    /// Run on a dedicated named thread
    pub fn spawn(self) -> Result<ReaderHandle, GatewayError>
    where
        T: 'static,
    {
        let stop = self.stop.clone();
        let monitor = self.loss_monitor();
        let handle = thread::Builder::new()
            .name("gateway-reader".into())
            .spawn(move || self.run())
            .map_err(GatewayError::Spawn)?;
        Ok(ReaderHandle {
            handle,
            stop,
            monitor,
        })
    }

    fn read_loop(&mut self) -> Result<(), GatewayError> {
        let mut failures = 0u32;

        loop {
            if self.stop.is_stopped() {
                info!("Stop requested");
                return Ok(());
            }

            match self
                .transport
                .read(self.options.read_chunk, self.options.read_timeout)
            {
                Ok(bytes) => {
                    failures = 0;
                    if !bytes.is_empty() {
                        self.stats.bytes_read += bytes.len() as u64;
                        self.assembler.feed(&bytes);
                        self.drain_frames();
                    }
                }
                Err(TransportError::EndOfStream) => {
                    info!("Transport reached end of stream");
                    self.drain_frames();
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    self.stats.transport_errors += 1;

                    if !self.options.retry.should_retry(failures) {
                        error!(attempts = failures, error = %err, "Transport retries exhausted");
                        return Err(GatewayError::TransportExhausted {
                            attempts: failures,
                            source: err,
                        });
                    }

                    let delay = self.options.retry.delay_for_attempt(failures - 1);
                    warn!(
                        attempt = failures,
                        max = self.options.retry.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transport read failed, retrying"
                    );
                    if self.stop.sleep(delay) {
                        return Ok(());
                    }
                    if let Err(e) = self.transport.reconnect() {
                        warn!(error = %e, "Reconnect failed");
                    }
                }
            }
        }
    }

    fn drain_frames(&mut self) {
        while !self.stop.is_stopped() {
            let Some(body) = self.assembler.try_extract_packet() else {
                return;
            };
            let arrived = (self.clock)();
            match self.decoder.decode_frame(&body) {
                Ok(decoded) => {
                    if decoded.skipped > 0 {
                        self.stats.resyncs += 1;
                        debug!(skipped = decoded.skipped, "Resynchronized on nested start marker");
                    }
                    self.stats.packets_decoded += 1;
                    self.dispatch(decoded.packet, arrived);
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(error = %e, len = body.len(), "Dropping undecodable packet");
                }
            }
        }
        debug!(buffered = self.assembler.buffered(), "Stop requested, leaving frames unread");
    }

    fn dispatch(&mut self, packet: Packet, arrived: DateTime<Local>) {
        match &packet.payload {
            Payload::Heartbeat(text) => {
                self.stats.heartbeats += 1;
                info!(sequence_id = packet.sequence_id, text = %text, "Heartbeat");
                let record = Record::Heartbeat(Heartbeat {
                    timestamp: self.reconstructor.normalize(arrived),
                    sequence_id: packet.sequence_id,
                    text: text.clone(),
                });
                self.publish(record);
            }
            Payload::Readings(_) => {
                let gap = self
                    .tracker
                    .record_at(packet.sensor_id, packet.sequence_id, arrived);
                if gap > 0 {
                    warn!(
                        sensor_id = packet.sensor_id,
                        sequence_id = packet.sequence_id,
                        gap,
                        "Packets missing"
                    );
                }
                debug!(
                    sensor_id = packet.sensor_id,
                    sequence_id = packet.sequence_id,
                    "Readings packet"
                );

                for sample in self.reconstructor.reconstruct(arrived, &packet) {
                    self.stats.samples_published += 1;
                    self.publish(Record::Sample(sample));
                }
            }
        }
    }

    fn publish(&mut self, record: Record) {
        let outcome = self.channel.publish(record, &self.stop);
        self.stats.records_dropped += outcome.dropped as u64;
    }
}

/// Handle to a reader running on its own thread
pub struct ReaderHandle {
    handle: JoinHandle<Result<ReaderStats, GatewayError>>,
    stop: StopSignal,
    monitor: LossMonitor,
}

impl ReaderHandle {
    /// Loss counters of the running reader
    pub fn loss_monitor(&self) -> &LossMonitor {
        &self.monitor
    }

    /// Ask the reader to stop
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    /// Has the reader thread exited?
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the reader to finish
    pub fn join(self) -> Result<ReaderStats, GatewayError> {
        self.handle.join().map_err(|_| GatewayError::Panicked)?
    }
}
