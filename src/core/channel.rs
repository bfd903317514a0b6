//! Hand-off between the reader thread and its consumers
//!
//! [`SampleChannel`] is a fan-out hub: each subscriber owns a bounded queue
//! and sees every [`Record`]. A slow subscriber never starves the others,
//! but under [`BackpressurePolicy::Block`] it does stall the producer.

use crate::core::stop::StopSignal;
use crate::core::timeline::Sample;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default per-subscriber queue capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default slice for blocking sends
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Gateway status line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Arrival time
    pub timestamp: DateTime<Local>,
    /// Sequence id of the heartbeat packet
    pub sequence_id: u8,
    /// Status text
    pub text: String,
}

/// Item delivered to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// One reconstructed reading
    Sample(Sample),
    /// Gateway status
    Heartbeat(Heartbeat),
}

/// What to do when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Producer waits for room; records are only dropped once a stop is requested
    #[default]
    Block,
    /// Evict the oldest queued record to make room
    DropOldest,
}

/// Channel settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Per-subscriber queue capacity
    pub capacity: usize,
    /// Full-queue policy
    pub policy: BackpressurePolicy,
    /// Slice for blocking sends between stop checks
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: BackpressurePolicy::Block,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Result of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Published {
    /// Subscribers that accepted the record
    pub delivered: usize,
    /// Records dropped (evicted or abandoned) while publishing
    pub dropped: usize,
}

#[derive(Clone)]
struct Subscriber {
    name: Arc<str>,
    tx: Sender<Record>,
    // Only kept under DropOldest, to evict from the front of the queue.
    evict: Option<Receiver<Record>>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Hub {
    subscribers: RwLock<Vec<Subscriber>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Bounded fan-out channel
#[derive(Clone)]
pub struct SampleChannel {
    config: ChannelConfig,
    hub: Arc<Hub>,
}

impl Default for SampleChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl SampleChannel {
    /// Create a channel with no subscribers
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config: ChannelConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            hub: Arc::new(Hub::default()),
        }
    }

    /// Channel settings
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Add a consumer; it receives every record published from now on
    pub fn subscribe(&self, name: &str) -> SampleStream {
        let (tx, rx) = crossbeam_channel::bounded(self.config.capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let mut subscribers = self.hub.subscribers.write();
        if self.hub.closed.load(Ordering::Acquire) {
            debug!(subscriber = name, "Subscribed to closed channel");
        } else {
            subscribers.push(Subscriber {
                name: Arc::from(name),
                tx,
                evict: (self.config.policy == BackpressurePolicy::DropOldest).then(|| rx.clone()),
                closed: Arc::clone(&closed),
            });
        }

        SampleStream {
            name: name.to_string(),
            rx,
            closed,
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscribers.read().len()
    }

    /// Records dropped since creation
    pub fn dropped(&self) -> u64 {
        self.hub.dropped.load(Ordering::Relaxed)
    }

    /// Is the channel closed?
    pub fn is_closed(&self) -> bool {
        self.hub.closed.load(Ordering::Acquire)
    }

    /// Deliver a record to every subscriber according to the policy
    pub fn publish(&self, record: Record, stop: &StopSignal) -> Published {
        let subscribers = self.hub.subscribers.read().clone();
        let mut outcome = Published::default();
        let mut gone = false;

        for sub in &subscribers {
            if sub.closed.load(Ordering::Acquire) {
                gone = true;
                continue;
            }
            let result = match &sub.evict {
                Some(evict) => Self::send_evicting(sub, evict, record.clone()),
                None => self.send_blocking(sub, record.clone(), stop),
            };
            match result {
                Delivery::Sent { evicted } => {
                    outcome.delivered += 1;
                    outcome.dropped += evicted;
                }
                Delivery::Abandoned => outcome.dropped += 1,
                Delivery::Disconnected => gone = true,
            }
        }

        if outcome.dropped > 0 {
            self.hub
                .dropped
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }
        if gone {
            self.prune();
        }
        outcome
    }

    fn send_blocking(&self, sub: &Subscriber, mut record: Record, stop: &StopSignal) -> Delivery {
        loop {
            if stop.is_stopped() {
                return match sub.tx.try_send(record) {
                    Ok(()) => Delivery::Sent { evicted: 0 },
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = %sub.name, "Dropping record: consumer stalled during shutdown");
                        Delivery::Abandoned
                    }
                    Err(TrySendError::Disconnected(_)) => Delivery::Disconnected,
                };
            }
            match sub.tx.send_timeout(record, self.config.send_timeout) {
                Ok(()) => return Delivery::Sent { evicted: 0 },
                Err(SendTimeoutError::Timeout(back)) => {
                    if sub.closed.load(Ordering::Acquire) {
                        return Delivery::Disconnected;
                    }
                    record = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Delivery::Disconnected,
            }
        }
    }

    fn send_evicting(sub: &Subscriber, evict: &Receiver<Record>, mut record: Record) -> Delivery {
        let mut evicted = 0;
        loop {
            match sub.tx.try_send(record) {
                Ok(()) => return Delivery::Sent { evicted },
                Err(TrySendError::Full(back)) => {
                    if evict.try_recv().is_ok() {
                        evicted += 1;
                        warn!(subscriber = %sub.name, "Queue full, dropped oldest record");
                    }
                    record = back;
                }
                Err(TrySendError::Disconnected(_)) => return Delivery::Disconnected,
            }
        }
    }

    fn prune(&self) {
        let mut subscribers = self.hub.subscribers.write();
        subscribers.retain(|sub| {
            let keep = !sub.closed.load(Ordering::Acquire);
            if !keep {
                debug!(subscriber = %sub.name, "Subscriber left");
            }
            keep
        });
    }

    /// Disconnect every subscriber; queued records stay readable
    pub fn close(&self) {
        self.hub.closed.store(true, Ordering::Release);
        let mut subscribers = self.hub.subscribers.write();
        debug!(subscribers = subscribers.len(), "Closing sample channel");
        subscribers.clear();
    }
}

enum Delivery {
    Sent { evicted: usize },
    Abandoned,
    Disconnected,
}

/// Consumer end of a subscription
pub struct SampleStream {
    name: String,
    rx: Receiver<Record>,
    closed: Arc<AtomicBool>,
}

impl SampleStream {
    /// Subscriber name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a record arrives; `None` once the channel is closed and drained
    pub fn recv(&self) -> Option<Record> {
        self.rx.recv().ok()
    }

    /// Wait at most `timeout` for a record
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Record, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Take a record if one is queued
    pub fn try_recv(&self) -> Option<Record> {
        self.rx.try_recv().ok()
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocking iterator over records until the channel closes
    pub fn iter(&self) -> impl Iterator<Item = Record> + '_ {
        self.rx.iter()
    }

    /// Blocking iterator over samples only, skipping heartbeats
    pub fn samples(self) -> Samples {
        Samples { stream: self }
    }
}

/// Iterator returned by [`SampleStream::samples`]
pub struct Samples {
    stream: SampleStream,
}

impl Iterator for Samples {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        loop {
            match self.stream.recv()? {
                Record::Sample(sample) => return Some(sample),
                Record::Heartbeat(_) => continue,
            }
        }
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
