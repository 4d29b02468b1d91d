//! Fan-out of PCM frames to independent consumers
//!
//! Every subscriber owns a fixed-capacity lock-free queue. Publishing
//! never waits: when a queue is full its oldest frame is dropped to make
//! room, so a slow consumer loses audio instead of adding latency or
//! stalling the producer.

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

use crate::audio::frame::{decode_samples, AudioChunk};

/// Bounded single-consumer queue handed out by [`Broadcaster::subscribe`]
pub struct SubscriberQueue {
    id: u64,
    queue: ArrayQueue<AudioChunk>,
    notify: Notify,
    ended: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
            ended: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a frame, evicting the oldest one if full.
    /// Returns true if a frame was evicted.
    fn push(&self, chunk: AudioChunk) -> bool {
        let overflowed = self.queue.force_push(chunk).is_some();
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        overflowed
    }

    /// Wait for the next frame.
    ///
    /// Returns `None` once the subscription has been ended; frames still
    /// queued at that point belong to the old subscription and are skipped.
    pub async fn recv(&self) -> Option<AudioChunk> {
        loop {
            if self.ended.load(Ordering::Acquire) {
                return None;
            }
            if let Some(chunk) = self.queue.pop() {
                return Some(chunk);
            }
            self.notify.notified().await;
        }
    }

    /// Pop without waiting
    pub fn try_recv(&self) -> Option<AudioChunk> {
        if self.ended.load(Ordering::Acquire) {
            return None;
        }
        self.queue.pop()
    }

    /// Signal the consumer that this subscription is over
    pub fn end(&self) {
        self.ended.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames evicted from this queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SubscriberQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberQueue")
            .field("id", &self.id)
            .field("len", &self.queue.len())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Level measurements of the most recent frame
#[derive(Debug, Clone, Copy, Default)]
struct Levels {
    peak: f32,
    rms: f32,
    channel_diff: f32,
}

/// PCM fan-out for one channel
pub struct Broadcaster {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
    next_id: AtomicU64,
    capacity: usize,
    chunks: AtomicU64,
    bytes: AtomicU64,
    overflows: AtomicU64,
    created_at: Instant,
    last_publish: Mutex<Option<DateTime<Utc>>>,
    levels: Mutex<Levels>,
}

impl Broadcaster {
    /// Create a broadcaster whose subscriber queues hold `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            created_at: Instant::now(),
            last_publish: Mutex::new(None),
            levels: Mutex::new(Levels::default()),
        }
    }

    pub fn subscribe(&self) -> Arc<SubscriberQueue> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.capacity));
        self.subscribers.insert(id, queue.clone());
        tracing::debug!(subscriber = id, "Subscriber added");
        queue
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, queue: &SubscriberQueue) -> bool {
        let removed = self.subscribers.remove(&queue.id()).is_some();
        if removed {
            tracing::debug!(subscriber = queue.id(), "Subscriber removed");
        }
        removed
    }

    /// Deliver one frame to every subscriber without blocking
    pub fn publish(&self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }

        for entry in self.subscribers.iter() {
            if entry.value().push(chunk.clone()) {
                self.overflows.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        *self.last_publish.lock() = Some(Utc::now());
        *self.levels.lock() = measure_levels(&chunk);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters, with derived rates computed now
    pub fn stats(&self) -> BroadcastStats {
        let total_bytes = self.bytes.load(Ordering::Relaxed);
        let uptime = self.created_at.elapsed().as_secs_f64();
        let levels = *self.levels.lock();
        BroadcastStats {
            subscribers: self.subscribers.len(),
            total_chunks: self.chunks.load(Ordering::Relaxed),
            total_bytes,
            overflows: self.overflows.load(Ordering::Relaxed),
            last_publish_at: *self.last_publish.lock(),
            uptime_secs: uptime,
            average_kbps: if uptime > 0.0 {
                total_bytes as f64 * 8.0 / 1000.0 / uptime
            } else {
                0.0
            },
            peak: levels.peak,
            rms: levels.rms,
            channel_diff: levels.channel_diff,
        }
    }
}

/// Broadcaster statistics
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub overflows: u64,
    pub last_publish_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub average_kbps: f64,
    /// Peak absolute amplitude of the last frame, 0..1
    pub peak: f32,
    /// RMS of the last frame, 0..1
    pub rms: f32,
    /// Mean absolute left/right difference of the last frame, 0..1
    pub channel_diff: f32,
}

fn measure_levels(chunk: &[u8]) -> Levels {
    let samples = decode_samples(chunk);
    if samples.is_empty() {
        return Levels::default();
    }

    let mut peak = 0i32;
    let mut sum_sq = 0f64;
    for &s in &samples {
        peak = peak.max((s as i32).abs());
        sum_sq += (s as f64) * (s as f64);
    }

    let mut diff_sum = 0f64;
    let pairs = samples.chunks_exact(2);
    let pair_count = pairs.len();
    for pair in pairs {
        diff_sum += ((pair[0] as i32) - (pair[1] as i32)).abs() as f64;
    }

    let full_scale = 32768.0;
    Levels {
        peak: (peak as f64 / full_scale) as f32,
        rms: ((sum_sq / samples.len() as f64).sqrt() / full_scale) as f32,
        channel_diff: if pair_count > 0 {
            (diff_sum / pair_count as f64 / full_scale) as f32
        } else {
            0.0
        },
    }
}
