//! Per-session audio track
//!
//! A [`ConsumerTrack`] is pulled by its transport once per frame. It
//! subscribes lazily to its channel's broadcaster, applies the listener's
//! stereo routing and pan, and stamps every frame with a sample-count
//! timestamp that keeps counting across channel switches.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::audio::frame::{clamp_sample_rate, frame_duration, SAMPLE_WIDTH};
use crate::audio::transform::{apply_pan, apply_stereo_mode, normalize_pan};
use crate::audio::{PcmFrame, StereoMode, SubscriberQueue};
use crate::error::RelayError;
use crate::rtc::FrameSource;

/// Where tracks get their subscriptions from.
///
/// `subscribe` counts a new listener on the channel; `unsubscribe` must
/// release exactly the listener a matching `subscribe` added.
pub trait ChannelHub: Send + Sync {
    fn subscribe(&self, channel_id: &str) -> Result<Arc<SubscriberQueue>, RelayError>;

    fn unsubscribe(&self, channel_id: &str, queue: &SubscriberQueue);
}

struct Subscription {
    channel_id: String,
    queue: Arc<SubscriberQueue>,
}

/// Pull-based audio track for one listener
pub struct ConsumerTrack {
    hub: Weak<dyn ChannelHub>,
    sample_rate: u32,
    channel_id: Mutex<Option<String>>,
    subscription: Mutex<Option<Subscription>>,
    /// f32 bits
    pan: AtomicU32,
    stereo_mode: AtomicU8,
    samples_sent: AtomicU64,
    frames: AtomicU64,
    silence_frames: AtomicU64,
    subscriptions: AtomicU64,
    closed: AtomicBool,
}

impl ConsumerTrack {
    pub fn new(hub: Weak<dyn ChannelHub>, sample_rate: u32, channel_id: Option<String>) -> Self {
        Self {
            hub,
            sample_rate: clamp_sample_rate(sample_rate),
            channel_id: Mutex::new(channel_id.filter(|c| !c.is_empty())),
            subscription: Mutex::new(None),
            pan: AtomicU32::new(0f32.to_bits()),
            stereo_mode: AtomicU8::new(StereoMode::Both.to_u8()),
            samples_sent: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Produce the next frame.
    ///
    /// Waits for audio from the assigned channel, or paces out silence
    /// when there is nothing to listen to.
    pub async fn next_frame(&self) -> PcmFrame {
        loop {
            let Some(queue) = self.current_queue() else {
                tokio::time::sleep(frame_duration()).await;
                return self.emit_silence();
            };

            match queue.recv().await {
                Some(chunk) => return self.emit(chunk),
                // Reassigned while waiting
                None => self.drop_stale(&queue),
            }
        }
    }

    /// Switch to another channel, or to none.
    ///
    /// The old subscription is released at once; the new one is taken on
    /// the next pull.
    pub fn set_channel(&self, channel_id: Option<String>) {
        let channel_id = channel_id.filter(|c| !c.is_empty());
        {
            let mut current = self.channel_id.lock();
            if *current == channel_id {
                return;
            }
            *current = channel_id;
        }
        self.release();
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.store(normalize_pan(pan).to_bits(), Ordering::Relaxed);
    }

    pub fn pan(&self) -> f32 {
        f32::from_bits(self.pan.load(Ordering::Relaxed))
    }

    pub fn set_stereo_mode(&self, mode: StereoMode) {
        self.stereo_mode.store(mode.to_u8(), Ordering::Relaxed);
    }

    pub fn stereo_mode(&self) -> StereoMode {
        StereoMode::from_u8(self.stereo_mode.load(Ordering::Relaxed))
    }

    pub fn channel_id(&self) -> Option<String> {
        self.channel_id.lock().clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Release the subscription for good. Later pulls yield silence.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.release();
    }

    pub fn stats(&self) -> TrackStats {
        let (queued, dropped) = match self.subscription.lock().as_ref() {
            Some(sub) => (sub.queue.len(), sub.queue.dropped()),
            None => (0, 0),
        };
        TrackStats {
            channel_id: self.channel_id(),
            pan: self.pan(),
            stereo_mode: self.stereo_mode(),
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            queued,
            dropped,
        }
    }

    /// Subscription for the assigned channel, taking one if needed
    fn current_queue(&self) -> Option<Arc<SubscriberQueue>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let channel_id = self.channel_id.lock().clone()?;

        let mut subscription = self.subscription.lock();
        if let Some(sub) = subscription.as_ref() {
            if sub.channel_id == channel_id && !sub.queue.is_ended() {
                return Some(sub.queue.clone());
            }
        }

        let hub = self.hub.upgrade()?;
        match hub.subscribe(&channel_id) {
            Ok(queue) => {
                if let Some(stale) = subscription.replace(Subscription {
                    channel_id: channel_id.clone(),
                    queue: queue.clone(),
                }) {
                    hub.unsubscribe(&stale.channel_id, &stale.queue);
                    stale.queue.end();
                }
                self.subscriptions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel = %channel_id, queue = queue.id(), "Track subscribed");
                Some(queue)
            }
            Err(e) => {
                tracing::debug!(channel = %channel_id, "No audio for track: {}", e);
                None
            }
        }
    }

    /// Forget `queue` if it is still the current subscription
    fn drop_stale(&self, queue: &SubscriberQueue) {
        let stale = {
            let mut subscription = self.subscription.lock();
            match subscription.as_ref() {
                Some(sub) if sub.queue.id() == queue.id() => subscription.take(),
                _ => None,
            }
        };
        if let (Some(stale), Some(hub)) = (stale, self.hub.upgrade()) {
            hub.unsubscribe(&stale.channel_id, &stale.queue);
        }
    }

    /// Unsubscribe and wake any pull waiting on the old queue
    fn release(&self) {
        let Some(sub) = self.subscription.lock().take() else {
            return;
        };
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&sub.channel_id, &sub.queue);
        }
        sub.queue.end();
    }

    fn emit(&self, chunk: Bytes) -> PcmFrame {
        let chunk = apply_stereo_mode(chunk, self.stereo_mode());
        let chunk = apply_pan(chunk, self.pan());
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.stamp(chunk)
    }

    fn emit_silence(&self) -> PcmFrame {
        self.silence_frames.fetch_add(1, Ordering::Relaxed);
        let frame = PcmFrame::silence(self.sample_rate, 0);
        self.stamp(frame.data)
    }

    fn stamp(&self, data: Bytes) -> PcmFrame {
        let samples = (data.len() / SAMPLE_WIDTH) as u64;
        let pts = self.samples_sent.fetch_add(samples, Ordering::SeqCst);
        PcmFrame::new(data, pts, self.sample_rate)
    }
}

impl Drop for ConsumerTrack {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl FrameSource for ConsumerTrack {
    async fn next_frame(&self) -> PcmFrame {
        ConsumerTrack::next_frame(self).await
    }
}

/// Track counters
#[derive(Debug, Clone, Serialize)]
pub struct TrackStats {
    pub channel_id: Option<String>,
    pub pan: f32,
    pub stereo_mode: StereoMode,
    pub samples_sent: u64,
    pub frames: u64,
    pub silence_frames: u64,
    pub subscriptions: u64,
    pub queued: usize,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{encode_samples, frame_bytes, frame_samples};
    use crate::audio::Broadcaster;
    use std::collections::HashMap;
    use std::time::Duration;

    /// In-memory hub keeping a plain listener count per channel
    #[derive(Default)]
    struct FakeHub {
        channels: Mutex<HashMap<String, Arc<Broadcaster>>>,
        listeners: Mutex<HashMap<String, i64>>,
    }

    impl FakeHub {
        fn with_channels(ids: &[&str]) -> Arc<Self> {
            let hub = Self::default();
            for id in ids {
                hub.channels.lock().insert(id.to_string(), Arc::new(Broadcaster::new(50)));
            }
            Arc::new(hub)
        }

        fn broadcaster(&self, id: &str) -> Arc<Broadcaster> {
            self.channels.lock()[id].clone()
        }

        fn listeners(&self, id: &str) -> i64 {
            self.listeners.lock().get(id).copied().unwrap_or(0)
        }
    }

    impl ChannelHub for FakeHub {
        fn subscribe(&self, channel_id: &str) -> Result<Arc<SubscriberQueue>, RelayError> {
            let broadcaster = self
                .channels
                .lock()
                .get(channel_id)
                .cloned()
                .ok_or_else(|| RelayError::ChannelNotInitialized(channel_id.to_string()))?;
            *self.listeners.lock().entry(channel_id.to_string()).or_default() += 1;
            Ok(broadcaster.subscribe())
        }

        fn unsubscribe(&self, channel_id: &str, queue: &SubscriberQueue) {
            if let Some(broadcaster) = self.channels.lock().get(channel_id) {
                if broadcaster.unsubscribe(queue) {
                    *self.listeners.lock().entry(channel_id.to_string()).or_default() -= 1;
                }
            }
        }
    }

    fn track(hub: &Arc<FakeHub>, channel: Option<&str>) -> Arc<ConsumerTrack> {
        let weak: Weak<FakeHub> = Arc::downgrade(hub);
        Arc::new(ConsumerTrack::new(weak, 48000, channel.map(String::from)))
    }

    fn frame_of(left: i16, right: i16) -> Bytes {
        let samples: Vec<i16> = (0..frame_samples(48000)).flat_map(|_| [left, right]).collect();
        encode_samples(&samples)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Pull one frame while publishing `chunk` to `channel` once subscribed
    async fn pull_published(
        track: &Arc<ConsumerTrack>,
        hub: &Arc<FakeHub>,
        channel: &str,
        chunk: Bytes,
    ) -> PcmFrame {
        let pull = tokio::spawn({
            let track = track.clone();
            async move { track.next_frame().await }
        });
        let broadcaster = hub.broadcaster(channel);
        wait_for(|| broadcaster.subscriber_count() == 1).await;
        broadcaster.publish(chunk);
        pull.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unassigned_track_paces_silence() {
        let hub = FakeHub::with_channels(&[]);
        let track = track(&hub, None);

        let start = tokio::time::Instant::now();
        let first = track.next_frame().await;
        let second = track.next_frame().await;

        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(first.data.len(), frame_bytes(48000));
        assert!(first.data.iter().all(|&b| b == 0));
        assert_eq!(first.pts, 0);
        assert_eq!(second.pts, 960);
        assert_eq!(track.stats().silence_frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_channel_yields_silence() {
        let hub = FakeHub::with_channels(&[]);
        let track = track(&hub, Some("gone"));
        let frame = track.next_frame().await;
        assert!(frame.data.iter().all(|&b| b == 0));
        assert_eq!(hub.listeners("gone"), 0);
    }

    #[tokio::test]
    async fn test_transforms_applied_in_order() {
        let hub = FakeHub::with_channels(&["ch1"]);
        let track = track(&hub, Some("ch1"));
        track.set_stereo_mode(StereoMode::Right);
        track.set_pan(-1.0);

        let frame = pull_published(&track, &hub, "ch1", frame_of(1000, -2000)).await;
        let samples = frame.to_samples();
        // Right copied to left, then panned hard left
        assert_eq!(samples[0], -2000);
        assert_eq!(samples[1], 0);
        assert_eq!(hub.listeners("ch1"), 1);
    }

    #[tokio::test]
    async fn test_reassignment_keeps_timeline() {
        let hub = FakeHub::with_channels(&["ch1", "ch2"]);
        let track = track(&hub, Some("ch1"));

        let first = pull_published(&track, &hub, "ch1", frame_of(1, 1)).await;
        track.set_channel(Some("ch2".into()));
        assert_eq!(hub.listeners("ch1"), 0);

        let second = pull_published(&track, &hub, "ch2", frame_of(2, 2)).await;
        assert_eq!(first.pts, 0);
        assert_eq!(second.pts, 960);
        assert_eq!(second.to_samples()[0], 2);
        assert_eq!(hub.listeners("ch2"), 1);
        assert_eq!(track.stats().subscriptions, 2);
    }

    #[tokio::test]
    async fn test_switch_wakes_pending_pull() {
        let hub = FakeHub::with_channels(&["ch1", "ch2"]);
        let track = track(&hub, Some("ch1"));

        let pull = tokio::spawn({
            let track = track.clone();
            async move { track.next_frame().await }
        });
        let ch1 = hub.broadcaster("ch1");
        wait_for(|| ch1.subscriber_count() == 1).await;

        track.set_channel(Some("ch2".into()));
        let ch2 = hub.broadcaster("ch2");
        wait_for(|| ch2.subscriber_count() == 1).await;
        ch1.publish(frame_of(1, 1));
        ch2.publish(frame_of(2, 2));

        let frame = pull.await.unwrap();
        assert_eq!(frame.to_samples()[0], 2);
        assert_eq!(hub.listeners("ch1"), 0);
        assert_eq!(hub.listeners("ch2"), 1);
    }

    #[tokio::test]
    async fn test_same_channel_is_noop() {
        let hub = FakeHub::with_channels(&["ch1"]);
        let track = track(&hub, Some("ch1"));
        pull_published(&track, &hub, "ch1", frame_of(1, 1)).await;

        track.set_channel(Some("ch1".into()));
        assert_eq!(hub.listeners("ch1"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_once() {
        let hub = FakeHub::with_channels(&["ch1"]);
        let track = track(&hub, Some("ch1"));
        pull_published(&track, &hub, "ch1", frame_of(1, 1)).await;

        track.shutdown();
        track.shutdown();
        assert_eq!(hub.listeners("ch1"), 0);
        assert_eq!(hub.broadcaster("ch1").subscriber_count(), 0);
    }

    #[test]
    fn test_pan_is_clamped() {
        let hub = FakeHub::with_channels(&[]);
        let track = track(&hub, None);
        track.set_pan(3.0);
        assert_eq!(track.pan(), 1.0);
        track.set_pan(f32::NAN);
        assert_eq!(track.pan(), 0.0);
    }
}
