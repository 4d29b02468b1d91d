//! One mixer channel as seen by the relay: a pump, its broadcaster and a
//! listener count

use std::sync::Arc;

use crate::audio::{Broadcaster, SubscriberQueue};
use crate::pump::SourcePump;

/// Live source for one channel id.
///
/// Owned by the relay state; every field is only touched with the relay
/// lock held.
pub struct ChannelSource {
    channel_id: String,
    stream_id: String,
    broadcaster: Arc<Broadcaster>,
    pump: Arc<SourcePump>,
    ref_count: usize,
}

impl ChannelSource {
    pub fn new(channel_id: impl Into<String>, stream_id: impl Into<String>, pump: Arc<SourcePump>) -> Self {
        Self {
            channel_id: channel_id.into(),
            stream_id: stream_id.into(),
            broadcaster: pump.broadcaster().clone(),
            pump,
            ref_count: 0,
        }
    }

    /// Count a new listener and hand it a queue
    pub fn acquire(&mut self) -> Arc<SubscriberQueue> {
        self.ref_count += 1;
        self.broadcaster.subscribe()
    }

    /// Release a listener's queue.
    ///
    /// Only queues that were still subscribed count, so releasing the same
    /// queue twice is harmless. Returns true when the channel has just lost
    /// its last listener.
    pub fn release(&mut self, queue: &SubscriberQueue) -> bool {
        if !self.broadcaster.unsubscribe(queue) {
            return false;
        }
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }

    /// Record a new upstream stream id.
    ///
    /// Returns true if the pump must be pointed at it.
    pub fn retarget(&mut self, stream_id: &str) -> bool {
        if stream_id.is_empty() || stream_id == self.stream_id {
            return false;
        }
        self.stream_id = stream_id.to_string();
        true
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn listeners(&self) -> usize {
        self.ref_count
    }

    pub fn is_idle(&self) -> bool {
        self.ref_count == 0
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn pump(&self) -> &Arc<SourcePump> {
        &self.pump
    }
}
