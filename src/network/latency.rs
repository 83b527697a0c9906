//! Round-trip latency measurement over ping/pong messages

use std::collections::VecDeque;
use std::time::Instant;

use tracing::trace;

use crate::protocol::SyncMessage;

/// Number of RTT samples to keep for averaging
const RTT_SAMPLE_COUNT: usize = 10;

/// Smoothed RTT and jitter estimate
#[derive(Debug)]
pub struct LatencyTracker {
    /// Current smoothed RTT estimate (ms)
    rtt_ms: f32,
    /// RTT jitter / variation (ms)
    jitter_ms: f32,
    /// Recent RTT samples for averaging
    rtt_samples: VecDeque<f32>,
    /// Monotonic time reference for timestamps
    time_reference: Instant,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self {
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_COUNT),
            time_reference: Instant::now(),
        }
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since this tracker was created
    pub fn now_ms(&self) -> u64 {
        self.time_reference.elapsed().as_millis() as u64
    }

    /// Build a ping stamped with the current time
    pub fn create_ping(&self) -> SyncMessage {
        SyncMessage::Ping {
            sent_at_ms: self.now_ms(),
        }
    }

    /// Process the echo of one of our pings
    pub fn process_pong(&mut self, sent_at_ms: u64) {
        let now = self.now_ms();
        if sent_at_ms > now {
            // Not one of ours
            return;
        }
        self.record_sample((now - sent_at_ms) as f32);
    }

    fn record_sample(&mut self, rtt: f32) {
        if self.rtt_samples.len() >= RTT_SAMPLE_COUNT {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);

        // Standard TCP-like smoothing factor
        let alpha = 0.125;
        if self.rtt_ms == 0.0 {
            self.rtt_ms = rtt;
        } else {
            self.rtt_ms = (1.0 - alpha) * self.rtt_ms + alpha * rtt;
        }

        let beta = 0.25;
        let diff = (rtt - self.rtt_ms).abs();
        self.jitter_ms = (1.0 - beta) * self.jitter_ms + beta * diff;

        trace!(
            "RTT updated: rtt={:.2}ms, jitter={:.2}ms (sample={:.2}ms)",
            self.rtt_ms,
            self.jitter_ms,
            rtt
        );
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    /// Plain average over the retained samples
    pub fn average_rtt_ms(&self) -> f32 {
        if self.rtt_samples.is_empty() {
            return 0.0;
        }
        self.rtt_samples.iter().sum::<f32>() / self.rtt_samples.len() as f32
    }
}

/// Reply to a ping by echoing its timestamp
pub fn pong_for(sent_at_ms: u64) -> SyncMessage {
    SyncMessage::Pong { sent_at_ms }
}
