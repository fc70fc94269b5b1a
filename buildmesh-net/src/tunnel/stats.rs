//! Link statistics shared between a message loop and its observers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug)]
struct LinkState {
    last_seen: Instant,
    latency: Option<Duration>,
    frames_recv: u64,
    frames_sent: u64,
}

/// Cheaply cloneable handle to a tunnel's liveness data.
#[derive(Debug, Clone)]
pub struct LinkStats {
    state: Arc<Mutex<LinkState>>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStats {
    /// Start tracking a link that was just established.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                last_seen: Instant::now(),
                latency: None,
                frames_recv: 0,
                frames_sent: 0,
            })),
        }
    }

    /// Record that a frame arrived.
    pub fn record_recv(&self) {
        let mut state = self.state.lock();
        state.last_seen = Instant::now();
        state.frames_recv += 1;
    }

    /// Record that a frame was sent.
    pub fn record_sent(&self) {
        self.state.lock().frames_sent += 1;
    }

    /// Record the one-way delay of a message stamped `sent_at` by the remote clock.
    ///
    /// Clock skew can make this negative; it is clamped to zero.
    pub fn record_latency(&self, sent_at: DateTime<Utc>) {
        let delay = (Utc::now() - sent_at).to_std().unwrap_or(Duration::ZERO);
        self.state.lock().latency = Some(delay);
    }

    /// When a frame last arrived.
    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_seen
    }

    /// Time since a frame last arrived.
    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Most recent latency sample.
    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    /// Frames received so far.
    pub fn frames_recv(&self) -> u64 {
        self.state.lock().frames_recv
    }

    /// Frames sent so far.
    pub fn frames_sent(&self) -> u64 {
        self.state.lock().frames_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_resets_idle() {
        let stats = LinkStats::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(stats.idle_for() >= Duration::from_millis(20));

        stats.record_recv();
        assert!(stats.idle_for() < Duration::from_millis(20));
        assert_eq!(stats.frames_recv(), 1);
    }

    #[test]
    fn test_latency_clamped() {
        let stats = LinkStats::new();
        assert_eq!(stats.latency(), None);

        stats.record_latency(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(stats.latency(), Some(Duration::ZERO));

        stats.record_latency(Utc::now() - chrono::Duration::milliseconds(50));
        assert!(stats.latency().unwrap() >= Duration::from_millis(50));
    }
}
