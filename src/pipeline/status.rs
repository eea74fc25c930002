//! Lock-free health counters shared by the capture loop and the front-end

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

/// Capture loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Running,
    /// Loop told to exit, or died on its own, and has not been reaped yet
    Stopping,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Running,
            2 => StreamState::Stopping,
            _ => StreamState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Running => 1,
            StreamState::Stopping => 2,
        }
    }
}

/// Plain snapshot of [`StreamStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: StreamState,
    pub healthy: bool,
    pub frames_captured: u64,
    pub frames_published: u64,
    pub frames_skipped: u64,
    pub skip_streak: u32,
    pub last_change_ratio: f64,
    pub clients_connected: usize,
}

#[derive(Debug, Default)]
pub struct StreamStatus {
    state: AtomicU8,
    frames_captured: AtomicU64,
    frames_published: AtomicU64,
    frames_skipped: AtomicU64,
    skip_streak: AtomicU32,
    last_change_ratio: AtomicU64, // f64 bits
    clients_connected: AtomicUsize,
}

impl StreamStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move from `from` to `to` only if nobody changed the state meanwhile.
    pub(crate) fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Running and producing; a loop that died on a device error is not healthy
    pub fn is_healthy(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub(crate) fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_motion(&self, change_ratio: f64, skip_streak: u32) {
        self.last_change_ratio
            .store(change_ratio.to_bits(), Ordering::Relaxed);
        self.skip_streak.store(skip_streak, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> StatusReport {
        let state = self.state();
        StatusReport {
            state,
            healthy: state == StreamState::Running,
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            skip_streak: self.skip_streak.load(Ordering::Relaxed),
            last_change_ratio: f64::from_bits(self.last_change_ratio.load(Ordering::Relaxed)),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_unhealthy() {
        let status = StreamStatus::new();
        assert_eq!(status.state(), StreamState::Idle);
        assert!(!status.is_healthy());
    }

    #[test]
    fn transition_only_from_expected_state() {
        let status = StreamStatus::new();
        status.set_state(StreamState::Running);
        assert!(!status.transition(StreamState::Idle, StreamState::Stopping));
        assert!(status.transition(StreamState::Running, StreamState::Stopping));
        assert_eq!(status.state(), StreamState::Stopping);
    }

    #[test]
    fn report_reflects_counters() {
        let status = StreamStatus::new();
        status.set_state(StreamState::Running);
        status.record_captured();
        status.record_captured();
        status.record_published();
        status.record_skipped();
        status.record_motion(0.25, 4);
        status.client_connected();

        let report = status.report();
        assert!(report.healthy);
        assert_eq!(report.frames_captured, 2);
        assert_eq!(report.frames_published, 1);
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(report.skip_streak, 4);
        assert_eq!(report.last_change_ratio, 0.25);
        assert_eq!(report.clients_connected, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "running");
    }
}
