use serde::{Deserialize, Serialize};

/// Dispatcher counters, logged on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub uptime_sec: u64,
    pub messages_received: u64,
    pub self_echoes: u64,
    pub ignored: u64,
    pub replies: u64,
    pub apologies: u64,
    pub delivery_failures: u64,
    pub sessions_created: u64,
    pub provisioning_failures: u64,
    pub reasoning_failures: u64,
    pub persistence_warnings: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&mut self) {
        self.messages_received += 1;
    }

    pub fn record_self_echo(&mut self) {
        self.self_echoes += 1;
    }

    pub fn record_ignored(&mut self) {
        self.ignored += 1;
    }

    pub fn record_reply(&mut self) {
        self.replies += 1;
    }

    pub fn record_apology(&mut self) {
        self.apologies += 1;
    }

    pub fn record_delivery_failure(&mut self) {
        self.delivery_failures += 1;
    }

    /// Record a created session and the store warnings it produced.
    pub fn record_session_created(&mut self, persistence_warnings: u32) {
        self.sessions_created += 1;
        self.persistence_warnings += u64::from(persistence_warnings);
    }

    pub fn record_provisioning_failure(&mut self) {
        self.provisioning_failures += 1;
    }

    pub fn record_reasoning_failure(&mut self) {
        self.reasoning_failures += 1;
    }

    /// Share of answered messages that got a real reply, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let answered = self.replies + self.apologies;
        if answered == 0 {
            return 100.0;
        }
        (self.replies as f64 / answered as f64) * 100.0
    }

    /// Increment uptime (called every heartbeat interval)
    pub fn increment_uptime(&mut self, seconds: u64) {
        self.uptime_sec += seconds;
    }
}
