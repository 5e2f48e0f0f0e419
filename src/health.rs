use tokio::time::{Duration, Instant};

/// Result of a scheduled heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Previous heartbeat was acknowledged, send the next one
    Send,
    /// Previous heartbeat was never acknowledged; the connection is presumed dead
    Missed,
}

/// Tracks heartbeat liveness for a single connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Interval announced by HELLO, `None` while stopped
    interval: Option<Duration>,

    /// Time the next scheduled heartbeat is due
    next_beat: Option<Instant>,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last acknowledgement received
    last_ack: Option<Instant>,

    /// Whether the last scheduled heartbeat was acknowledged
    acked: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            interval: None,
            next_beat: None,
            last_sent: None,
            last_ack: None,
            acked: true,
            latency: None,
        }
    }

    /// Start beating at `interval`; the first scheduled beat is one interval away
    pub fn start(&mut self, interval: Duration, now: Instant) {
        self.interval = Some(interval);
        self.next_beat = Some(now + interval);
        self.acked = true;
    }

    /// Stop scheduling heartbeats
    pub fn stop(&mut self) {
        self.interval = None;
        self.next_beat = None;
    }

    /// Forget all liveness state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Deadline of the next scheduled heartbeat
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_beat
    }

    /// Whether the scheduled heartbeat is due at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_beat.is_some_and(|at| at <= now)
    }

    /// Handle the scheduled heartbeat.
    ///
    /// Returns [`HeartbeatTick::Missed`] without scheduling anything when the
    /// previous beat was never acknowledged.
    pub fn tick(&mut self, now: Instant) -> HeartbeatTick {
        if !self.acked {
            self.next_beat = None;
            return HeartbeatTick::Missed;
        }
        self.acked = false;
        self.last_sent = Some(now);
        self.next_beat = self.interval.map(|interval| now + interval);
        HeartbeatTick::Send
    }

    /// Record an out-of-schedule heartbeat (after IDENTIFY, or requested by the gateway).
    ///
    /// Does not touch the acknowledgement flag.
    pub fn record_immediate(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Record an acknowledgement
    pub fn record_ack(&mut self, now: Instant) {
        self.acked = true;
        self.last_ack = Some(now);
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Latest round trip, `None` until an ack arrives on this connection
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let monitor = HeartbeatMonitor::new();
        assert!(!monitor.is_running());
        assert!(monitor.is_acked());
        assert_eq!(monitor.next_deadline(), None);
        assert_eq!(monitor.latency(), None);
    }

    #[test]
    fn test_beat_ack_cycle() {
        let now = Instant::now();
        let interval = Duration::from_millis(41250);
        let mut monitor = HeartbeatMonitor::new();
        monitor.start(interval, now);
        assert!(!monitor.is_due(now));
        assert!(monitor.is_due(now + interval));

        let beat = now + interval;
        assert_eq!(monitor.tick(beat), HeartbeatTick::Send);
        assert!(!monitor.is_acked());
        assert_eq!(monitor.next_deadline(), Some(beat + interval));

        monitor.record_ack(beat + Duration::from_millis(42));
        assert!(monitor.is_acked());
        assert_eq!(monitor.latency(), Some(Duration::from_millis(42)));
    }

    #[test]
    fn test_missed_ack() {
        let now = Instant::now();
        let interval = Duration::from_secs(1);
        let mut monitor = HeartbeatMonitor::new();
        monitor.start(interval, now);

        assert_eq!(monitor.tick(now + interval), HeartbeatTick::Send);
        assert_eq!(monitor.tick(now + interval * 2), HeartbeatTick::Missed);
        assert_eq!(monitor.next_deadline(), None);
    }

    #[test]
    fn test_immediate_beat_keeps_ack_flag() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new();
        monitor.start(Duration::from_secs(1), now);
        monitor.record_immediate(now);
        assert!(monitor.is_acked());
        assert_eq!(monitor.last_sent(), Some(now));
    }

    #[test]
    fn test_reset_clears_latency() {
        let now = Instant::now();
        let mut monitor = HeartbeatMonitor::new();
        monitor.start(Duration::from_secs(1), now);
        monitor.record_immediate(now);
        monitor.record_ack(now + Duration::from_millis(5));
        monitor.reset();
        assert_eq!(monitor.latency(), None);
        assert!(!monitor.is_running());
    }
}
