//! Token bucket with capacity reserved for priority items

use crate::error::Error;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Default upper bound on queued items
pub const MAX_QUEUED: usize = 4096;

/// Releases at most `capacity` items per refill window.
///
/// The last `reserved` tokens of every window are only handed to items
/// queued with priority. The bucket holds no timers: the owner calls
/// [`TokenBucket::drain`] and sleeps until [`TokenBucket::next_deadline`].
#[derive(Debug)]
pub struct TokenBucket<T> {
    capacity: u32,
    refill: Duration,
    reserved: u32,
    /// Minimum spacing between releases
    latency_ref: Duration,
    max_queued: usize,

    tokens_used: u32,
    window_start: Option<Instant>,
    last_send: Option<Instant>,
    queue: VecDeque<(T, bool)>,
    /// Items that won a token but must wait out `latency_ref`
    scheduled: VecDeque<(Instant, T)>,
    next_check: Option<Instant>,
}

impl<T> TokenBucket<T> {
    pub fn new(capacity: u32, refill: Duration) -> Self {
        Self {
            capacity,
            refill,
            reserved: 0,
            latency_ref: Duration::ZERO,
            max_queued: MAX_QUEUED,
            tokens_used: 0,
            window_start: None,
            last_send: None,
            queue: VecDeque::new(),
            scheduled: VecDeque::new(),
            next_check: None,
        }
    }

    /// Reserve the last `reserved` tokens of each window for priority items
    pub fn with_reserved(mut self, reserved: u32) -> Self {
        self.reserved = reserved.min(self.capacity);
        self
    }

    /// Spread releases at least `latency_ref` apart; the window grows by `capacity * latency_ref`
    pub fn set_latency_ref(&mut self, latency_ref: Duration) {
        self.latency_ref = latency_ref;
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    /// Enqueue an item; priority items jump to the front.
    ///
    /// Non-priority items are rejected once the queue holds `max_queued` items.
    pub fn queue(&mut self, item: T, priority: bool) -> Result<(), Error> {
        if priority {
            self.queue.push_front((item, true));
        } else {
            if self.queue.len() >= self.max_queued {
                return Err(Error::QueueFull(self.queue.len()));
            }
            self.queue.push_back((item, false));
        }
        Ok(())
    }

    /// Withdraw a queued item that has not been released yet
    pub fn remove(&mut self, item: &T) -> bool
    where
        T: PartialEq,
    {
        match self.queue.iter().position(|(queued, _)| queued == item) {
            Some(index) => self.queue.remove(index).is_some(),
            None => false,
        }
    }

    /// Release every item that may go out at `now`
    pub fn drain(&mut self, now: Instant) -> Vec<T> {
        let mut released = Vec::new();
        while self.scheduled.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, item)) = self.scheduled.pop_front() {
                released.push(item);
            }
        }

        if self.queue.is_empty() {
            self.next_check = None;
            return released;
        }

        let window = self.window_length();
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.tokens_used = 0;
            }
            Some(start) if now.duration_since(start) >= window => {
                self.window_start = Some(now);
                // Carry any overdraft into the new window
                self.tokens_used = self.tokens_used.saturating_sub(self.capacity);
            }
            Some(_) => {}
        }

        let unreserved = self.capacity - self.reserved;
        while let Some((_, priority)) = self.queue.front() {
            let allowed = self.tokens_used < unreserved || (*priority && self.tokens_used < self.capacity);
            if !allowed {
                break;
            }
            let Some((item, _)) = self.queue.pop_front() else {
                break;
            };
            self.tokens_used += 1;

            let send_at = match self.last_send {
                Some(last) if !self.latency_ref.is_zero() => (last + self.latency_ref).max(now),
                _ => now,
            };
            self.last_send = Some(send_at);
            if send_at <= now {
                released.push(item);
            } else {
                self.scheduled.push_back((send_at, item));
            }
        }

        self.next_check = match (self.queue.is_empty(), self.window_start) {
            (false, Some(start)) => Some(start + window),
            _ => None,
        };
        released
    }

    /// When [`TokenBucket::drain`] can next make progress
    pub fn next_deadline(&self) -> Option<Instant> {
        let scheduled = self.scheduled.front().map(|(at, _)| *at);
        match (scheduled, self.next_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drop every queued and scheduled item; token accounting is kept
    pub fn clear(&mut self) {
        self.queue.clear();
        self.scheduled.clear();
        self.next_check = None;
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens_used(&self) -> u32 {
        self.tokens_used
    }

    fn window_length(&self) -> Duration {
        self.refill + self.latency_ref * self.capacity
    }
}
