//! Single-flight queue driven by a remote remaining/reset pair

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Hands out one item at a time.
///
/// The next item is only released after the previous one was marked
/// [`complete`](SequentialBucket::complete), and only while the current
/// window has `remaining` capacity. Without server feedback the window
/// refreshes as soon as its reset time has passed.
#[derive(Debug)]
pub struct SequentialBucket<T> {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    in_flight: bool,
    queue: VecDeque<T>,
    wake_at: Option<Instant>,
}

impl<T> SequentialBucket<T> {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_at: None,
            in_flight: false,
            queue: VecDeque::new(),
            wake_at: None,
        }
    }

    /// Enqueue an item; priority items go to the front
    pub fn queue(&mut self, item: T, priority: bool) {
        if priority {
            self.queue.push_front(item);
        } else {
            self.queue.push_back(item);
        }
    }

    /// Take the next item if nothing is in flight and the window allows it
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if self.in_flight || self.queue.is_empty() {
            return None;
        }

        if self.reset_at.map_or(true, |reset| reset < now) {
            self.reset_at = Some(now);
            self.remaining = self.limit;
        }

        if self.remaining == 0 {
            self.wake_at = self.reset_at.map(|reset| reset + Duration::from_millis(1));
            return None;
        }

        self.wake_at = None;
        self.remaining -= 1;
        self.in_flight = true;
        self.queue.pop_front()
    }

    /// Mark the in-flight item finished so the next one may start
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    /// Apply limits reported by the remote side
    pub fn update(&mut self, limit: u32, remaining: u32, reset_at: Instant) {
        self.limit = limit;
        self.remaining = remaining;
        self.reset_at = Some(reset_at);
    }

    /// When [`SequentialBucket::poll`] is blocked on the window, the time to retry
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight || self.queue.is_empty() {
            None
        } else {
            self.wake_at
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
        self.wake_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let now = Instant::now();
        let mut bucket = SequentialBucket::new(10);
        bucket.queue("a", false);
        bucket.queue("b", false);

        assert_eq!(bucket.poll(now), Some("a"));
        assert!(bucket.is_busy());
        assert_eq!(bucket.poll(now), None);

        bucket.complete();
        assert_eq!(bucket.poll(now), Some("b"));
        bucket.complete();
        assert_eq!(bucket.poll(now), None);
    }

    #[test]
    fn test_priority_goes_first() {
        let now = Instant::now();
        let mut bucket = SequentialBucket::new(10);
        bucket.queue(1, false);
        bucket.queue(2, true);
        assert_eq!(bucket.poll(now), Some(2));
    }

    #[test]
    fn test_waits_for_reset_when_exhausted() {
        let now = Instant::now();
        let reset = now + Duration::from_secs(2);
        let mut bucket = SequentialBucket::new(5);
        bucket.update(5, 0, reset);
        bucket.queue("a", false);

        assert_eq!(bucket.poll(now), None);
        assert_eq!(bucket.next_deadline(), Some(reset + Duration::from_millis(1)));

        // Still blocked exactly at the reset instant
        assert_eq!(bucket.poll(reset), None);
        assert_eq!(bucket.poll(reset + Duration::from_millis(1)), Some("a"));
        assert_eq!(bucket.next_deadline(), None);
    }

    #[test]
    fn test_refreshes_after_reset() {
        let now = Instant::now();
        let mut bucket = SequentialBucket::new(1);
        bucket.queue(1, false);
        bucket.queue(2, false);

        assert_eq!(bucket.poll(now), Some(1));
        bucket.complete();
        // Window started at `now` and is used up
        assert_eq!(bucket.poll(now), None);
        assert_eq!(bucket.poll(now + Duration::from_millis(1)), Some(2));
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut bucket = SequentialBucket::new(1);
        bucket.queue(1, false);
        bucket.poll(now);
        bucket.queue(2, false);
        bucket.clear();
        assert!(bucket.is_empty());
        assert!(!bucket.is_busy());
    }
}
