//! Size/time dual-trigger batch buffer.

use std::time::Duration;

use tokio::time::Instant;

/// Accumulates items until either `max_size` is reached or `interval` has
/// elapsed since the first item of the current batch arrived.
#[derive(Debug)]
pub(crate) struct BatchBuffer<T> {
    items: Vec<T>,
    opened_at: Instant,
    max_size: usize,
    interval: Duration,
}

impl<T> BatchBuffer<T> {
    pub(crate) fn new(max_size: usize, interval: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size.min(4096)),
            opened_at: Instant::now(),
            max_size,
            interval,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        // Start the clock on the first item so an idle buffer is never overdue.
        if self.items.is_empty() {
            self.opened_at = Instant::now();
        }
        self.items.push(item);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.is_full() || (!self.items.is_empty() && self.opened_at.elapsed() >= self.interval)
    }

    /// When the current batch becomes due, if it holds anything.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        (!self.items.is_empty()).then(|| self.opened_at + self.interval)
    }

    pub(crate) fn take(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size.min(4096)))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_size() {
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(60));
        buffer.push(1);
        assert!(!buffer.should_flush());
        buffer.push(2);
        assert!(buffer.should_flush());
        assert_eq!(buffer.take(), vec![1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval_from_first_item() {
        let mut buffer = BatchBuffer::new(100, Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(10)).await;
        buffer.push("a");
        assert!(!buffer.should_flush());
        assert_eq!(buffer.deadline(), Some(Instant::now() + Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(buffer.should_flush());
        assert_eq!(buffer.len(), 1);
    }
}
