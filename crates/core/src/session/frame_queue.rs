use std::collections::VecDeque;

use crate::shared::frame::Frame;

/// A validated, decoded frame waiting for a worker.
#[derive(Clone, Debug)]
pub struct QueuedFrame {
    /// Pixels at processing resolution.
    pub frame: Frame,
    /// Multiplier mapping processing coordinates back to client pixels.
    pub scale: f64,
    /// Client capture timestamp, echoed back in the result.
    pub timestamp: Option<f64>,
}

impl QueuedFrame {
    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id()
    }
}

/// Fixed-capacity FIFO that evicts the oldest entry when full.
#[derive(Debug)]
pub struct FrameQueue<T = QueuedFrame> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted oldest entry if the queue was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Empties the queue and returns how many entries were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = FrameQueue::new(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut queue = FrameQueue::new(5);
        let evicted: Vec<Option<u64>> = (1..=7).map(|id| queue.push(id)).collect();

        assert_eq!(evicted[..5], [None; 5]);
        assert_eq!(evicted[5], Some(1));
        assert_eq!(evicted[6], Some(2));
        assert_eq!(queue.len(), 5);

        let remaining: Vec<u64> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(remaining, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut queue = FrameQueue::new(2);
        for id in 0..100 {
            queue.push(id);
            assert!(queue.len() <= queue.capacity());
        }
        assert!(queue.is_full());
    }

    #[test]
    fn test_clear_reports_discarded() {
        let mut queue = FrameQueue::new(4);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(1);
        assert_eq!(queue.push(2), Some(1));
    }
}
