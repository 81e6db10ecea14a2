use crate::SampleBlock;
use std::collections::VecDeque;

/// FIFO of sample blocks between the board driver and the acquisition core.
///
/// The queue owns every block until it is popped.
#[derive(Debug, Default)]
pub struct BlockQueue {
    blocks: VecDeque<SampleBlock>,
}

impl BlockQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, block: SampleBlock) {
        self.blocks.push_back(block);
    }

    /// Borrow the oldest block without removing it.
    pub fn front(&self) -> Option<&SampleBlock> {
        self.blocks.front()
    }

    pub fn pop(&mut self) -> Option<SampleBlock> {
        self.blocks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Pop up to `count` blocks in arrival order.
    pub fn take(&mut self, count: usize) -> Vec<SampleBlock> {
        let n = count.min(self.blocks.len());
        self.blocks.drain(..n).collect()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(first_ts: u32) -> SampleBlock {
        let mut b = SampleBlock::new(1);
        b.timestamp[0] = first_ts;
        b
    }

    #[test]
    fn front_then_pop_preserves_order() {
        let mut q = BlockQueue::new();
        q.push(block(0));
        q.push(block(60));
        assert_eq!(q.len(), 2);
        assert_eq!(q.front().map(|b| b.timestamp[0]), Some(0));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().map(|b| b.timestamp[0]), Some(0));
        assert_eq!(q.pop().map(|b| b.timestamp[0]), Some(60));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn take_is_bounded_by_contents() {
        let mut q = BlockQueue::new();
        for i in 0..3 {
            q.push(block(i * 60));
        }
        let first = q.take(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].timestamp[0], 60);
        assert_eq!(q.take(5).len(), 1);
        assert!(q.is_empty());
    }
}
