use alloc::collections::VecDeque;

use crate::Txn;

/// A FIFO of completed transactions, waiting for their owner's callback to be invoked.
///
/// This decouples the context, that observed the completion, from the context, that invokes the
/// callback. It has no locking of its own and always lives inside the critical section of its
/// owner.
#[derive(Debug, Default)]
pub struct DoneQueue {
    txns: VecDeque<Txn>,
}
impl DoneQueue {
    pub const fn new() -> Self {
        Self {
            txns: VecDeque::new(),
        }
    }
    pub fn enqueue(&mut self, txn: Txn) {
        self.txns.push_back(txn);
    }
    pub fn dequeue(&mut self) -> Option<Txn> {
        self.txns.pop_front()
    }
    /// Drop all entries without invoking any callback.
    ///
    /// Returns the amount of dropped transactions.
    pub fn clear(&mut self) -> usize {
        let count = self.txns.len();
        self.txns.clear();
        count
    }
    pub fn len(&self) -> usize {
        self.txns.len()
    }
    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}
