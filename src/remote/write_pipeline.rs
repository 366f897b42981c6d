use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::BatchId;
use crate::remote::mutation::MutationBatch;

/// Upper bound on mutation batches in flight to the backend.
pub const MAX_PENDING_WRITES: usize = 10;

/// Bounded FIFO of mutation batches awaiting acknowledgement.
///
/// Batch ids are strictly increasing and the head element is the batch the
/// next backend response applies to.
pub struct WritePipeline {
    queue: Mutex<VecDeque<MutationBatch>>,
}

impl WritePipeline {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < MAX_PENDING_WRITES
    }

    pub fn last_batch_id(&self) -> Option<BatchId> {
        self.queue.lock().unwrap().back().map(|batch| batch.batch_id)
    }

    pub fn enqueue(&self, batch: MutationBatch) {
        let mut queue = self.queue.lock().unwrap();
        assert!(
            queue.len() < MAX_PENDING_WRITES,
            "write pipeline exceeded {MAX_PENDING_WRITES} pending batches"
        );
        if let Some(last) = queue.back() {
            assert!(
                batch.batch_id > last.batch_id,
                "batch {} enqueued after batch {}",
                batch.batch_id,
                last.batch_id
            );
        }
        queue.push_back(batch);
    }

    pub fn peek_first(&self) -> Option<MutationBatch> {
        self.queue.lock().unwrap().front().cloned()
    }

    pub fn pop_first(&self) -> MutationBatch {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("write pipeline drained while a response was pending")
    }

    /// In-order copy of every pipelined batch, for re-transmission after a
    /// handshake.
    pub fn batches(&self) -> Vec<MutationBatch> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }

    /// Drops all pipelined batches, returning how many were dropped. The
    /// batches remain durable in the local store.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

impl Default for WritePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn batch(batch_id: BatchId) -> MutationBatch {
        MutationBatch::new(batch_id, Timestamp::new(0, 0), Vec::new())
    }

    #[test]
    fn fifo_order_and_capacity() {
        let pipeline = WritePipeline::new();
        for id in 1..=MAX_PENDING_WRITES as BatchId {
            pipeline.enqueue(batch(id));
        }
        assert!(!pipeline.has_capacity());
        assert_eq!(pipeline.last_batch_id(), Some(10));

        assert_eq!(pipeline.pop_first().batch_id, 1);
        assert!(pipeline.has_capacity());
        assert_eq!(pipeline.peek_first().unwrap().batch_id, 2);
    }

    #[test]
    #[should_panic(expected = "exceeded")]
    fn enqueue_past_capacity_panics() {
        let pipeline = WritePipeline::new();
        for id in 1..=(MAX_PENDING_WRITES as BatchId + 1) {
            pipeline.enqueue(batch(id));
        }
    }

    #[test]
    #[should_panic(expected = "enqueued after batch")]
    fn non_increasing_batch_ids_panic() {
        let pipeline = WritePipeline::new();
        pipeline.enqueue(batch(5));
        pipeline.enqueue(batch(5));
    }

    #[test]
    fn clear_reports_dropped_count() {
        let pipeline = WritePipeline::new();
        pipeline.enqueue(batch(1));
        pipeline.enqueue(batch(2));
        assert_eq!(pipeline.clear(), 2);
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.last_batch_id(), None);
    }
}
