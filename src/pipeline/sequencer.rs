//! Submission-ordered list of in-flight requests

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use crate::capture::SequenceId;
use crate::error::{Error, Result};
use crate::utils::format_sequence_list;

/// FIFO of sequence ids in submission order. An id appears at most once and
/// leaves only through reclamation or a flush.
#[derive(Debug, Default)]
pub struct OrderingSequencer {
    order: Mutex<VecDeque<SequenceId>>,
}

impl OrderingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, sequence_id: SequenceId) -> Result<()> {
        let mut order = self.order.lock();
        if order.contains(&sequence_id) {
            return Err(Error::InvalidRequest(format!(
                "sequence id {sequence_id} is already in flight"
            )));
        }
        order.push_back(sequence_id);
        Ok(())
    }

    pub fn remove(&self, sequence_id: SequenceId) -> bool {
        let mut order = self.order.lock();
        match order.iter().position(|id| *id == sequence_id) {
            Some(index) => {
                order.remove(index);
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy, oldest first.
    pub fn snapshot(&self) -> Vec<SequenceId> {
        self.order.lock().iter().copied().collect()
    }

    pub fn contains(&self, sequence_id: SequenceId) -> bool {
        self.order.lock().contains(&sequence_id)
    }

    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut order = self.order.lock();
        let dropped = order.len();
        order.clear();
        if dropped > 0 {
            debug!(dropped, "sequencer cleared");
        }
        dropped
    }

    pub fn dump(&self) -> String {
        let snapshot = self.snapshot();
        format!("sequencer[{}]: {}", snapshot.len(), format_sequence_list(&snapshot))
    }
}
