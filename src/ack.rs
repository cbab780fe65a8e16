//! Acknowledgment tokens handed to listener handlers next to each record.
//!
//! A token is a capability bound to one record's position inside one consumer
//! group. Committing it asks the broker to move the group's durable read
//! position past that record. Commits are idempotent: the first successful
//! commit of a token (or of any clone of it) wins, every later call is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BrokerError;
use crate::record::TopicPartition;

/// The record position a token commits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitPosition {
    pub group_id: String,
    pub topic: String,
    pub partition: u32,
    /// Offset of the acknowledged record, not the next one to read
    pub offset: u64,
}

impl CommitPosition {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Broker-side position tracking that tokens commit into
pub trait OffsetCommitter: Send + Sync {
    /// Advance the group position past `position`. Returns whether the
    /// stored position moved.
    fn commit(&self, position: &CommitPosition) -> Result<bool, BrokerError>;
}

/// One-shot commit capability for a delivered record
#[derive(Clone)]
pub struct AcknowledgmentToken {
    position: Arc<CommitPosition>,
    committer: Arc<dyn OffsetCommitter>,
    committed: Arc<AtomicBool>,
}

impl AcknowledgmentToken {
    pub fn new(position: CommitPosition, committer: Arc<dyn OffsetCommitter>) -> Self {
        Self {
            position: Arc::new(position),
            committer,
            committed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Commit the record's position. Repeated calls are no-ops.
    pub fn commit(&self) -> Result<(), BrokerError> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.committer.commit(&self.position) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Let the caller try again
                self.committed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn position(&self) -> &CommitPosition {
        &self.position
    }
}

impl fmt::Debug for AcknowledgmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgmentToken")
            .field("position", &*self.position)
            .field("committed", &self.is_committed())
            .finish()
    }
}
