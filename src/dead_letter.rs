use async_trait::async_trait;
use tracing::error;

use crate::error::DispatchError;
use crate::record::Record;

/// Destination for records that keep failing after every redelivery
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn escalate(&self, identity: &str, record: &Record, attempts: u32, failure: &DispatchError);
}

/// Default sink: makes the escalation visible in the logs
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn escalate(&self, identity: &str, record: &Record, attempts: u32, failure: &DispatchError) {
        error!(
            identity = identity,
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            attempts = attempts,
            "☠️ Poison record escalated to dead letter: {}",
            failure
        );
    }
}
