use std::time::Duration;
use thiserror::Error;

/// Failures reported by a broker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker rejected the record: {0}")]
    Rejected(String),
    #[error("broker client is closed")]
    Closed,
    #[error("delivery was canceled before the broker answered")]
    Canceled,
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),
}

/// Control-plane failures of the listener registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("listener identity '{0}' is already registered")]
    DuplicateIdentity(String),
    #[error("no listener registered under identity '{0}'")]
    UnknownIdentity(String),
    #[error("listener '{identity}' did not stop within {timeout:?}")]
    StopTimeout { identity: String, timeout: Duration },
    #[error("listener '{identity}' could not subscribe: {source}")]
    Subscribe {
        identity: String,
        #[source]
        source: BrokerError,
    },
}

/// Producer failures surfaced to callers of the blocking send modes
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("send to '{topic}' did not complete within {timeout:?}")]
    SendTimeout { topic: String, timeout: Duration },
    #[error("send rejected: {0}")]
    SendRejected(#[from] BrokerError),
    #[error("transaction failed: {failed} of {total} records were not acknowledged")]
    TransactionFailed { failed: usize, total: usize },
}

/// Raised by the dispatcher when a listener handler fails
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("handler of '{identity}' failed on {topic}[{partition}]@{offset}: {source}")]
    HandlerFailure {
        identity: String,
        topic: String,
        partition: u32,
        offset: u64,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid trigger expression '{expression}': {reason}")]
    InvalidTrigger { expression: String, reason: String },
    #[error("scheduler has been shut down")]
    SchedulerStopped,
    #[error("no job callback registered under '{0}'")]
    UnknownJob(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = RegistryError::UnknownIdentity("listener1".to_string());
        assert_eq!(err.to_string(), "no listener registered under identity 'listener1'");

        let err = ProducerError::SendTimeout {
            topic: "xxxxx".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("xxxxx"));
        assert!(err.to_string().contains("10s"));

        let err = DispatchError::HandlerFailure {
            identity: "group1".to_string(),
            topic: "testTopic".to_string(),
            partition: 0,
            offset: 7,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "handler of 'group1' failed on testTopic[0]@7: boom");
    }

    #[test]
    fn test_broker_error_converts_into_send_rejected() {
        let err: ProducerError = BrokerError::Rejected("too large".to_string()).into();
        assert!(matches!(err, ProducerError::SendRejected(BrokerError::Rejected(_))));
    }
}
