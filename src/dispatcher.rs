//! Invokes listener handlers for delivered records and forwards their replies.
//!
//! The dispatcher never commits on behalf of a failing handler and never
//! retries locally: a handler error is returned to the container, which
//! rewinds the subscription so the broker delivers the record again.

use tracing::{debug, error, warn};

use crate::ack::AcknowledgmentToken;
use crate::config::AckMode;
use crate::error::{DispatchError, ProducerError};
use crate::listener::{ListenerState, ListenerUnit};
use crate::producer::ProducerFacade;
use crate::record::{Record, SendResult};

/// How a delivery that did not fail ended
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Handler ran, nothing to forward
    Completed,
    /// Handler reply was stored on the forward topic
    Forwarded(SendResult),
    /// Handler succeeded but its reply could not be produced. The record's
    /// acknowledgment is left as the handler set it.
    ForwardFailed(ProducerError),
    /// Unit was not running; the handler was not invoked
    NotRunning,
}

pub struct Dispatcher {
    producer: ProducerFacade,
    ack_mode: AckMode,
}

impl Dispatcher {
    pub fn new(producer: ProducerFacade, ack_mode: AckMode) -> Self {
        Self { producer, ack_mode }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Run `unit`'s handler for one record
    pub async fn deliver(
        &self,
        unit: &ListenerUnit,
        state: ListenerState,
        record: Record,
        token: AcknowledgmentToken,
    ) -> Result<DeliveryOutcome, DispatchError> {
        if state != ListenerState::Running {
            debug!(
                "Skipping {} for '{}' in state {}",
                record.topic_partition(),
                unit.identity(),
                state
            );
            return Ok(DeliveryOutcome::NotRunning);
        }

        let topic = record.topic().to_string();
        let partition = record.partition();
        let offset = record.offset();

        let reply = match (unit.handler())(record, token.clone()).await {
            Ok(reply) => reply,
            Err(source) => {
                return Err(DispatchError::HandlerFailure {
                    identity: unit.identity().to_string(),
                    topic,
                    partition,
                    offset,
                    source,
                });
            }
        };

        let outcome = match (reply, unit.forward_to()) {
            (None, _) => DeliveryOutcome::Completed,
            (Some(value), Some(forward_to)) => {
                match self.producer.send_and_wait(forward_to, None, value).await {
                    Ok(result) => {
                        debug!(
                            "↪️ '{}' forwarded reply to {}[{}]@{}",
                            unit.identity(),
                            result.topic,
                            result.partition,
                            result.offset
                        );
                        DeliveryOutcome::Forwarded(result)
                    }
                    Err(e) => {
                        error!(
                            "❌ '{}' could not forward reply for {}[{}]@{} to '{}': {}",
                            unit.identity(),
                            topic,
                            partition,
                            offset,
                            forward_to,
                            e
                        );
                        DeliveryOutcome::ForwardFailed(e)
                    }
                }
            }
            (Some(_), None) => {
                warn!(
                    "⚠️ '{}' returned a reply but has no forward topic, reply dropped",
                    unit.identity()
                );
                DeliveryOutcome::Completed
            }
        };

        if self.ack_mode == AckMode::Record {
            if let Err(e) = token.commit() {
                error!(
                    "❌ Commit of {}[{}]@{} for '{}' failed: {}",
                    topic,
                    partition,
                    offset,
                    unit.identity(),
                    e
                );
            }
        }

        Ok(outcome)
    }
}
