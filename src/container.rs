//! Delivery loop of one listener unit.
//!
//! Each running unit owns one container task and one subscription. Control
//! commands arrive on a `watch` channel and are only observed between
//! deliveries, so a handler that is already running always finishes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::Subscription;
use crate::config::RetryConfig;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::{DeliveryOutcome, Dispatcher};
use crate::listener::{ListenerState, ListenerUnit};
use crate::record::TopicPartition;

/// What the registry wants the container to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Run,
    Pause,
    Stop,
}

impl Command {
    fn as_state(self) -> ListenerState {
        match self {
            Command::Run => ListenerState::Running,
            Command::Pause => ListenerState::Paused,
            Command::Stop => ListenerState::Stopping,
        }
    }
}

pub(crate) struct Container {
    pub unit: ListenerUnit,
    pub dispatcher: Arc<Dispatcher>,
    pub retry: RetryConfig,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub state: Arc<watch::Sender<ListenerState>>,
}

impl Container {
    pub async fn run(self, mut subscription: Box<dyn Subscription>, mut control: watch::Receiver<Command>) {
        let identity = self.unit.identity().to_string();
        info!(
            "🎧 Listener '{}' consuming {:?} as group '{}'",
            identity,
            self.unit.topics(),
            subscription.group_id()
        );

        // Consecutive failures per partition: (offset, attempts)
        let mut failures: HashMap<TopicPartition, (u64, u32)> = HashMap::new();
        let mut paused = false;

        loop {
            let command = *control.borrow_and_update();
            match command {
                Command::Stop => break,
                Command::Pause => {
                    if !paused {
                        subscription.pause();
                        paused = true;
                        debug!("⏸️ Listener '{}' paused", identity);
                    }
                    if control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                Command::Run => {
                    if paused {
                        subscription.resume();
                        paused = false;
                        debug!("▶️ Listener '{}' resumed", identity);
                    }
                }
            }

            let delivery = tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };

            let Some((record, token)) = delivery else {
                warn!("⚠️ Subscription of '{}' closed by the broker", identity);
                self.state.send_replace(ListenerState::Stopped);
                return;
            };

            let tp = record.topic_partition();
            let offset = record.offset();
            let current = control.borrow().as_state();

            match self.dispatcher.deliver(&self.unit, current, record.clone(), token.clone()).await {
                Ok(DeliveryOutcome::NotRunning) => {
                    // Leave it for whoever consumes this partition next
                    subscription.seek_to_committed(&tp);
                }
                Ok(_) => {
                    // Replays of earlier uncommitted records keep the count
                    if failures.get(&tp).is_some_and(|(failed_offset, _)| offset >= *failed_offset) {
                        failures.remove(&tp);
                    }
                }
                Err(failure) => {
                    let attempts = match failures.get(&tp) {
                        Some((failed_offset, attempts)) if *failed_offset == offset => attempts + 1,
                        _ => 1,
                    };

                    if self.retry.should_retry(attempts) {
                        let delay = self.retry.calculate_delay(attempts - 1);
                        error!(
                            "❌ {} (attempt {}), redelivering in {:?}",
                            failure, attempts, delay
                        );
                        failures.insert(tp.clone(), (offset, attempts));

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = control.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                        subscription.seek_to_committed(&tp);
                    } else {
                        self.dead_letter.escalate(&identity, &record, attempts, &failure).await;
                        if let Err(e) = token.commit() {
                            error!("❌ Could not commit past poison record {}@{}: {}", tp, offset, e);
                            subscription.seek_to_committed(&tp);
                        }
                        failures.remove(&tp);
                    }
                }
            }
        }

        subscription.close();
        debug!("🛑 Listener '{}' released its subscription", identity);
    }
}
