use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::broker::{BrokerClient, DeliveryFuture};
use crate::config::ProducerConfig;
use crate::error::{BrokerError, ProducerError};
use crate::record::SendResult;

/// Continuation attached to a send. Exactly one branch runs.
pub trait SendCallback: Send + 'static {
    fn on_success(self, result: SendResult);
    fn on_failure(self, error: BrokerError);
}

/// [`SendCallback`] made from two closures
pub struct FnCallback<S, F> {
    on_success: S,
    on_failure: F,
}

pub fn callback<S, F>(on_success: S, on_failure: F) -> FnCallback<S, F>
where
    S: FnOnce(SendResult) + Send + 'static,
    F: FnOnce(BrokerError) + Send + 'static,
{
    FnCallback { on_success, on_failure }
}

impl<S, F> SendCallback for FnCallback<S, F>
where
    S: FnOnce(SendResult) + Send + 'static,
    F: FnOnce(BrokerError) + Send + 'static,
{
    fn on_success(self, result: SendResult) {
        (self.on_success)(result)
    }

    fn on_failure(self, error: BrokerError) {
        (self.on_failure)(error)
    }
}

/// Producer front end shared by handlers, jobs and the HTTP entrypoint.
///
/// Every mode issues exactly one broker send per call and never retries.
#[derive(Clone)]
pub struct ProducerFacade {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    broker: Arc<dyn BrokerClient>,
    send_timeout: Duration,
    default_topic: String,
    tracker: TaskTracker,
    /// Serializes the close/wait/reopen cycle of `flush`
    flushing: Mutex<()>,
}

impl ProducerFacade {
    pub fn new(broker: Arc<dyn BrokerClient>, config: &ProducerConfig) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                broker,
                send_timeout: config.send_timeout(),
                default_topic: config.default_topic.clone(),
                tracker: TaskTracker::new(),
                flushing: Mutex::new(()),
            }),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.inner.send_timeout
    }

    /// Send a record and hand back the raw delivery future
    pub fn send(&self, topic: &str, key: Option<&str>, value: impl Into<String>) -> DeliveryFuture {
        let value = value.into();
        debug!("📤 Sending record to topic '{}': {}", topic, value);
        self.inner.broker.send(topic, key.map(str::to_string), value)
    }

    /// Send to the configured default topic
    pub fn send_default(&self, value: impl Into<String>) -> DeliveryFuture {
        self.send(&self.inner.default_topic, None, value)
    }

    /// Send without surfacing the outcome. Failures are only logged.
    pub fn send_and_forget(&self, topic: &str, key: Option<&str>, value: impl Into<String>) {
        let delivery = self.send(topic, key, value);
        let topic = topic.to_string();
        self.track(async move {
            if let Err(e) = delivery.await {
                warn!("⚠️ Fire-and-forget send to '{}' failed: {}", topic, e);
            }
        });
    }

    /// Send and run `callback` once the broker answers, without blocking the caller
    pub fn send_with_callback<C: SendCallback>(&self, topic: &str, key: Option<&str>, value: impl Into<String>, callback: C) {
        let delivery = self.send(topic, key, value);
        self.track(async move {
            match delivery.await {
                Ok(result) => callback.on_success(result),
                Err(e) => callback.on_failure(e),
            }
        });
    }

    /// Block until the broker answers, up to the configured send timeout
    pub async fn send_and_wait(&self, topic: &str, key: Option<&str>, value: impl Into<String>) -> Result<SendResult, ProducerError> {
        self.send_and_wait_timeout(topic, key, value, self.inner.send_timeout).await
    }

    pub async fn send_and_wait_timeout(
        &self,
        topic: &str,
        key: Option<&str>,
        value: impl Into<String>,
        timeout: Duration,
    ) -> Result<SendResult, ProducerError> {
        let delivery = self.send(topic, key, value);
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(result)) => {
                debug!(
                    "✅ Record stored at {}[{}]@{}",
                    result.topic, result.partition, result.offset
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                error!("❌ Send to '{}' rejected: {}", topic, e);
                Err(ProducerError::SendRejected(e))
            }
            Err(_) => {
                error!("⏰ Send to '{}' timed out after {:?}", topic, timeout);
                Err(ProducerError::SendTimeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Start an explicit transaction boundary
    pub fn begin(&self) -> Transaction {
        Transaction {
            producer: self.clone(),
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Wait for every outstanding fire-and-forget and callback continuation
    pub async fn flush(&self) {
        let _flushing = self.inner.flushing.lock().await;
        let outstanding = self.inner.tracker.len();
        if outstanding > 0 {
            debug!("🚿 Flushing {} outstanding sends", outstanding);
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Continuations not yet finished
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.len()
    }

    fn track<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.inner.tracker.spawn_on(task, &handle);
            }
            Err(_) => warn!("No runtime available, send outcome will not be observed"),
        }
    }
}

/// Buffered sends published together on commit.
///
/// Not atomic at the broker: a failed commit may leave some records stored.
/// Dropping an uncommitted transaction rolls it back.
pub struct Transaction {
    producer: ProducerFacade,
    pending: Vec<(String, Option<String>, String)>,
    finished: bool,
}

impl Transaction {
    pub fn send(&mut self, topic: &str, key: Option<&str>, value: impl Into<String>) {
        self.pending
            .push((topic.to_string(), key.map(str::to_string), value.into()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Publish buffered records in order and wait for all of them within the
    /// producer's send timeout
    pub async fn commit(mut self) -> Result<Vec<SendResult>, ProducerError> {
        self.finished = true;
        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();
        let deadline = tokio::time::Instant::now() + self.producer.send_timeout();

        let deliveries: Vec<(String, DeliveryFuture)> = pending
            .into_iter()
            .map(|(topic, key, value)| {
                let delivery = self.producer.send(&topic, key.as_deref(), value);
                (topic, delivery)
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        let mut failed = 0;
        for (topic, delivery) in deliveries {
            match tokio::time::timeout_at(deadline, delivery).await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    error!("❌ Transactional send to '{}' failed: {}", topic, e);
                    failed += 1;
                }
                Err(_) => {
                    error!("⏰ Transactional send to '{}' timed out", topic);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(ProducerError::TransactionFailed { failed, total });
        }
        debug!("✅ Transaction committed {} records", total);
        Ok(results)
    }

    pub fn rollback(mut self) {
        self.finished = true;
        debug!("↩️ Transaction rolled back, {} records discarded", self.pending.len());
        self.pending.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            warn!(
                "⚠️ Transaction dropped without commit, {} records discarded",
                self.pending.len()
            );
        }
    }
}
