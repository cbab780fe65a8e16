//! Process-wide table of listener units keyed by identity.
//!
//! The table itself sits behind a short-lived `RwLock`; every control call
//! then serializes on the unit's own async mutex, so operations on one
//! identity are mutually exclusive while distinct identities proceed
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::RetryConfig;
use crate::container::{Command, Container};
use crate::dead_letter::{DeadLetterSink, LoggingDeadLetterSink};
use crate::dispatcher::Dispatcher;
use crate::error::RegistryError;
use crate::listener::{ListenerState, ListenerUnit};

struct UnitSlot {
    unit: ListenerUnit,
    state: Arc<watch::Sender<ListenerState>>,
    control: Mutex<ContainerControl>,
}

#[derive(Default)]
struct ContainerControl {
    command: Option<watch::Sender<Command>>,
    task: Option<JoinHandle<()>>,
}

pub struct ListenerRegistry {
    broker: Arc<dyn BrokerClient>,
    dispatcher: Arc<Dispatcher>,
    retry: RetryConfig,
    dead_letter: Arc<dyn DeadLetterSink>,
    stop_timeout: Duration,
    units: RwLock<HashMap<String, Arc<UnitSlot>>>,
}

impl ListenerRegistry {
    pub fn new(broker: Arc<dyn BrokerClient>, dispatcher: Arc<Dispatcher>, retry: RetryConfig, stop_timeout: Duration) -> Self {
        Self {
            broker,
            dispatcher,
            retry,
            dead_letter: Arc::new(LoggingDeadLetterSink),
            stop_timeout,
            units: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default logging dead-letter sink
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = sink;
        self
    }

    /// Add a unit in state Stopped
    pub fn register(&self, unit: ListenerUnit) -> Result<(), RegistryError> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.contains_key(unit.identity()) {
            return Err(RegistryError::DuplicateIdentity(unit.identity().to_string()));
        }

        debug!(
            "📋 Registered listener '{}' on {:?} (group '{}', auto start: {})",
            unit.identity(),
            unit.topics(),
            unit.group_id(),
            unit.auto_start()
        );
        let identity = unit.identity().to_string();
        units.insert(
            identity,
            Arc::new(UnitSlot {
                unit,
                state: Arc::new(watch::channel(ListenerState::Stopped).0),
                control: Mutex::new(ContainerControl::default()),
            }),
        );
        Ok(())
    }

    fn slot(&self, identity: &str) -> Result<Arc<UnitSlot>, RegistryError> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentity(identity.to_string()))
    }

    fn slots(&self) -> Vec<Arc<UnitSlot>> {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        let mut slots: Vec<Arc<UnitSlot>> = units.values().cloned().collect();
        slots.sort_by(|a, b| a.unit.identity().cmp(b.unit.identity()));
        slots
    }

    /// Bring a unit to Running. Repeating the call on a running unit is a
    /// no-op; a paused unit is resumed.
    pub async fn start(&self, identity: &str) -> Result<(), RegistryError> {
        let slot = self.slot(identity)?;
        let mut control = slot.control.lock().await;

        let current = *slot.state.borrow();
        match current {
            ListenerState::Running => {
                debug!("Listener '{}' already running", identity);
                return Ok(());
            }
            ListenerState::Paused => {
                if let Some(command) = &control.command {
                    command.send_replace(Command::Run);
                    slot.state.send_replace(ListenerState::Running);
                    info!("▶️ Listener '{}' resumed", identity);
                    return Ok(());
                }
            }
            _ => {}
        }

        // A container that outlived an earlier stop timeout must finish first
        if let Some(mut task) = control.task.take() {
            if let Some(command) = &control.command {
                command.send_replace(Command::Stop);
            }
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                control.task = Some(task);
                return Err(RegistryError::StopTimeout {
                    identity: identity.to_string(),
                    timeout: self.stop_timeout,
                });
            }
        }
        control.command = None;

        slot.state.send_replace(ListenerState::Starting);
        let subscription = match self.broker.subscribe(slot.unit.topics(), slot.unit.group_id()).await {
            Ok(subscription) => subscription,
            Err(source) => {
                slot.state.send_replace(ListenerState::Stopped);
                error!("❌ Listener '{}' could not subscribe: {}", identity, source);
                return Err(RegistryError::Subscribe {
                    identity: identity.to_string(),
                    source,
                });
            }
        };

        let (command_tx, command_rx) = watch::channel(Command::Run);
        let container = Container {
            unit: slot.unit.clone(),
            dispatcher: self.dispatcher.clone(),
            retry: self.retry.clone(),
            dead_letter: self.dead_letter.clone(),
            state: slot.state.clone(),
        };
        control.task = Some(tokio::spawn(container.run(subscription, command_rx)));
        control.command = Some(command_tx);
        slot.state.send_replace(ListenerState::Running);

        info!("🚀 Listener '{}' started on {}", identity, self.broker.broker_type());
        Ok(())
    }

    /// Stop a unit and release its subscription. An in-flight delivery is
    /// allowed to finish within the shutdown timeout.
    pub async fn stop(&self, identity: &str) -> Result<(), RegistryError> {
        let slot = self.slot(identity)?;
        let mut control = slot.control.lock().await;

        let Some(mut task) = control.task.take() else {
            slot.state.send_replace(ListenerState::Stopped);
            debug!("Listener '{}' already stopped", identity);
            return Ok(());
        };

        slot.state.send_replace(ListenerState::Stopping);
        if let Some(command) = &control.command {
            command.send_replace(Command::Stop);
        }

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("⚠️ Listener '{}' container ended abnormally: {}", identity, e),
            Err(_) => {
                warn!("⏰ Listener '{}' did not stop within {:?}", identity, self.stop_timeout);
                control.task = Some(task);
                return Err(RegistryError::StopTimeout {
                    identity: identity.to_string(),
                    timeout: self.stop_timeout,
                });
            }
        }

        control.command = None;
        slot.state.send_replace(ListenerState::Stopped);
        info!("🛑 Listener '{}' stopped", identity);
        Ok(())
    }

    /// Stop fetching while keeping the partition assignment
    pub async fn pause(&self, identity: &str) -> Result<(), RegistryError> {
        let slot = self.slot(identity)?;
        let control = slot.control.lock().await;

        let current = *slot.state.borrow();
        if current != ListenerState::Running {
            debug!("Listener '{}' is {}, nothing to pause", identity, current);
            return Ok(());
        }
        if let Some(command) = &control.command {
            command.send_replace(Command::Pause);
            slot.state.send_replace(ListenerState::Paused);
            info!("⏸️ Listener '{}' paused", identity);
        }
        Ok(())
    }

    pub async fn resume(&self, identity: &str) -> Result<(), RegistryError> {
        let slot = self.slot(identity)?;
        let control = slot.control.lock().await;

        let current = *slot.state.borrow();
        if current != ListenerState::Paused {
            debug!("Listener '{}' is {}, nothing to resume", identity, current);
            return Ok(());
        }
        if let Some(command) = &control.command {
            command.send_replace(Command::Run);
            slot.state.send_replace(ListenerState::Running);
            info!("▶️ Listener '{}' resumed", identity);
        }
        Ok(())
    }

    pub fn state(&self, identity: &str) -> Result<ListenerState, RegistryError> {
        Ok(*self.slot(identity)?.state.borrow())
    }

    /// Follow state changes of one unit
    pub fn watch_state(&self, identity: &str) -> Result<watch::Receiver<ListenerState>, RegistryError> {
        Ok(self.slot(identity)?.state.subscribe())
    }

    pub fn is_running(&self, identity: &str) -> bool {
        matches!(self.state(identity), Ok(ListenerState::Running))
    }

    /// Registered identities, sorted
    pub fn identities(&self) -> Vec<String> {
        self.slots()
            .iter()
            .map(|slot| slot.unit.identity().to_string())
            .collect()
    }

    /// Start every unit flagged for automatic startup
    pub async fn start_auto_startup(&self) -> Result<(), RegistryError> {
        for slot in self.slots() {
            if slot.unit.auto_start() {
                self.start(slot.unit.identity()).await?;
            } else {
                debug!("Listener '{}' waits for an explicit start", slot.unit.identity());
            }
        }
        Ok(())
    }

    /// Stop every unit, continuing past failures. Returns the first error.
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        info!("🛑 Stopping all listeners");
        let mut first_error = None;
        for slot in self.slots() {
            if let Err(e) = self.stop(slot.unit.identity()).await {
                error!("❌ {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("✅ All listeners stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AckMode, BrokerConfig, ProducerConfig};
    use crate::handler::{handler_fn, MessageHandlers};
    use crate::memory_broker::MemoryBroker;
    use crate::producer::ProducerFacade;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with(broker: &MemoryBroker, stop_timeout: Duration) -> ListenerRegistry {
        let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());
        let producer = ProducerFacade::new(client.clone(), &ProducerConfig::default());
        let dispatcher = Arc::new(Dispatcher::new(producer, AckMode::Manual));
        ListenerRegistry::new(client, dispatcher, RetryConfig::default(), stop_timeout)
    }

    fn unit(identity: &str, topic: &str) -> ListenerUnit {
        ListenerUnit::new(
            identity,
            vec![topic.to_string()],
            "testGroup",
            MessageHandlers::acknowledging(identity),
        )
    }

    async fn wait_for_commit(broker: &MemoryBroker, topic: &str, offset: u64) {
        for _ in 0..200 {
            if broker.committed_offset("testGroup", topic, 0) == Some(offset) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("commit of {} never reached {}", topic, offset);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_identity() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));

        registry.register(unit("group1", "testTopic")).unwrap();
        let err = registry.register(unit("group1", "other")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentity(ref id) if id == "group1"));
        assert_eq!(registry.identities(), vec!["group1".to_string()]);
    }

    #[tokio::test]
    async fn test_control_calls_on_unknown_identity() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));

        assert!(matches!(registry.start("ghost").await, Err(RegistryError::UnknownIdentity(_))));
        assert!(matches!(registry.stop("ghost").await, Err(RegistryError::UnknownIdentity(_))));
        assert!(matches!(registry.pause("ghost").await, Err(RegistryError::UnknownIdentity(_))));
        assert!(matches!(registry.state("ghost"), Err(RegistryError::UnknownIdentity(_))));
        assert!(!registry.is_running("ghost"));
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        registry.register(unit("listener1", "test")).unwrap();

        registry.start("listener1").await.unwrap();
        assert_eq!(registry.state("listener1").unwrap(), ListenerState::Running);
        registry.start("listener1").await.unwrap();
        assert_eq!(registry.state("listener1").unwrap(), ListenerState::Running);
        assert_eq!(broker.group_members("testGroup"), 1);

        registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_start_false_waits_for_explicit_start() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        registry.register(unit("listener1", "test").with_auto_start(false)).unwrap();
        registry.register(unit("group2", "testTopic")).unwrap();

        registry.start_auto_startup().await.unwrap();
        assert_eq!(registry.state("listener1").unwrap(), ListenerState::Stopped);
        assert!(registry.is_running("group2"));

        registry.start("listener1").await.unwrap();
        assert!(registry.is_running("listener1"));

        registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_subscription_and_restart_resumes() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        registry.register(unit("group2", "testTopic")).unwrap();

        registry.start("group2").await.unwrap();
        let _ = broker.send("testTopic", None, "one".to_string());
        wait_for_commit(&broker, "testTopic", 1).await;

        registry.stop("group2").await.unwrap();
        assert_eq!(registry.state("group2").unwrap(), ListenerState::Stopped);
        assert_eq!(broker.group_members("testGroup"), 0);

        let _ = broker.send("testTopic", None, "two".to_string());
        registry.start("group2").await.unwrap();
        wait_for_commit(&broker, "testTopic", 2).await;

        // Stopping twice is harmless
        registry.stop("group2").await.unwrap();
        registry.stop("group2").await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_keeps_assignment_and_resume_continues() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        registry
            .register(ListenerUnit::new(
                "group2",
                vec!["testTopic".to_string()],
                "testGroup",
                handler_fn(move |_record, token: crate::ack::AcknowledgmentToken| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        token.commit()?;
                        anyhow::Ok(())
                    }
                }),
            ))
            .unwrap();

        registry.start("group2").await.unwrap();
        registry.pause("group2").await.unwrap();
        assert_eq!(registry.state("group2").unwrap(), ListenerState::Paused);
        assert_eq!(broker.group_members("testGroup"), 1);

        let _ = broker.send("testTopic", None, "held".to_string());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // start on a paused unit resumes it
        registry.start("group2").await.unwrap();
        assert!(registry.is_running("group2"));
        wait_for_commit(&broker, "testTopic", 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.pause("group2").await.unwrap();
        registry.resume("group2").await.unwrap();
        assert!(registry.is_running("group2"));

        registry.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume_on_stopped_unit_are_noops() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        registry.register(unit("idle", "t")).unwrap();

        registry.pause("idle").await.unwrap();
        registry.resume("idle").await.unwrap();
        assert_eq!(registry.state("idle").unwrap(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_timeout_keeps_container_for_next_start() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_millis(20));
        registry
            .register(ListenerUnit::new(
                "slow",
                vec!["t".to_string()],
                "testGroup",
                handler_fn(|_record, token: crate::ack::AcknowledgmentToken| async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    token.commit()?;
                    anyhow::Ok(())
                }),
            ))
            .unwrap();

        registry.start("slow").await.unwrap();
        let _ = broker.send("t", None, "v".to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry.stop("slow").await.unwrap_err();
        assert!(matches!(err, RegistryError::StopTimeout { .. }));
        assert_eq!(registry.state("slow").unwrap(), ListenerState::Stopping);

        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.stop("slow").await.unwrap();
        assert_eq!(registry.state("slow").unwrap(), ListenerState::Stopped);
        assert_eq!(broker.committed_offset("testGroup", "t", 0), Some(1));
    }

    #[tokio::test]
    async fn test_watch_state_sees_transitions() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = registry_with(&broker, Duration::from_secs(1));
        registry.register(unit("w", "t")).unwrap();

        let mut states = registry.watch_state("w").unwrap();
        registry.start("w").await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ListenerState::Running);

        registry.stop("w").await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_control_on_distinct_identities() {
        let broker = MemoryBroker::new(BrokerConfig::default());
        let registry = Arc::new(registry_with(&broker, Duration::from_secs(1)));
        for i in 0..8 {
            registry.register(unit(&format!("unit-{}", i), "t")).unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let identity = format!("unit-{}", i);
                registry.start(&identity).await.unwrap();
                registry.start(&identity).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(registry.identities().iter().all(|id| registry.is_running(id)));
        registry.stop_all().await.unwrap();
        assert_eq!(broker.group_members("testGroup"), 0);
    }
}
