use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::Dispatcher;
use crate::error::ScheduleError;
use crate::handler::{Handler, HandlerCatalog};
use crate::http::{self, HttpState};
use crate::listener::ListenerUnit;
use crate::handle::{spawn_runner, ConnectorHandle};
use crate::memory_broker::MemoryBroker;
use crate::producer::ProducerFacade;
use crate::registry::ListenerRegistry;
use crate::scheduler::{job_fn, CronScheduler, Scheduler};

/// Trait for runner implementations to enable testing with mocks
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Run the connector until a system signal arrives
    async fn run(self) -> Result<()>;

    /// Run the connector until `shutdown_tx` fires or a system signal arrives
    async fn run_with_shutdown_signal(self, shutdown_tx: broadcast::Sender<()>) -> Result<()>;
}

/// What a scheduled job can reach
#[derive(Clone)]
pub struct JobContext {
    pub producer: ProducerFacade,
    pub registry: Arc<ListenerRegistry>,
}

/// Type alias for job callbacks registered by name
pub type JobFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static>;

/// Builder for configuring and running the connector
pub struct ConnectorRunner {
    config: Option<Config>,
    broker: Option<Arc<dyn BrokerClient>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    handlers: HandlerCatalog,
    jobs: Vec<(String, JobFn)>,
}

impl Default for ConnectorRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRunner {
    pub fn new() -> Self {
        Self {
            config: None,
            broker: None,
            scheduler: None,
            dead_letter: None,
            handlers: HandlerCatalog::new(),
            jobs: Vec::new(),
        }
    }

    /// Set configuration directly
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing broker client instead of a fresh in-memory broker
    pub fn with_broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Make a handler available to `listeners` entries under `name`
    pub fn add_handler(mut self, name: &str, handler: Handler) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    /// Register a job callback; its trigger comes from the `jobs` section
    pub fn add_job<F, Fut>(mut self, name: &str, job: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        debug!("📅 Adding job callback '{}'", name);
        let job_fn: JobFn = Arc::new(move |ctx| job(ctx).boxed());
        self.jobs.push((name.to_string(), job_fn));
        self
    }

    /// Check the configuration against the registered handlers and jobs
    fn validate(&self, config: &Config) -> Result<()> {
        config.validate()?;

        for (index, listener) in config.listeners.iter().enumerate() {
            if !self.handlers.contains(&listener.handler) {
                anyhow::bail!(
                    "listener '{}' names unknown handler '{}' (registered: {:?})",
                    config.identity_for(index, listener),
                    listener.handler,
                    self.handlers.names()
                );
            }
        }

        for (name, _) in &self.jobs {
            if config.get_job_trigger(name).is_none() {
                anyhow::bail!("job '{}' has no trigger in the jobs section", name);
            }
        }
        for name in config.jobs.keys() {
            if !self.jobs.iter().any(|(registered, _)| registered == name) {
                return Err(ScheduleError::UnknownJob(name.clone()).into());
            }
        }

        Ok(())
    }

    /// Wire everything up and start listeners, jobs and the HTTP entrypoint
    pub async fn start(mut self) -> Result<Connector> {
        let config = match self.config.take() {
            Some(config) => config,
            None => {
                return Err(anyhow::anyhow!(
                    "No configuration provided. Use .with_config(config) to set configuration before calling .run()"
                ));
            }
        };
        self.validate(&config).context("Invalid connector setup")?;

        let broker: Arc<dyn BrokerClient> = match self.broker.take() {
            Some(broker) => broker,
            None => Arc::new(MemoryBroker::new(config.broker.clone())),
        };
        let producer = ProducerFacade::new(broker.clone(), &config.producer);
        let dispatcher = Arc::new(Dispatcher::new(producer.clone(), config.consumers.ack_mode));

        let mut registry = ListenerRegistry::new(
            broker.clone(),
            dispatcher,
            config.retry.clone(),
            config.shutdown.timeout(),
        );
        if let Some(sink) = self.dead_letter.take() {
            registry = registry.with_dead_letter_sink(sink);
        }
        let registry = Arc::new(registry);

        for (index, listener) in config.listeners.iter().enumerate() {
            let handler = self
                .handlers
                .get(&listener.handler)
                .with_context(|| format!("handler '{}' disappeared", listener.handler))?;
            registry
                .register(ListenerUnit::from_config(&config, index, listener, handler))
                .context("Failed to register listeners")?;
        }
        registry
            .start_auto_startup()
            .await
            .context("Failed to start listeners")?;

        let scheduler: Arc<dyn Scheduler> = match self.scheduler.take() {
            Some(scheduler) => scheduler,
            None => Arc::new(CronScheduler::new()),
        };
        let context = JobContext {
            producer: producer.clone(),
            registry: registry.clone(),
        };
        for (name, job) in self.jobs.drain(..) {
            let trigger = config
                .get_job_trigger(&name)
                .with_context(|| format!("job '{}' has no trigger", name))?;
            let ctx = context.clone();
            scheduler
                .register_periodic(&name, trigger, job_fn(move || job(ctx.clone())))
                .with_context(|| format!("Failed to schedule job '{}'", name))?;
        }

        let (http_shutdown, _) = broadcast::channel(1);
        let http_task = if config.http.enabled {
            let http_config = config.http.clone();
            let state = HttpState::new(producer.clone(), &config.http);
            let shutdown_rx = http_shutdown.subscribe();
            Some(tokio::spawn(async move {
                http::serve(&http_config, state, shutdown_rx).await
            }))
        } else {
            None
        };

        info!(
            "✅ Connector '{}' started with {} listener(s) on {}",
            config.service.name,
            registry.identities().len(),
            broker.broker_type()
        );

        Ok(Connector {
            config,
            producer,
            registry,
            scheduler,
            http_shutdown,
            http_task,
        })
    }

    /// Run in the background and return a handle for shutdown
    pub fn run_background(self) -> ConnectorHandle {
        spawn_runner(self)
    }
}

#[async_trait::async_trait]
impl Runner for ConnectorRunner {
    async fn run(self) -> Result<()> {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
        self.run_with_shutdown_signal(shutdown_tx).await
    }

    async fn run_with_shutdown_signal(self, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connector = self.start().await?;

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("📡 Received external shutdown signal");
            }
            _ = crate::utils::setup_signal_handlers() => {
                info!("📡 Received system shutdown signal");
                let _ = shutdown_tx.send(());
            }
        }

        connector.shutdown().await
    }
}

/// A started connector
pub struct Connector {
    config: Config,
    producer: ProducerFacade,
    registry: Arc<ListenerRegistry>,
    scheduler: Arc<dyn Scheduler>,
    http_shutdown: broadcast::Sender<()>,
    http_task: Option<JoinHandle<Result<()>>>,
}

impl Connector {
    pub fn producer(&self) -> &ProducerFacade {
        &self.producer
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop jobs, the HTTP entrypoint and every listener, then flush the producer
    pub async fn shutdown(self) -> Result<()> {
        info!("🛑 Shutting down connector '{}'", self.config.service.name);

        self.scheduler.shutdown().await;

        if let Some(task) = self.http_task {
            let _ = self.http_shutdown.send(());
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("⚠️ HTTP entrypoint ended with error: {:#}", e),
                Err(e) => warn!("⚠️ HTTP entrypoint task failed: {}", e),
            }
        }

        let stopped = self.registry.stop_all().await;

        let grace = Duration::from_secs(self.config.shutdown.grace_period_secs as u64);
        if tokio::time::timeout(grace, self.producer.flush()).await.is_err() {
            error!("⏰ Producer flush did not finish within {:?}", grace);
        }

        stopped.context("Listeners did not stop cleanly")?;
        info!("✅ Connector shutdown complete");
        Ok(())
    }
}
