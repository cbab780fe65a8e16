use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::ScheduleError;

/// Zero-argument periodic callback
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn job_fn<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Invokes registered jobs at computed instants
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `job` at every instant matched by a cron trigger
    fn register_periodic(&self, name: &str, trigger: &str, job: Job) -> Result<(), ScheduleError>;

    /// Run `job` every `period`, first after `initial_delay`
    fn register_fixed_rate(&self, name: &str, initial_delay: Duration, period: Duration, job: Job) -> Result<(), ScheduleError>;

    /// Stop triggering and wait for running jobs to finish
    async fn shutdown(&self);
}

/// Rewrite a Quartz-style trigger into what the `cron` crate parses.
///
/// Accepts six or seven fields; `?` becomes `*`. The `L`, `W` and `#` day
/// modifiers are not supported.
pub fn normalize_trigger(expression: &str) -> Result<String, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidTrigger {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 6 && fields.len() != 7 {
        return Err(invalid("expected 6 or 7 fields"));
    }

    if fields.iter().any(|f| f.contains('#')) {
        return Err(invalid("'#' day-of-week modifier is not supported"));
    }
    if fields[3].contains('L') || fields[3].contains('W') {
        return Err(invalid("'L' and 'W' day-of-month modifiers are not supported"));
    }
    let last_weekday = fields[5].split(',').any(|part| {
        part == "L"
            || (part.len() > 1
                && part.ends_with('L')
                && part[..part.len() - 1].chars().all(|c| c.is_ascii_digit()))
    });
    if last_weekday {
        return Err(invalid("'L' day-of-week modifier is not supported"));
    }

    Ok(fields
        .iter()
        .map(|f| if *f == "?" { "*" } else { *f })
        .collect::<Vec<_>>()
        .join(" "))
}

pub fn parse_trigger(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize_trigger(expression)?;
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidTrigger {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Tokio scheduler driven by cron expressions
pub struct CronScheduler {
    shutdown_tx: broadcast::Sender<()>,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CronScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<(), ScheduleError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ScheduleError::SchedulerStopped);
        }
        Ok(())
    }
}

/// Start one run of `job` unless the previous run is still going
fn fire(name: &str, job: &Job, running: &Arc<AtomicBool>, tracker: &TaskTracker) {
    if running.swap(true, Ordering::AcqRel) {
        warn!("⏭️ Job '{}' still running, skipping this trigger", name);
        return;
    }

    let name = name.to_string();
    let run = job();
    let running = running.clone();
    tracker.spawn(async move {
        debug!("⏰ Running job '{}'", name);
        if let Err(e) = run.await {
            error!("❌ Job '{}' failed: {:#}", name, e);
        }
        running.store(false, Ordering::Release);
    });
}

#[async_trait]
impl Scheduler for CronScheduler {
    fn register_periodic(&self, name: &str, trigger: &str, job: Job) -> Result<(), ScheduleError> {
        self.ensure_running()?;
        let schedule = parse_trigger(trigger)?;

        let name = name.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tracker = self.tracker.clone();
        let running = Arc::new(AtomicBool::new(false));
        info!("📅 Scheduled job '{}' with trigger '{}'", name, trigger);

        self.tracker.spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    debug!("Trigger of job '{}' has no further instants", name);
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                fire(&name, &job, &running, &tracker);
            }
        });
        Ok(())
    }

    fn register_fixed_rate(&self, name: &str, initial_delay: Duration, period: Duration, job: Job) -> Result<(), ScheduleError> {
        self.ensure_running()?;
        if period.is_zero() {
            return Err(ScheduleError::InvalidTrigger {
                expression: format!("every {:?}", period),
                reason: "period must be greater than zero".to_string(),
            });
        }

        let name = name.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tracker = self.tracker.clone();
        let running = Arc::new(AtomicBool::new(false));
        info!("📅 Scheduled job '{}' every {:?}", name, period);

        self.tracker.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticks.tick() => fire(&name, &job, &running, &tracker),
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 Stopping scheduler");
        let _ = self.shutdown_tx.send(());
        self.tracker.close();
        self.tracker.wait().await;
        info!("✅ Scheduler stopped");
    }
}
