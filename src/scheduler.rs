use crate::cycle::CycleDriver;
use crate::error::{ConfigError, CycleError};
use crate::report::Reporter;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FIRE_CHANNEL_CAPACITY: usize = 16;

/// When cycles should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    Cron(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FireEvent {
    pub at: DateTime<Utc>,
}

/// Turns a [`Trigger`] into a stream of [`FireEvent`]s using tokio-cron-scheduler.
pub struct FireSource {
    scheduler: JobScheduler,
}

impl FireSource {
    /// Registers the job without starting it, so a bad schedule is reported before anything runs.
    pub async fn new(trigger: &Trigger) -> anyhow::Result<(Self, mpsc::Receiver<FireEvent>)> {
        let (tx, rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);
        let job = build_job(trigger, tx)?;

        let scheduler = JobScheduler::new().await?;
        scheduler.add(job).await?;
        Ok((Self { scheduler }, rx))
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Failed to shut down job scheduler: {}", e);
        }
    }
}

fn build_job(trigger: &Trigger, tx: mpsc::Sender<FireEvent>) -> Result<Job, ConfigError> {
    match trigger {
        Trigger::Interval(interval) => {
            info!("Executing update cycles every {:?}", interval);
            Job::new_repeated_async(*interval, move |_uuid, _l| {
                let tx = tx.clone();
                Box::pin(async move { send_fire_event(&tx) })
            })
            .map_err(|e| ConfigError::InvalidSchedule {
                expression: format!("every {:?}", interval),
                reason: e.to_string(),
            })
        }
        Trigger::Cron(expression) => {
            info!("Executing update cycles at cron schedule {}", expression);
            Job::new_async(expression.clone(), move |_uuid, _l| {
                let tx = tx.clone();
                Box::pin(async move { send_fire_event(&tx) })
            })
            .map_err(|e| ConfigError::InvalidSchedule {
                expression: expression.clone(),
                reason: e.to_string(),
            })
        }
    }
}

fn send_fire_event(tx: &mpsc::Sender<FireEvent>) {
    if let Err(e) = tx.try_send(FireEvent { at: Utc::now() }) {
        warn!("Could not deliver fire event: {}", e);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles_started: usize,
    pub fires_dropped: usize,
}

/// Runs one cycle per fire event, never two at once.
pub struct Scheduler {
    driver: Arc<CycleDriver>,
    reporter: Reporter,
}

impl Scheduler {
    pub fn new(driver: Arc<CycleDriver>, reporter: Reporter) -> Self {
        Self { driver, reporter }
    }

    /// Consumes fire events until `shutdown` is cancelled or the source closes.
    /// A fire event arriving while a cycle runs is dropped. On shutdown the
    /// in-flight cycle sees a cancelled child token and is awaited.
    pub async fn run(
        self,
        mut fires: mpsc::Receiver<FireEvent>,
        shutdown: CancellationToken,
    ) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut in_flight: Option<JoinHandle<()>> = None;
        self.reporter.set_scheduler_running(true).await;

        loop {
            let fire = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no further cycles will be scheduled");
                    break;
                }
                fire = fires.recv() => match fire {
                    Some(fire) => fire,
                    None => {
                        info!("Fire source closed, no further cycles will be scheduled");
                        break;
                    }
                },
            };

            if let Some(handle) = in_flight.take() {
                if !handle.is_finished() {
                    warn!(
                        "Previous cycle is still running, dropping fire event from {}",
                        fire.at.to_rfc3339()
                    );
                    stats.fires_dropped += 1;
                    in_flight = Some(handle);
                    continue;
                }
                if let Err(e) = handle.await {
                    error!("Cycle task ended abnormally: {}", e);
                }
            }

            stats.cycles_started += 1;
            info!("Starting update cycle fired at {}", fire.at.to_rfc3339());
            in_flight = Some(self.spawn_cycle(shutdown.child_token()));
        }
        self.reporter.set_scheduler_running(false).await;

        if let Some(handle) = in_flight {
            if !handle.is_finished() {
                info!("Waiting for the in-flight cycle to finish");
            }
            if let Err(e) = handle.await {
                error!("Cycle task ended abnormally: {}", e);
            }
        }
        stats
    }

    fn spawn_cycle(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let driver = self.driver.clone();
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            match driver.run(&cancel).await {
                Ok(report) => {
                    reporter.report(&report).await;
                }
                Err(CycleError::Cancelled) => info!("Cycle cancelled before discovery"),
                Err(e) => reporter.report_aborted(&e).await,
            }
        })
    }
}
