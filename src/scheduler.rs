use crate::{Error, Result, ScheduleConfig};
use async_trait::async_trait;
use chrono::DateTime;
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Work triggered by the scheduler.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Wall-clock recurrence: a minute and hour on selected weekdays, in a fixed timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTrigger {
    pub minute: u32,
    pub hour: u32,
    /// Cron day-of-week field, e.g. `*` or `Mon-Fri`.
    pub days_of_week: String,
    pub timezone: Tz,
}

impl ScheduleTrigger {
    pub fn from_config(config: &ScheduleConfig) -> Result<ScheduleTrigger> {
        if config.minute > 59 {
            return Err(Error::Schedule(format!("minute {} out of range", config.minute)));
        }

        if config.hour > 23 {
            return Err(Error::Schedule(format!("hour {} out of range", config.hour)));
        }

        let days_of_week = config.days_of_week.trim();
        if days_of_week.is_empty() || days_of_week.contains(char::is_whitespace) {
            return Err(Error::Schedule(format!(
                "invalid days of week `{}`",
                config.days_of_week
            )));
        }

        Ok(ScheduleTrigger {
            minute: config.minute,
            hour: config.hour,
            days_of_week: days_of_week.to_owned(),
            timezone: config.timezone,
        })
    }

    /// Six-field cron expression (`sec min hour day-of-month month day-of-week`).
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * {}", self.minute, self.hour, self.days_of_week)
    }
}

/// What happened to a single firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringOutcome {
    Completed,
    Failed,
    /// The previous firing was still running.
    Skipped,
}

/// Runs the job for each firing. At most one run is in flight at a time.
struct Firing {
    job: Arc<dyn ScheduledJob>,
    running: AtomicBool,
}

/// Clears the running flag even if the job panics.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Firing {
    fn new(job: Arc<dyn ScheduledJob>) -> Firing {
        Firing {
            job,
            running: AtomicBool::new(false),
        }
    }

    async fn fire(&self) -> FiringOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("previous agenda run still in progress, skipping this firing");
            return FiringOutcome::Skipped;
        }

        let _guard = RunningGuard(&self.running);

        match self.job.run().await {
            Ok(()) => {
                log::debug!("scheduled agenda run finished");
                FiringOutcome::Completed
            }
            Err(err) => {
                log::error!("scheduled agenda run failed: {err}");
                FiringOutcome::Failed
            }
        }
    }
}

struct RunningSchedule {
    scheduler: JobScheduler,
    job_id: Uuid,
}

/// Fires a [`ScheduledJob`] on a cron schedule until stopped.
///
/// Failures of a firing are logged and never stop the schedule. Stopping only cancels future
/// firings, a run that is in flight completes.
pub struct AgendaScheduler {
    cron_expression: String,
    timezone: Tz,
    firing: Arc<Firing>,
    running: Option<RunningSchedule>,
}

impl AgendaScheduler {
    pub fn new(trigger: &ScheduleTrigger, job: Arc<dyn ScheduledJob>) -> AgendaScheduler {
        AgendaScheduler::with_cron_expression(trigger.cron_expression(), trigger.timezone, job)
    }

    pub fn with_cron_expression(
        cron_expression: impl Into<String>,
        timezone: Tz,
        job: Arc<dyn ScheduledJob>,
    ) -> AgendaScheduler {
        AgendaScheduler {
            cron_expression: cron_expression.into(),
            timezone,
            firing: Arc::new(Firing::new(job)),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::warn!("agenda scheduler already running");
            return Ok(());
        }

        let mut scheduler = JobScheduler::new().await?;

        let firing = self.firing.clone();
        let job = Job::new_async_tz(
            self.cron_expression.as_str(),
            self.timezone,
            move |_id, _lock| {
                let firing = firing.clone();
                Box::pin(async move {
                    firing.fire().await;
                })
            },
        )?;

        let job_id = scheduler.add(job).await?;
        scheduler.start().await?;

        log::info!(
            "agenda scheduled at `{}` ({})",
            self.cron_expression,
            self.timezone
        );

        self.running = Some(RunningSchedule { scheduler, job_id });

        match self.next_run().await {
            Ok(Some(next)) => log::info!("next agenda run at {next}"),
            Ok(None) => log::warn!("agenda schedule has no upcoming run"),
            Err(err) => log::warn!("failed to compute next agenda run: {err}"),
        }

        Ok(())
    }

    /// The next firing in the trigger's timezone, `None` if the scheduler is stopped.
    pub async fn next_run(&mut self) -> Result<Option<DateTime<Tz>>> {
        let Some(running) = self.running.as_mut() else {
            return Ok(None);
        };

        let next = running
            .scheduler
            .next_tick_for_job(running.job_id)
            .await?;

        Ok(next.map(|tick| tick.with_timezone(&self.timezone)))
    }

    pub async fn stop(&mut self) -> Result<()> {
        let Some(RunningSchedule { mut scheduler, .. }) = self.running.take() else {
            return Ok(());
        };

        scheduler.shutdown().await?;
        log::info!("agenda scheduler stopped");
        Ok(())
    }
}

impl Drop for AgendaScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            log::warn!("agenda scheduler dropped while running");
        }
    }
}
