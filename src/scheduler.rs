use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::dispatcher::{AiEvent, AiEventType};
use crate::rng::RandomSource;
use crate::roles::{ProactiveConfig, RoleProfile, RoleStore};
use crate::tasks::{ScheduledTask, TaskStore};

const MOMENT_JOB_ID: &str = "moment_check";

/// Whether `hour` falls inside the quiet window `[start, end)`. The window
/// may wrap midnight; `start == end` means no quiet hours at all.
pub fn in_quiet_hours(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// When the next proactive message should fire: `interval_minutes` from now,
/// pushed to the end of quiet hours when it would land inside them.
pub fn next_proactive_run(
    now: NaiveDateTime,
    config: &ProactiveConfig,
    interval_minutes: i64,
) -> NaiveDateTime {
    let candidate = now + ChronoDuration::minutes(interval_minutes);
    if !in_quiet_hours(
        candidate.hour(),
        config.quiet_hours_start,
        config.quiet_hours_end,
    ) {
        return candidate;
    }
    let mut deferred = candidate
        .date()
        .and_hms_opt(config.quiet_hours_end, 0, 0)
        .unwrap_or(candidate);
    if deferred <= candidate {
        deferred += ChronoDuration::days(1);
    }
    deferred
}

/// Owns every background job: self-renewing proactive timers, one-shot task
/// timers and the periodic moment check. Jobs are plain tokio tasks keyed by
/// id; rescheduling a key aborts its predecessor.
pub struct SchedulerContext {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    events: flume::Sender<AiEvent>,
    roles: Arc<RoleStore>,
    tasks: Arc<TaskStore>,
    config: Arc<AppConfig>,
    rng: Arc<dyn RandomSource>,
}

impl SchedulerContext {
    pub fn new(
        events: flume::Sender<AiEvent>,
        roles: Arc<RoleStore>,
        tasks: Arc<TaskStore>,
        config: Arc<AppConfig>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            events,
            roles,
            tasks,
            config,
            rng,
        }
    }

    /// Register the initial job set from persisted state.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        for role in self.roles.list()? {
            if role.proactive_config.enabled {
                self.schedule_proactive_for_role(role);
            }
        }
        for task in self.tasks.load()? {
            self.schedule_task(task);
        }
        self.start_moment_loop();
        let count = self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0);
        tracing::info!("Scheduler started with {} jobs", count);
        Ok(())
    }

    fn insert_job(&self, id: String, handle: JoinHandle<()>) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(previous) = jobs.insert(id, handle) {
                previous.abort();
            }
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Arm (or re-arm) the proactive timer for one role. Each firing sends
    /// a proactive event and schedules the next run with a fresh random
    /// interval.
    pub fn schedule_proactive_for_role(self: &Arc<Self>, role: RoleProfile) {
        let config = &role.proactive_config;
        let interval = self.rng.range_i64(
            config.min_interval_minutes as i64,
            config.max_interval_minutes as i64,
        );
        let next = next_proactive_run(Local::now().naive_local(), config, interval);
        let delay = (next - Local::now().naive_local())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tracing::debug!(
            "Proactive message for role '{}' scheduled in {:?}",
            role.id,
            delay
        );

        let scheduler = Arc::clone(self);
        let job_id = format!("proactive_{}", role.id);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = AiEvent::new(&role.id, AiEventType::Proactive);
            if scheduler.events.send_async(event).await.is_err() {
                tracing::warn!("Event channel closed, dropping proactive timer");
                return;
            }
            // Reload so profile edits take effect between firings.
            match scheduler.roles.load(&role.id) {
                Ok(Some(fresh)) if fresh.proactive_config.enabled => {
                    scheduler.schedule_proactive_for_role(fresh);
                }
                Ok(_) => tracing::debug!("Proactive timer for '{}' not renewed", role.id),
                Err(error) => {
                    tracing::warn!("Failed to reload role '{}': {}", role.id, error);
                }
            }
        });
        self.insert_job(job_id, handle);
    }

    /// Arm a one-shot task timer. Tasks whose trigger time already passed
    /// are skipped; a `repeat` field is accepted but not honored, each task
    /// fires at most once per registration.
    pub fn schedule_task(self: &Arc<Self>, task: ScheduledTask) {
        if !task.enabled {
            return;
        }
        let Some(trigger) = task.trigger_time_local() else {
            tracing::warn!(
                "Task '{}' has unparseable trigger time '{}', skipping",
                task.id,
                task.trigger_time
            );
            return;
        };
        let delay = match (trigger - Local::now()).to_std() {
            Ok(delay) => delay,
            Err(_) => {
                tracing::debug!("Task '{}' trigger time already passed, skipping", task.id);
                return;
            }
        };
        if task.repeat.is_some() {
            tracing::warn!(
                "Task '{}' requests repeat '{}'; tasks fire once only",
                task.id,
                task.repeat.as_deref().unwrap_or_default()
            );
        }

        let scheduler = Arc::clone(self);
        let job_id = format!("task_{}", task.id);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = AiEvent::new(&task.role_id, AiEventType::Task)
                .with_content(task.prompt().to_string())
                .with_context_value("task_id", serde_json::json!(task.id));
            if scheduler.events.send_async(event).await.is_err() {
                tracing::warn!("Event channel closed, dropping task '{}'", task.id);
            }
        });
        self.insert_job(job_id, handle);
    }

    fn start_moment_loop(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let interval =
            Duration::from_secs(self.config.scheduler.moment_check_interval_hours * 3600);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                scheduler.moment_tick().await;
            }
        });
        self.insert_job(MOMENT_JOB_ID.to_string(), handle);
    }

    /// One roll of the moment dice: sometimes a random role posts.
    pub async fn moment_tick(&self) {
        if !self.rng.chance(self.config.scheduler.moment_post_probability) {
            return;
        }
        let roles = match self.roles.list() {
            Ok(roles) if !roles.is_empty() => roles,
            Ok(_) => return,
            Err(error) => {
                tracing::warn!("Role listing failed during moment check: {}", error);
                return;
            }
        };
        let chosen = &roles[self.rng.pick(roles.len())];
        tracing::info!("Role '{}' is posting a moment", chosen.id);
        let event = AiEvent::new(&chosen.id, AiEventType::MomentPost);
        if self.events.send_async(event).await.is_err() {
            tracing::warn!("Event channel closed, dropping moment post");
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            for (_, handle) in jobs.drain() {
                handle.abort();
            }
        }
    }
}
