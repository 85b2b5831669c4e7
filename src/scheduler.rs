//! Periodic and daily task runner.
//!
//! A single loop ticks at a fixed cadence and spawns every enabled task that is
//! due onto a [`TaskTracker`]. A task never overlaps with itself: while a run
//! is in flight the task is skipped. Failures (including panics) are counted
//! and logged; they never stop the loop or disable the task.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Due when never run or when the interval has elapsed since the last run.
    Interval(Duration),
    /// Due once per UTC calendar day, at or after the given time.
    Daily(NaiveTime),
}

impl Schedule {
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        // ---
        match *self {
            Schedule::Interval(every) => last_run.map_or(true, |last| {
                (now - last).to_std().map_or(false, |elapsed| elapsed >= every)
            }),
            Schedule::Daily(at) => {
                now.time() >= at
                    && last_run.map_or(true, |last| last.date_naive() < now.date_naive())
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            Schedule::Daily(at) => write!(f, "daily at {}", at.format("%H:%M")),
        }
    }
}

struct ScheduledTask {
    schedule: Schedule,
    callback: TaskFn,
    enabled: bool,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
    error_count: u64,
}

/// Snapshot of one task's registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
}

struct Registry {
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
    tracker: TaskTracker,
}

impl Registry {
    fn tasks(&self) -> MutexGuard<'_, BTreeMap<String, ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Spawn every enabled, idle task that is due at `now`.
    fn run_due(self: &Arc<Self>, now: DateTime<Utc>) {
        // ---
        let mut tasks = self.tasks();
        for (name, task) in tasks.iter_mut() {
            if !task.enabled || task.running || !task.schedule.is_due(task.last_run, now) {
                continue;
            }
            task.running = true;
            // Intervals count from run start
            task.last_run = Some(now);

            let registry = Arc::clone(self);
            let name = name.clone();
            let run = (task.callback)();
            debug!(task = %name, "Running scheduled task");

            self.tracker.spawn(async move {
                // Inner spawn turns a panic into a JoinError
                let outcome = match tokio::spawn(run).await {
                    Ok(result) => result,
                    Err(err) => Err(anyhow::anyhow!("task panicked: {err}")),
                };
                registry.finish(&name, outcome);
            });
        }
    }

    fn finish(&self, name: &str, outcome: anyhow::Result<()>) {
        // ---
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(name) else {
            return;
        };
        task.running = false;
        task.run_count += 1;

        if let Err(err) = outcome {
            task.error_count += 1;
            error!(task = name, errors = task.error_count, error = %err, "Scheduled task failed");
        }
    }
}

// ---

pub struct Scheduler {
    // ---
    registry: Arc<Registry>,
    tick: Duration,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                tasks: Mutex::new(BTreeMap::new()),
                tracker: TaskTracker::new(),
            }),
            tick,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    fn insert<F, Fut>(&self, name: &str, schedule: Schedule, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ---
        let callback: TaskFn = Arc::new(move || Box::pin(f()));
        let task = ScheduledTask {
            schedule,
            callback,
            enabled: true,
            running: false,
            last_run: None,
            run_count: 0,
            error_count: 0,
        };
        self.registry.tasks().insert(name.to_string(), task);
        info!(task = name, %schedule, "Task scheduled");
    }

    /// Register (or replace) a task that runs every `every`.
    pub fn add_interval<F, Fut>(&self, name: &str, every: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(name, Schedule::Interval(every), f);
    }

    /// Register (or replace) a task that runs once a day at `at` (UTC).
    pub fn add_daily<F, Fut>(&self, name: &str, at: NaiveTime, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(name, Schedule::Daily(at), f);
    }

    pub fn remove_task(&self, name: &str) -> bool {
        self.registry.tasks().remove(name).is_some()
    }

    pub fn enable_task(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_task(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        // ---
        match self.registry.tasks().get_mut(name) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.registry
            .tasks()
            .get(name)
            .map(|task| status_of(name, task))
    }

    pub fn all_tasks(&self) -> Vec<TaskStatus> {
        self.registry
            .tasks()
            .iter()
            .map(|(name, task)| status_of(name, task))
            .collect()
    }

    /// Start the polling loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        // ---
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let tick = self.tick;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => registry.run_due(Utc::now()),
                }
            }
        }));
        info!(tick_ms = tick.as_millis() as u64, "Scheduler started");
    }

    /// Stop the loop and wait for in-flight task runs to finish.
    pub async fn stop(&self) {
        // ---
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "Scheduler loop failed");
            }
        }
        self.registry.tracker.close();
        self.registry.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

fn status_of(name: &str, task: &ScheduledTask) -> TaskStatus {
    TaskStatus {
        name: name.to_string(),
        schedule: task.schedule.to_string(),
        enabled: task.enabled,
        running: task.running,
        last_run: task.last_run,
        run_count: task.run_count,
        error_count: task.error_count,
    }
}
