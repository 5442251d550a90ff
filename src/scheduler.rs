//! Timer-driven still capture for the bound project.
//!
//! The scheduler lives for the whole process. Projects are bound and
//! unbound with [`Scheduler::begin`] and [`Scheduler::stop`]; a background
//! task owns the ticker and captures through the [`Arbiter`] on every tick.
//! Errors never stop the loop: a failing device shows up as missed
//! intervals.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbiter::Arbiter;
use crate::traits::Resolution;

/// Shortest period the ticker accepts.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A time-lapse project receiving scheduled captures.
///
/// Implementations own their storage; the scheduler only appends images and
/// closes the project once it is no longer bound.
pub trait Project: Send + Sync {
    /// Project name, for logging.
    fn name(&self) -> &str;

    /// Time between captures.
    fn interval(&self) -> Duration;

    /// Persist one captured image.
    fn save_image(&self, image: &[u8]) -> anyhow::Result<()>;

    /// Release the project's resources.
    fn close(&self) -> anyhow::Result<()>;
}

type Bound = Mutex<Option<Arc<dyn Project>>>;

/// Runs periodic captures while a project is bound.
pub struct Scheduler {
    project: Arc<Bound>,
    period: watch::Sender<Option<Duration>>,
    shutdown: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the scheduling loop. Captures are taken at `resolution`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(arbiter: Arc<Arbiter>, resolution: Resolution) -> Self {
        let project: Arc<Bound> = Arc::new(Mutex::new(None));
        let (period, period_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            Arc::clone(&project),
            arbiter,
            resolution,
            period_rx,
            shutdown.clone(),
        ));

        Self {
            project,
            period,
            shutdown,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Bind `project` and restart the ticker at its interval.
    ///
    /// A previously bound, different project is closed. Passing `None`
    /// behaves like [`stop`](Self::stop).
    pub async fn begin(&self, project: Option<Arc<dyn Project>>) {
        let Some(project) = project else {
            self.stop().await;
            return;
        };

        let mut bound = self.project.lock().await;
        if let Some(previous) = bound.take() {
            if !Arc::ptr_eq(&previous, &project) {
                close_project(previous).await;
            }
        }

        let interval = project.interval();
        info!(project = project.name(), ?interval, "scheduling captures");
        *bound = Some(project);
        self.period.send_replace(Some(interval));
    }

    /// Halt the ticker and unbind (and close) the current project.
    ///
    /// A tick holds the project for its whole capture and save, so this waits
    /// for a running tick to finish. A capture blocked on a stalled device
    /// blocks it too.
    pub async fn stop(&self) {
        let mut bound = self.project.lock().await;
        self.period.send_replace(None);
        if let Some(project) = bound.take() {
            info!(project = project.name(), "stopping scheduled captures");
            close_project(project).await;
        }
    }

    /// Currently bound project.
    ///
    /// Waits for a running tick to finish, like [`stop`](Self::stop).
    pub async fn project(&self) -> Option<Arc<dyn Project>> {
        self.project.lock().await.clone()
    }

    /// Terminate the loop for good and wait for it to exit.
    ///
    /// A project still bound at this point is closed by the loop.
    pub async fn clear(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "scheduler task failed");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    project: Arc<Bound>,
    arbiter: Arc<Arbiter>,
    resolution: Resolution,
    mut period: watch::Receiver<Option<Duration>>,
    shutdown: CancellationToken,
) {
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            changed = period.changed() => {
                if changed.is_err() {
                    break;
                }
                ticker = (*period.borrow_and_update()).map(new_ticker);
            }
            () = next_tick(ticker.as_mut()) => {
                capture_tick(&project, &arbiter, resolution).await;
            }
        }
    }

    if let Some(bound) = project.lock().await.take() {
        close_project(bound).await;
    }
    debug!("scheduler loop exited");
}

/// Ticker whose first tick is one period from now.
///
/// Ticks that come due while a capture is running are skipped, not queued.
fn new_ticker(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn capture_tick(project: &Bound, arbiter: &Arbiter, resolution: Resolution) {
    let bound = project.lock().await;
    let Some(project) = bound.as_ref() else {
        warn!("tick with no bound project, ignoring");
        return;
    };

    let image = match arbiter.capture(resolution.width, resolution.height).await {
        Ok(image) => image,
        Err(err) => {
            error!(project = project.name(), error = %err, "scheduled capture failed");
            return;
        }
    };

    let target = Arc::clone(project);
    let saved = tokio::task::spawn_blocking(move || target.save_image(&image)).await;
    match saved {
        Ok(Ok(())) => debug!(project = project.name(), "saved scheduled image"),
        Ok(Err(err)) => error!(project = project.name(), error = %err, "failed to save image"),
        Err(err) => error!(project = project.name(), error = %err, "save task failed"),
    }
}

async fn close_project(project: Arc<dyn Project>) {
    let name = project.name().to_owned();
    match tokio::task::spawn_blocking(move || project.close()).await {
        Ok(Ok(())) => debug!(project = %name, "project closed"),
        Ok(Err(err)) => warn!(project = %name, error = %err, "failed to close project"),
        Err(err) => error!(project = %name, error = %err, "close task failed"),
    }
}
