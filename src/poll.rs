//! Scheduler loop: decides when a poll cycle runs.
//!
//! Cycles start from two places: a fixed-interval timer inside the loop, and
//! [`SchedulerHandle::trigger_now`] for "run now" requests.  Both claim the
//! job's single run slot with a compare-and-set, so at most one cycle is ever
//! in flight.  A timer tick that finds a cycle running is dropped, and a
//! manual trigger in the same situation returns
//! [`Trigger::AlreadyRunning`] straight away instead of queueing.
//!
//! A manual run also restarts the timer, so the next scheduled cycle comes a
//! full interval after it.
//!
//! ## For contributors
//!
//! Each cycle runs on its own task and reads one config snapshot for its
//! whole duration.  Shutdown ends the loop but never aborts a running cycle;
//! the cycle notices the same signal, stops picking up new work, and lets
//! its in-flight calls run out their timeouts.  Use [`Job::wait_idle`] to
//! wait for it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::Config;
use crate::job::{Job, RunGuard};

/// Result of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Accepted,
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler loop has stopped")]
    Stopped,
}

/// Cheap, cloneable access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    job: Arc<Job>,
    snapshots: watch::Receiver<Arc<Config>>,
    reset: mpsc::Sender<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.job.is_running()
    }

    /// Start a cycle now unless one is already in flight.
    pub fn trigger_now(&self) -> Result<Trigger, SchedulerError> {
        if self.reset.is_closed() {
            return Err(SchedulerError::Stopped);
        }

        let Some(guard) = self.job.try_begin() else {
            warn!("job is already running");
            return Ok(Trigger::AlreadyRunning);
        };

        // A full channel already holds a pending reset; one is enough.
        let _ = self.reset.try_send(());

        info!("manual trigger accepted");
        spawn_cycle(Arc::clone(&self.job), guard, self.snapshots.borrow().clone());
        Ok(Trigger::Accepted)
    }
}

/// Spawn the scheduler loop.
///
/// Returns a handle for manual triggers and the loop's task, which finishes
/// once `shutdown` turns true.
pub fn spawn(
    job: Arc<Job>,
    snapshots: watch::Receiver<Arc<Config>>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (reset_tx, reset_rx) = mpsc::channel(1);

    let handle = SchedulerHandle {
        job: Arc::clone(&job),
        snapshots: snapshots.clone(),
        reset: reset_tx,
    };
    let task = tokio::spawn(run_loop(job, snapshots, interval, reset_rx, shutdown));

    (handle, task)
}

async fn run_loop(
    job: Arc<Job>,
    snapshots: watch::Receiver<Arc<Config>>,
    interval: Duration,
    mut reset: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = interval.as_secs(), "scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(()) = reset.recv() => ticker.reset(),
            _ = ticker.tick() => match job.try_begin() {
                Some(guard) => spawn_cycle(Arc::clone(&job), guard, snapshots.borrow().clone()),
                None => warn!("job is already running, dropping scheduled tick"),
            },
        }
    }

    info!("scheduler stopped");
}

fn spawn_cycle(job: Arc<Job>, guard: RunGuard, config: Arc<Config>) {
    tokio::spawn(async move {
        let _guard = guard;
        job.run_cycle(&config).await;
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
