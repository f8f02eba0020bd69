//! Bounded-concurrency job execution.
//!
//! [`WorkerPool::run`] takes jobs in request order and returns one
//! [`TaskOutcome`] per job in that same order, whatever order they finish
//! in. Once a job fails or panics no further job is started; jobs already
//! running are left to complete. Every job runs on its own task, so a panic
//! never unwinds into the caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Resolves the requested degree of parallelism for `jobs` jobs.
///
/// `0` means sequential, a negative value means one worker per logical CPU.
/// The result never exceeds the job count and is at least 1.
pub fn resolve_parallelism(requested: i32, jobs: usize) -> usize {
    let dop = match requested {
        0 => 1,
        n if n < 0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n as usize,
    };
    dop.min(jobs).max(1)
}

/// Result of one submitted job.
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    /// The job ran to completion
    Completed(Result<T, E>),
    /// The job was not started because an earlier job failed
    Skipped,
    /// The job panicked
    Panicked(String),
}

impl<T, E> TaskOutcome<T, E> {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Completed(Err(_)) | TaskOutcome::Panicked(_))
    }
}

enum Slot<T, E> {
    Running(JoinHandle<Result<T, E>>),
    Skipped,
}

/// Runs jobs with at most `dop` in flight.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    dop: usize,
}

impl WorkerPool {
    pub fn new(dop: usize) -> Self {
        Self { dop: dop.max(1) }
    }

    pub fn dop(&self) -> usize {
        self.dop
    }

    /// Runs every job and returns outcomes in request order.
    ///
    /// With a degree of parallelism of 1 the jobs run one after another.
    pub async fn run<T, E, F, Fut>(&self, jobs: Vec<F>) -> Vec<TaskOutcome<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if self.dop <= 1 {
            return run_sequential(jobs).await;
        }

        debug!("Running {} jobs with parallelism {}", jobs.len(), self.dop);
        let semaphore = Arc::new(Semaphore::new(self.dop));
        let failed = Arc::new(AtomicBool::new(false));
        let mut slots = Vec::with_capacity(jobs.len());

        for job in jobs {
            // Permits are taken in request order, so jobs also start in order
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                slots.push(Slot::Skipped);
                continue;
            };
            if failed.load(Ordering::SeqCst) {
                slots.push(Slot::Skipped);
                continue;
            }

            let mut guard = FailGuard::new(failed.clone(), permit);
            slots.push(Slot::Running(tokio::spawn(async move {
                let result = job().await;
                if result.is_ok() {
                    guard.disarm();
                }
                result
            })));
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for slot in slots {
            outcomes.push(match slot {
                Slot::Skipped => TaskOutcome::Skipped,
                Slot::Running(handle) => match handle.await {
                    Ok(result) => TaskOutcome::Completed(result),
                    Err(e) => TaskOutcome::Panicked(e.to_string()),
                },
            });
        }
        outcomes
    }
}

/// Holds a job's permit and marks the pool as failed when dropped armed,
/// which includes unwinding out of a panicking job. The flag is set before
/// the permit is released.
struct FailGuard {
    failed: Arc<AtomicBool>,
    armed: bool,
    _permit: OwnedSemaphorePermit,
}

impl FailGuard {
    fn new(failed: Arc<AtomicBool>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            failed,
            armed: true,
            _permit: permit,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailGuard {
    fn drop(&mut self) {
        if self.armed {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

async fn run_sequential<T, E, F, Fut>(jobs: Vec<F>) -> Vec<TaskOutcome<T, E>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut outcomes = Vec::with_capacity(jobs.len());
    let mut failed = false;
    for job in jobs {
        if failed {
            outcomes.push(TaskOutcome::Skipped);
            continue;
        }
        let outcome = match tokio::spawn(async move { job().await }).await {
            Ok(result) => TaskOutcome::Completed(result),
            Err(e) => TaskOutcome::Panicked(e.to_string()),
        };
        failed = outcome.is_failure();
        outcomes.push(outcome);
    }
    outcomes
}
