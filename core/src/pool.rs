//! Worker pool: spawning and retiring virtual users
//!
//! Each virtual user is one tokio task running the worker body: acquire a
//! token from the rate limiter (when one is configured), pick a task by
//! weight, run the effect, repeat. Cancellation, whether an individual
//! retire signal from a shrink or the pool-wide stop broadcast, is observed
//! at the loop head only; a task body is never interrupted mid-flight.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::rate::RateLimiter;
use crate::stats::Recorder;
use crate::task::TaskSet;

/// How a resize brings the worker count up to its target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HatchPlan {
    /// Spawn all missing workers at once.
    Asap,
    /// Spawn `hatch_rate` workers per second. A zero rate falls back to
    /// [`HatchPlan::Asap`].
    Smooth {
        /// Workers to start per second.
        hatch_rate: u64,
    },
}

impl HatchPlan {
    fn spawn_delay(&self) -> Option<Duration> {
        match self {
            HatchPlan::Asap => None,
            HatchPlan::Smooth { hatch_rate: 0 } => None,
            HatchPlan::Smooth { hatch_rate } => {
                Some(Duration::from_secs_f64(1.0 / *hatch_rate as f64))
            }
        }
    }
}

struct WorkerHandle {
    retire_tx: watch::Sender<bool>,
}

/// Owns the set of worker tickets; it alone creates and cancels them.
pub struct WorkerPool {
    tasks: Arc<TaskSet>,
    limiter: Option<Arc<dyn RateLimiter>>,
    recorder: Recorder,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<WorkerHandle>>,
    user_count: Arc<AtomicI64>,
    generation: AtomicU64,
}

impl WorkerPool {
    /// Create an empty pool. `user_count` is shared with the stats
    /// collector and heartbeats, which read it concurrently.
    pub fn new(
        tasks: Arc<TaskSet>,
        limiter: Option<Arc<dyn RateLimiter>>,
        recorder: Recorder,
        user_count: Arc<AtomicI64>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            tasks,
            limiter,
            recorder,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            user_count,
            generation: AtomicU64::new(0),
        }
    }

    /// Active virtual users right now.
    pub fn user_count(&self) -> i64 {
        self.user_count.load(Ordering::Acquire)
    }

    /// Bring the active worker count to `target` according to `plan`.
    ///
    /// Returns `false` when a newer resize or a stop superseded this one
    /// before it reached the target.
    pub async fn resize(&self, target: usize, plan: HatchPlan) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(target, ?plan, "resizing worker pool");

        {
            let mut workers = lock(&self.workers);
            while workers.len() > target {
                if let Some(worker) = workers.pop() {
                    let _ = worker.retire_tx.send(true);
                }
            }
        }

        let delay = plan.spawn_delay();
        loop {
            {
                let mut workers = lock(&self.workers);
                if workers.len() >= target {
                    return true;
                }
                if self.generation.load(Ordering::SeqCst) != generation {
                    return false;
                }
                let handle = self.spawn_worker();
                workers.push(handle);
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Cancel every worker. Idempotent; also aborts any in-flight resize.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let retired = {
            let mut workers = lock(&self.workers);
            let drained: Vec<_> = workers.drain(..).collect();
            drained
        };
        for worker in &retired {
            let _ = worker.retire_tx.send(true);
        }
        let _ = self.shutdown_tx.send(());
        if !retired.is_empty() {
            tracing::info!(workers = retired.len(), "worker pool stopped");
        }
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let (retire_tx, retire_rx) = watch::channel(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.user_count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(worker_loop(
            Arc::clone(&self.tasks),
            self.limiter.clone(),
            self.recorder.clone(),
            retire_rx,
            shutdown_rx,
            Arc::clone(&self.user_count),
        ));
        WorkerHandle { retire_tx }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("tasks", &self.tasks.len())
            .field("user_count", &self.user_count())
            .finish()
    }
}

async fn worker_loop(
    tasks: Arc<TaskSet>,
    limiter: Option<Arc<dyn RateLimiter>>,
    recorder: Recorder,
    retire_rx: watch::Receiver<bool>,
    mut shutdown_rx: broadcast::Receiver<()>,
    user_count: Arc<AtomicI64>,
) {
    loop {
        if *retire_rx.borrow() {
            break;
        }
        match shutdown_rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => break,
        }

        if let Some(limiter) = &limiter {
            if !limiter.acquire().await {
                break;
            }
        }

        let Some(task) = tasks.pick() else { break };
        let started = Instant::now();
        let outcome = AssertUnwindSafe(task.run()).catch_unwind().await;
        if let Err(panic) = outcome {
            let elapsed = started.elapsed().as_millis() as u64;
            recorder.record_failure("task", task.name(), elapsed, &panic_message(&panic));
            tracing::warn!(task = task.name(), "task panicked, recorded as failure");
        }

        // Effect bodies without await points must not monopolize the runtime.
        tokio::task::yield_now().await;
    }
    user_count.fetch_sub(1, Ordering::SeqCst);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::rate::StableRateLimiter;
    use crate::stats::{StatsCollector, StatsCommand};
    use crate::task::Task;

    fn pool_fixture(tasks: Vec<Task>) -> (Arc<WorkerPool>, crate::stats::StatsHandle) {
        let users = Arc::new(AtomicI64::new(0));
        let config = ChannelConfig::default();
        let (recorder, samples) = crate::stats::sample_channels(config.stats_buffer);
        let (collector, handle) =
            StatsCollector::new(samples, &config, Duration::from_secs(60), Arc::clone(&users));
        tokio::spawn(collector.run());
        let pool = Arc::new(WorkerPool::new(
            Arc::new(TaskSet::new(tasks)),
            None,
            recorder,
            users,
        ));
        (pool, handle)
    }

    fn sleeper() -> Task {
        Task::new("sleeper", 1, || async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        })
    }

    #[tokio::test]
    async fn test_asap_resize_reaches_target_immediately() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        assert!(pool.resize(10, HatchPlan::Asap).await);
        assert_eq!(pool.user_count(), 10);
        pool.stop();
    }

    #[tokio::test]
    async fn test_shrink_retires_excess_workers() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        pool.resize(6, HatchPlan::Asap).await;
        pool.resize(2, HatchPlan::Asap).await;

        // Retired workers exit at their next loop head.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.user_count(), 2);
        pool.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_all_workers() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        pool.resize(5, HatchPlan::Asap).await;
        pool.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.user_count(), 0);
    }

    #[tokio::test]
    async fn test_smooth_hatch_paces_spawns() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        let hatcher = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.resize(5, HatchPlan::Smooth { hatch_rate: 10 }).await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        let midway = pool.user_count();
        assert!(midway >= 1 && midway < 5, "midway count was {midway}");

        assert!(hatcher.await.unwrap());
        assert_eq!(pool.user_count(), 5);
        pool.stop();
    }

    #[tokio::test]
    async fn test_smooth_with_zero_rate_falls_back_to_asap() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        assert!(pool.resize(4, HatchPlan::Smooth { hatch_rate: 0 }).await);
        assert_eq!(pool.user_count(), 4);
        pool.stop();
    }

    #[tokio::test]
    async fn test_stop_supersedes_inflight_resize() {
        let (pool, _handle) = pool_fixture(vec![sleeper()]);
        let hatcher = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.resize(50, HatchPlan::Smooth { hatch_rate: 5 }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop();

        assert!(!hatcher.await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.user_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure_sample() {
        let boom = Task::new("explode", 1, || async {
            panic!("boom");
        });
        let (pool, mut handle) = pool_fixture(vec![boom]);
        pool.resize(1, HatchPlan::Asap).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop();

        handle.control.send(StatsCommand::ReportNow).await.unwrap();
        let report = handle.reports.recv().await.unwrap();
        assert!(report.stats_total.num_failures >= 1);
        let key = report
            .errors
            .keys()
            .find(|k| k.contains("boom"))
            .expect("panic error entry");
        assert!(key.starts_with("task: explode:"));
    }

    #[tokio::test]
    async fn test_closed_limiter_exits_workers() {
        let users = Arc::new(AtomicI64::new(0));
        let (recorder, _samples) = crate::stats::sample_channels(64);
        let limiter: Arc<dyn RateLimiter> = Arc::new(StableRateLimiter::new(1).unwrap());
        let pool = WorkerPool::new(
            Arc::new(TaskSet::new(vec![sleeper()])),
            Some(Arc::clone(&limiter)),
            recorder,
            users,
        );
        pool.resize(3, HatchPlan::Asap).await;
        limiter.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.user_count(), 0);
    }
}
