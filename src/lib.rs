//! boomer: a programmable load-generation worker
//!
//! boomer executes user-supplied [`Task`]s at a controlled concurrency,
//! collects per-request statistics, and either runs standalone or joins a
//! distributed load test as a slave of an external master speaking the
//! Locust protocol.
//!
//! # Example
//!
//! ```no_run
//! use boomer::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> boomer::Result<()> {
//!     let mut boomer = Boomer::new("127.0.0.1", 5557);
//!     let recorder = boomer.recorder();
//!
//!     let hello = Task::new("hello", 1, move || {
//!         let recorder = recorder.clone();
//!         async move {
//!             let started = std::time::Instant::now();
//!             // ... issue a request here ...
//!             recorder.record_success("http", "hello", started.elapsed().as_millis() as u64, 42);
//!         }
//!     });
//!
//!     boomer.run(vec![hello]).await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     boomer.quit().await;
//!     Ok(())
//! }
//! ```
//!
//! Task bodies report their outcomes through a cloned [`Recorder`]
//! (`boomer.recorder()` is available from construction, before the test
//! starts). Tasks that panic are caught by the worker and recorded as
//! failures; they never kill a virtual user.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod options;

use std::sync::Arc;
use std::time::Duration;

use boomer_core::channel::ChannelConfig;
use boomer_core::events::{EventBus, EVENT_QUIT};
use boomer_core::output::Output;
use boomer_core::rate::RateLimiter;
use boomer_core::runner::{HatchType, LocalRunner, LocalRunnerConfig, SlaveRunner, SlaveRunnerConfig};
use boomer_core::stats::{sample_channels, Recorder, SampleChannels, DEFAULT_REPORT_INTERVAL};
use boomer_core::task::TaskSet;

pub use boomer_core::error::{Error, Result};
pub use boomer_core::events;
pub use boomer_core::output::ConsoleOutput;
pub use boomer_core::rate::{RampedRateLimiter, StableRateLimiter};
pub use boomer_core::runner::slave::DEFAULT_HEARTBEAT_INTERVAL;
pub use boomer_core::stats::{EndpointStats, Report};
pub use boomer_core::task::Task;
pub use options::Options;

/// Commonly used items.
pub mod prelude {
    pub use crate::options::Options;
    pub use crate::{Boomer, Mode};
    pub use boomer_core::output::{ConsoleOutput, Output};
    pub use boomer_core::rate::RateLimiter;
    pub use boomer_core::stats::{Recorder, Report};
    pub use boomer_core::task::Task;
}

/// Running mode: slave of a master, or standalone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Connect to a master and follow its lifecycle commands.
    Distributed,
    /// Run without a master.
    Standalone,
}

/// The facade binding runners, stats, rate limiting, and events together.
///
/// A `Boomer` is single-use: construct, configure, [`run`](Self::run),
/// [`quit`](Self::quit).
pub struct Boomer {
    mode: Mode,
    master_host: String,
    master_port: u16,
    hatch_type: HatchType,
    hatch_count: usize,
    hatch_rate: u64,
    report_interval: Duration,
    heartbeat_interval: Duration,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    events: Arc<EventBus>,
    outputs: Vec<Box<dyn Output>>,
    recorder: Recorder,
    samples: Option<SampleChannels>,
    local: Option<LocalRunner>,
    slave: Option<SlaveRunner>,
}

impl Boomer {
    /// A distributed-mode worker that will connect to `master_host:master_port`.
    pub fn new(master_host: impl Into<String>, master_port: u16) -> Self {
        Self::build(Mode::Distributed, master_host.into(), master_port, 1, 0)
    }

    /// A standalone worker hatching `hatch_count` users at `hatch_rate`
    /// users per second (zero means all at once).
    pub fn new_standalone(hatch_count: usize, hatch_rate: u64) -> Self {
        Self::build(Mode::Standalone, String::new(), 0, hatch_count, hatch_rate)
    }

    fn build(
        mode: Mode,
        master_host: String,
        master_port: u16,
        hatch_count: usize,
        hatch_rate: u64,
    ) -> Self {
        let (recorder, samples) = sample_channels(ChannelConfig::default().stats_buffer);
        Self {
            mode,
            master_host,
            master_port,
            hatch_type: HatchType::Asap,
            hatch_count,
            hatch_rate,
            report_interval: DEFAULT_REPORT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rate_limiter: None,
            events: Arc::new(EventBus::new()),
            outputs: Vec::new(),
            recorder,
            samples: Some(samples),
            local: None,
            slave: None,
        }
    }

    /// Install a rate limiter. Must be called before the test is started.
    pub fn set_rate_limiter(&mut self, limiter: Arc<dyn RateLimiter>) {
        self.rate_limiter = Some(limiter);
    }

    /// Accepts only `"asap"` or `"smooth"`; anything else is logged and
    /// ignored.
    pub fn set_hatch_type(&mut self, hatch_type: &str) {
        match HatchType::parse(hatch_type) {
            Some(parsed) => self.hatch_type = parsed,
            None => {
                tracing::warn!(hatch_type, "wrong hatch-type, expected asap or smooth");
            }
        }
    }

    /// Switch between distributed and standalone mode.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Override the report emission cadence (default 3 s).
    pub fn set_report_interval(&mut self, interval: Duration) {
        self.report_interval = interval;
    }

    /// Override the heartbeat cadence (default 1 s).
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Register a report consumer.
    pub fn add_output(&mut self, output: Box<dyn Output>) {
        match (&mut self.local, &mut self.slave) {
            (Some(runner), _) => runner.add_output(output),
            (_, Some(runner)) => runner.add_output(output),
            _ => self.outputs.push(output),
        }
    }

    /// The lifecycle event bus of this instance.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Producer handle for task bodies. Available from construction.
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    /// Start the test with the given tasks. In distributed mode this
    /// connects to the master; in standalone mode it hatches immediately.
    /// Returns once the test is underway; call [`quit`](Self::quit) to shut
    /// down.
    pub async fn run(&mut self, tasks: Vec<Task>) -> Result<()> {
        let Some(samples) = self.samples.take() else {
            return Err(Error::Runner("run may only be called once".into()));
        };
        let tasks = TaskSet::new(tasks);
        let channels = ChannelConfig::default();

        match self.mode {
            Mode::Standalone => {
                let config = LocalRunnerConfig {
                    hatch_count: self.hatch_count,
                    hatch_type: self.hatch_type,
                    hatch_rate: self.hatch_rate,
                    report_interval: self.report_interval,
                    channels,
                };
                let mut runner = LocalRunner::new(
                    tasks,
                    self.rate_limiter.clone(),
                    config,
                    Arc::clone(&self.events),
                    self.recorder.clone(),
                    samples,
                );
                for output in self.outputs.drain(..) {
                    runner.add_output(output);
                }
                runner.start();
                self.local = Some(runner);
            }
            Mode::Distributed => {
                let config = SlaveRunnerConfig {
                    master_host: self.master_host.clone(),
                    master_port: self.master_port,
                    hatch_type: self.hatch_type,
                    heartbeat_interval: self.heartbeat_interval,
                    report_interval: self.report_interval,
                    channels,
                };
                let mut runner = SlaveRunner::new(
                    tasks,
                    self.rate_limiter.clone(),
                    config,
                    Arc::clone(&self.events),
                    self.recorder.clone(),
                    samples,
                );
                for output in self.outputs.drain(..) {
                    runner.add_output(output);
                }
                runner.start().await?;
                self.slave = Some(runner);
            }
        }
        Ok(())
    }

    /// Report a success. Silently a no-op until a runner is configured.
    pub fn record_success(
        &self,
        request_type: &str,
        name: &str,
        response_time: u64,
        response_length: u64,
    ) {
        if self.local.is_none() && self.slave.is_none() {
            return;
        }
        self.recorder
            .record_success(request_type, name, response_time, response_length);
    }

    /// Report a failure. Silently a no-op until a runner is configured.
    pub fn record_failure(&self, request_type: &str, name: &str, response_time: u64, error: &str) {
        if self.local.is_none() && self.slave.is_none() {
            return;
        }
        self.recorder
            .record_failure(request_type, name, response_time, error);
    }

    /// Shut down: publish `boomer:quit`, send the quit message and wait at
    /// most 3 s for the transport to confirm (distributed), or close the
    /// local runner. Calling twice is equivalent to calling once.
    pub async fn quit(&mut self) {
        if let Some(runner) = &mut self.slave {
            runner.close().await;
        } else if let Some(runner) = &mut self.local {
            runner.close().await;
        } else {
            self.events.publish(EVENT_QUIT);
        }
    }
}

impl std::fmt::Debug for Boomer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boomer")
            .field("mode", &self.mode)
            .field("hatch_type", &self.hatch_type)
            .field("running", &(self.local.is_some() || self.slave.is_some()))
            .finish()
    }
}

/// Parse-and-run entry for thin binaries: builds the worker from `options`,
/// hands a [`Recorder`] to the task builder, and runs until SIGINT/SIGTERM,
/// then quits gracefully.
///
/// When `--run-tasks` is set, each named task runs exactly once and the
/// function returns without connecting anywhere. Configuration errors are
/// returned before anything starts; an embedding `main` should exit
/// non-zero on them.
pub async fn run<F>(options: Options, tasks: F) -> Result<()>
where
    F: FnOnce(Recorder) -> Vec<Task>,
{
    let mut boomer = Boomer::new(&options.master_host, options.master_port);
    boomer.set_hatch_type(&options.hatch_type);
    let tasks = tasks(boomer.recorder());

    if let Some(names) = &options.run_tasks {
        run_named_once(names, &tasks).await;
        return Ok(());
    }

    if let Some(limiter) = options.rate_limiter()? {
        boomer.set_rate_limiter(limiter);
    }
    boomer.run(tasks).await?;

    shutdown_signal().await?;
    boomer.quit().await;
    tracing::info!("shut down");
    Ok(())
}

/// Run each task named in the comma-separated list exactly once. Tasks with
/// empty names are skipped.
async fn run_named_once(names: &str, tasks: &[Task]) {
    for task in tasks {
        if task.name().is_empty() {
            continue;
        }
        for name in names.split(',') {
            if name == task.name() {
                tracing::info!(task = task.name(), "running task once");
                task.run().await;
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| Error::Runner(format!("failed to install signal handler: {e}")))?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Runner(format!("failed to install signal handler: {e}")))?;
    Ok(())
}
