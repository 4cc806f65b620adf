//! Standalone lifecycle: spawn -> run -> stop

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ChannelConfig;
use crate::events::{EventBus, EventPayload, EVENT_QUIT, EVENT_SPAWN, EVENT_SPAWN_COMPLETE, EVENT_STOP};
use crate::output::Output;
use crate::pool::WorkerPool;
use crate::rate::RateLimiter;
use crate::runner::HatchType;
use crate::stats::{
    Recorder, Report, SampleChannels, StatsCollector, StatsCommand, DEFAULT_REPORT_INTERVAL,
};
use crate::task::TaskSet;

/// Configuration of a standalone run.
#[derive(Debug, Clone)]
pub struct LocalRunnerConfig {
    /// Target active user count.
    pub hatch_count: usize,
    /// How the target is reached.
    pub hatch_type: HatchType,
    /// Users per second for a smooth hatch; zero means as fast as possible.
    pub hatch_rate: u64,
    /// Report emission cadence.
    pub report_interval: Duration,
    /// Channel buffer sizes.
    pub channels: ChannelConfig,
}

impl Default for LocalRunnerConfig {
    fn default() -> Self {
        Self {
            hatch_count: 1,
            hatch_type: HatchType::Asap,
            hatch_rate: 0,
            report_interval: DEFAULT_REPORT_INTERVAL,
            channels: ChannelConfig::default(),
        }
    }
}

struct Boot {
    collector: StatsCollector,
    reports: mpsc::Receiver<Report>,
}

/// The standalone runner. Owns task set, worker pool, rate limiter, and the
/// stats pipeline.
pub struct LocalRunner {
    config: LocalRunnerConfig,
    pool: Arc<WorkerPool>,
    limiter: Option<Arc<dyn RateLimiter>>,
    events: Arc<EventBus>,
    recorder: Recorder,
    stats_control: mpsc::Sender<StatsCommand>,
    outputs: Vec<Box<dyn Output>>,
    boot: Option<Boot>,
    collector_task: Option<JoinHandle<()>>,
    hatcher: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl LocalRunner {
    /// Build a runner over an existing sample ingress (created early so
    /// task bodies can hold `Recorder` clones). Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        tasks: TaskSet,
        limiter: Option<Arc<dyn RateLimiter>>,
        config: LocalRunnerConfig,
        events: Arc<EventBus>,
        recorder: Recorder,
        samples: SampleChannels,
    ) -> Self {
        let user_count = Arc::new(AtomicI64::new(0));
        let (collector, handle) = StatsCollector::new(
            samples,
            &config.channels,
            config.report_interval,
            Arc::clone(&user_count),
        );
        let pool = Arc::new(WorkerPool::new(
            Arc::new(tasks),
            limiter.clone(),
            recorder.clone(),
            user_count,
        ));
        Self {
            config,
            pool,
            limiter,
            events,
            recorder,
            stats_control: handle.control,
            outputs: Vec::new(),
            boot: Some(Boot {
                collector,
                reports: handle.reports,
            }),
            collector_task: None,
            hatcher: None,
            pump: None,
            closed: false,
        }
    }

    /// Register a report consumer. Must happen before [`start`](Self::start).
    pub fn add_output(&mut self, output: Box<dyn Output>) {
        if self.boot.is_none() {
            tracing::warn!("output added after start, ignored");
            return;
        }
        self.outputs.push(output);
    }

    /// Producer handle for task bodies.
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    /// Active virtual users right now.
    pub fn user_count(&self) -> i64 {
        self.pool.user_count()
    }

    /// Start the test: stats, rate limiter, then hatch to the target.
    /// Publishes `boomer:spawn-complete` once every worker is up. Returns
    /// immediately; hatching proceeds in the background.
    pub fn start(&mut self) {
        let Some(boot) = self.boot.take() else {
            tracing::warn!("runner already started");
            return;
        };
        self.collector_task = Some(tokio::spawn(boot.collector.run()));
        if let Some(limiter) = &self.limiter {
            limiter.start();
        }

        let outputs = std::mem::take(&mut self.outputs);
        for output in &outputs {
            output.on_start();
        }
        self.pump = Some(tokio::spawn(pump_reports(boot.reports, outputs)));

        let target = self.config.hatch_count;
        let rate = self.config.hatch_rate;
        let plan = self.config.hatch_type.plan(rate);
        self.events
            .publish_with(EVENT_SPAWN, &EventPayload::spawn(target as u64, rate as f64));

        let pool = Arc::clone(&self.pool);
        let events = Arc::clone(&self.events);
        self.hatcher = Some(tokio::spawn(async move {
            if pool.resize(target, plan).await {
                tracing::info!(user_count = target, "all workers hatched");
                events.publish_with(
                    EVENT_SPAWN_COMPLETE,
                    &EventPayload {
                        user_count: Some(target as u64),
                        spawn_rate: None,
                    },
                );
            }
        }));
    }

    /// Shut the test down: publish `boomer:quit`, stop the pool, drain the
    /// stats pipeline (one final report reaches the outputs), stop the rate
    /// limiter. Calling twice is equivalent to calling once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!("closing local runner");

        self.events.publish(EVENT_QUIT);
        self.events.publish(EVENT_STOP);
        if let Some(hatcher) = self.hatcher.take() {
            hatcher.abort();
        }
        self.pool.stop();
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        let _ = self.stats_control.send(StatsCommand::Stop).await;

        let grace = self.config.report_interval + Duration::from_secs(1);
        if let Some(collector) = self.collector_task.take() {
            let _ = tokio::time::timeout(grace, collector).await;
        }
        if let Some(pump) = self.pump.take() {
            let _ = tokio::time::timeout(grace, pump).await;
        }
    }
}

async fn pump_reports(mut reports: mpsc::Receiver<Report>, outputs: Vec<Box<dyn Output>>) {
    while let Some(report) = reports.recv().await {
        for output in &outputs {
            output.on_event(&report);
        }
    }
    for output in &outputs {
        output.on_stop();
    }
}
