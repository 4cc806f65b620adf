//! Master-driven lifecycle: the slave state machine
//!
//! The slave registers with `client_ready`, heartbeats once a second with
//! its state and CPU usage, wraps every report window into a `stats`
//! message, and follows the master's `spawn`/`stop`/`quit` commands. Losing
//! the master (a fatal transport error, or three missed heartbeat periods
//! without inbound traffic) drops the session: workers stop and the slave
//! re-registers as if freshly started.
//!
//! Ordering guarantees: `client_ready` is queued before anything else, and
//! no `stats` message is queued after `quit`.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use boomer_protocol::message::{inbound, Message, SpawnArgs};
use boomer_protocol::{ClientHandle, MasterClient};

use crate::channel::ChannelConfig;
use crate::error::Result;
use crate::events::{EventBus, EventPayload, EVENT_QUIT, EVENT_SPAWN, EVENT_STOP};
use crate::output::Output;
use crate::pool::WorkerPool;
use crate::rate::RateLimiter;
use crate::runner::{HatchType, State};
use crate::stats::{
    Recorder, Report, SampleChannels, StatsCollector, StatsCommand, DEFAULT_REPORT_INTERVAL,
};
use crate::sys::{node_id, CpuMonitor};
use crate::task::TaskSet;

/// Heartbeat cadence required by the master protocol.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Missed heartbeat periods before the master is considered gone.
const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Configuration of a distributed run.
#[derive(Debug, Clone)]
pub struct SlaveRunnerConfig {
    /// Master transport host.
    pub master_host: String,
    /// Master transport port.
    pub master_port: u16,
    /// How spawn targets are reached; `Smooth` uses the spawn rate the
    /// master sends.
    pub hatch_type: HatchType,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Report emission cadence.
    pub report_interval: Duration,
    /// Channel buffer sizes.
    pub channels: ChannelConfig,
}

impl Default for SlaveRunnerConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_owned(),
            master_port: 5557,
            hatch_type: HatchType::Asap,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            channels: ChannelConfig::default(),
        }
    }
}

struct Boot {
    collector: StatsCollector,
    reports: mpsc::Receiver<Report>,
}

/// The slave runner. Owns the master session and the same worker machinery
/// as the local runner.
pub struct SlaveRunner {
    config: SlaveRunnerConfig,
    node_id: String,
    pool: Arc<WorkerPool>,
    limiter: Option<Arc<dyn RateLimiter>>,
    events: Arc<EventBus>,
    recorder: Recorder,
    stats_control: mpsc::Sender<StatsCommand>,
    outputs: Vec<Box<dyn Output>>,
    state_tx: watch::Sender<State>,
    shutdown_tx: watch::Sender<bool>,
    boot: Option<Boot>,
    collector_task: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
    disconnected: Option<watch::Receiver<bool>>,
    closed: bool,
}

impl SlaveRunner {
    /// Build a runner over an existing sample ingress. The node id is
    /// formed here and stays stable for the process's lifetime.
    pub fn new(
        tasks: TaskSet,
        limiter: Option<Arc<dyn RateLimiter>>,
        config: SlaveRunnerConfig,
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
        let (state_tx, _) = watch::channel(State::Ready);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            node_id: node_id(),
            pool,
            limiter,
            events,
            recorder,
            stats_control: handle.control,
            outputs: Vec::new(),
            state_tx,
            shutdown_tx,
            boot: Some(Boot {
                collector,
                reports: handle.reports,
            }),
            collector_task: None,
            driver: None,
            disconnected: None,
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

    /// This slave's node identity.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Active virtual users right now.
    pub fn user_count(&self) -> i64 {
        self.pool.user_count()
    }

    /// Watch the runner state as it transitions.
    pub fn state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Connect to the master and start the state machine.
    pub async fn start(&mut self) -> Result<()> {
        let client = MasterClient::connect(
            &self.config.master_host,
            self.config.master_port,
            &self.node_id,
            self.config.channels.outbound_buffer,
        )
        .await?;
        self.start_with_client(client);
        Ok(())
    }

    /// Start the state machine over an already-established client. This is
    /// the seam in-process harnesses use.
    pub fn start_with_client(&mut self, client: ClientHandle) {
        let Some(boot) = self.boot.take() else {
            tracing::warn!("runner already started");
            return;
        };
        self.collector_task = Some(tokio::spawn(boot.collector.run()));
        self.disconnected = Some(client.disconnected());

        let (hatched_tx, hatched_rx) = mpsc::channel(4);
        let driver = Driver {
            client,
            node_id: self.node_id.clone(),
            state: State::Ready,
            state_tx: self.state_tx.clone(),
            events: Arc::clone(&self.events),
            pool: Arc::clone(&self.pool),
            limiter: self.limiter.clone(),
            stats_control: self.stats_control.clone(),
            reports: boot.reports,
            outputs: std::mem::take(&mut self.outputs),
            hatch_type: self.config.hatch_type,
            heartbeat_interval: self.config.heartbeat_interval,
            cpu: CpuMonitor::start(self.config.heartbeat_interval),
            shutdown_rx: self.shutdown_tx.subscribe(),
            hatched_tx,
            hatched_rx,
            hatch_generation: 0,
        };
        self.driver = Some(tokio::spawn(driver.drive()));
    }

    /// Shut down: publish `boomer:quit`, send `quit` to the master, wait at
    /// most 3 s for the transport to confirm, stop everything. Calling twice
    /// is equivalent to calling once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!("closing slave runner");

        self.events.publish(EVENT_QUIT);
        let _ = self.shutdown_tx.send(true);

        if let Some(disconnected) = &self.disconnected {
            let mut rx = disconnected.clone();
            let confirmed = tokio::time::timeout(Duration::from_secs(3), async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if confirmed.is_err() {
                tracing::warn!("timeout waiting for quit delivery, closing anyway");
            }
        }

        let grace = self.config.report_interval + Duration::from_secs(1);
        if let Some(driver) = self.driver.take() {
            let _ = tokio::time::timeout(grace, driver).await;
        }
        if let Some(collector) = self.collector_task.take() {
            let _ = tokio::time::timeout(grace, collector).await;
        }
    }
}

struct Hatched {
    generation: u64,
    user_count: u64,
}

enum Flow {
    Continue,
    Quit,
}

struct Driver {
    client: ClientHandle,
    node_id: String,
    state: State,
    state_tx: watch::Sender<State>,
    events: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    limiter: Option<Arc<dyn RateLimiter>>,
    stats_control: mpsc::Sender<StatsCommand>,
    reports: mpsc::Receiver<Report>,
    outputs: Vec<Box<dyn Output>>,
    hatch_type: HatchType,
    heartbeat_interval: Duration,
    cpu: CpuMonitor,
    shutdown_rx: watch::Receiver<bool>,
    hatched_tx: mpsc::Sender<Hatched>,
    hatched_rx: mpsc::Receiver<Hatched>,
    hatch_generation: u64,
}

impl Driver {
    async fn drive(mut self) {
        self.client.send(Message::client_ready(&self.node_id));
        self.set_state(State::Ready);
        for output in &self.outputs {
            output.on_start();
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let liveness_limit = self.heartbeat_interval * MISSED_HEARTBEAT_LIMIT;
        let mut last_heard = Instant::now();
        let mut transport_alive = true;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    self.client.send(Message::quit(&self.node_id));
                    break;
                }
                inbound = self.client.recv(), if transport_alive => match inbound {
                    Some(message) => {
                        last_heard = Instant::now();
                        match self.handle_message(message) {
                            Flow::Continue => {}
                            Flow::Quit => {
                                self.client.send(Message::quit(&self.node_id));
                                break;
                            }
                        }
                    }
                    None => {
                        transport_alive = false;
                        self.drop_session();
                        last_heard = Instant::now();
                    }
                },
                _ = heartbeat.tick() => {
                    if transport_alive && last_heard.elapsed() > liveness_limit {
                        self.drop_session();
                        last_heard = Instant::now();
                    }
                    self.client.send(Message::heartbeat(
                        &self.node_id,
                        self.state.as_str(),
                        self.cpu.current(),
                    ));
                }
                Some(report) = self.reports.recv() => {
                    self.forward_report(report);
                }
                Some(hatched) = self.hatched_rx.recv() => {
                    if hatched.generation == self.hatch_generation {
                        self.set_state(State::Running);
                        self.client.send(Message::spawning_complete(
                            &self.node_id,
                            hatched.user_count,
                        ));
                        tracing::info!(user_count = hatched.user_count, "spawning complete");
                    }
                }
            }
        }

        self.teardown().await;
    }

    fn handle_message(&mut self, message: Message) -> Flow {
        tracing::debug!(typ = %message.typ, "message from master");
        match message.typ.as_str() {
            inbound::SPAWN => {
                match SpawnArgs::from_data(message.data) {
                    Ok(args) => self.start_spawning(args),
                    Err(e) => tracing::warn!(error = %e, "undecodable spawn message, skipping"),
                }
                Flow::Continue
            }
            inbound::STOP => {
                self.stop_workers();
                self.set_state(State::Stopped);
                self.client.send(Message::client_stopped(&self.node_id));
                self.events.publish(EVENT_STOP);
                Flow::Continue
            }
            inbound::QUIT => {
                self.events.publish(EVENT_QUIT);
                Flow::Quit
            }
            inbound::RECONNECT => {
                // Fresh registration on the same transport.
                self.client.send(Message::client_ready(&self.node_id));
                Flow::Continue
            }
            inbound::ACK => Flow::Continue,
            other => {
                tracing::info!(typ = other, "unrecognized message from master, ignoring");
                Flow::Continue
            }
        }
    }

    fn start_spawning(&mut self, args: SpawnArgs) {
        if let Some(host) = &args.host {
            tracing::info!(host = %host, "spawn targets host");
        }
        self.set_state(State::Spawning);
        if let Some(limiter) = &self.limiter {
            limiter.start();
        }
        self.events.publish_with(
            EVENT_SPAWN,
            &EventPayload::spawn(args.user_count, args.spawn_rate),
        );

        self.hatch_generation += 1;
        let generation = self.hatch_generation;
        let plan = self.hatch_type.plan(args.spawn_rate as u64);
        let pool = Arc::clone(&self.pool);
        let done = self.hatched_tx.clone();
        let target = args.user_count;
        tokio::spawn(async move {
            if pool.resize(target as usize, plan).await {
                let _ = done
                    .send(Hatched {
                        generation,
                        user_count: target,
                    })
                    .await;
            }
        });
    }

    fn stop_workers(&mut self) {
        // Invalidate any in-flight hatch so its completion is ignored.
        self.hatch_generation += 1;
        self.pool.stop();
    }

    /// The master is gone: stop workers, re-enter ready, and register
    /// afresh. Registration attempts continue for the process lifetime.
    fn drop_session(&mut self) {
        tracing::warn!("master unreachable, dropping session");
        self.set_state(State::Missing);
        self.stop_workers();
        self.client.send(Message::client_ready(&self.node_id));
        self.set_state(State::Ready);
    }

    fn forward_report(&mut self, report: Report) {
        self.events.publish(crate::events::EVENT_REPORT_TO_MASTER);
        match serde_json::to_value(&report) {
            Ok(value) => self.client.send(Message::stats(&self.node_id, value)),
            Err(e) => tracing::warn!(error = %e, "failed to serialize report, skipping"),
        }
        for output in &self.outputs {
            output.on_event(&report);
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "state transition");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn teardown(mut self) {
        self.pool.stop();
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        let _ = self.stats_control.send(StatsCommand::Stop).await;
        // The final cumulative report still reaches the outputs, but not the
        // master: nothing follows the quit message.
        while let Some(report) = self.reports.recv().await {
            for output in &self.outputs {
                output.on_event(&report);
            }
        }
        for output in &self.outputs {
            output.on_stop();
        }
        self.cpu.stop();
        self.client.close();
    }
}
