//! Per-request statistics: samples, accumulators, and the collector task
//!
//! Workers report success/failure samples through a cloned [`Recorder`]; the
//! [`StatsCollector`] task folds them into per-endpoint accumulators and
//! emits a [`Report`] every report interval. Window data (counts, per-second
//! buckets, errors) resets after each emission while cumulative totals are
//! kept for the final summary.
//!
//! The ingress is bounded and never blocks workers: a saturated channel
//! sheds the sample and counts the drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::channel::ChannelConfig;

/// Default cadence of report emission.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// A successful request observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSuccess {
    /// Request type, e.g. `"http"`; may be empty.
    pub request_type: String,
    /// Endpoint name.
    pub name: String,
    /// Response time in milliseconds.
    pub response_time: u64,
    /// Response length in bytes.
    pub response_length: u64,
}

/// A failed request observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// Request type, e.g. `"http"`; may be empty.
    pub request_type: String,
    /// Endpoint name.
    pub name: String,
    /// Response time in milliseconds.
    pub response_time: u64,
    /// Error string reported by the task.
    pub error: String,
}

/// Round a response time onto the histogram grid: 0-99 to the nearest 1 ms,
/// 100-999 to the nearest 10 ms, >= 1000 to the nearest 100 ms, always
/// rounding down.
pub fn round_response_time(ms: u64) -> u64 {
    if ms < 100 {
        ms
    } else if ms < 1000 {
        ms / 10 * 10
    } else {
        ms / 100 * 100
    }
}

/// Accumulated statistics for one (request type, name) endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    /// Endpoint name.
    pub name: String,
    /// Request type (called "method" on the wire).
    pub method: String,
    /// Total requests, failures included.
    pub num_requests: u64,
    /// Failed requests.
    pub num_failures: u64,
    /// Sum of response times in milliseconds.
    pub total_response_time: u64,
    /// Smallest observed response time; `None` until a sample arrives.
    pub min_response_time: Option<u64>,
    /// Largest observed response time.
    pub max_response_time: u64,
    /// Sum of response lengths in bytes.
    pub total_content_length: u64,
    /// Histogram of rounded response times (rounded ms -> count).
    pub response_times: HashMap<u64, u64>,
    /// Requests per wall-clock second (unix second -> count).
    pub num_reqs_per_sec: HashMap<i64, u64>,
    /// Failures per wall-clock second (unix second -> count).
    pub num_fail_per_sec: HashMap<i64, u64>,
    /// Response-time sums per wall-clock second (unix second -> summed ms).
    pub response_times_per_sec: HashMap<i64, u64>,
}

impl EndpointStats {
    /// Fresh accumulator for an endpoint.
    pub fn new(method: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: None,
            max_response_time: 0,
            total_content_length: 0,
            response_times: HashMap::new(),
            num_reqs_per_sec: HashMap::new(),
            num_fail_per_sec: HashMap::new(),
            response_times_per_sec: HashMap::new(),
        }
    }

    /// Fold one success observed at unix second `now`.
    pub fn log(&mut self, response_time: u64, content_length: u64, now: i64) {
        self.log_request(response_time, now);
        self.total_content_length += content_length;
        self.check_invariants();
    }

    /// Fold one failure observed at unix second `now`.
    pub fn log_failure(&mut self, response_time: u64, now: i64) {
        self.log_request(response_time, now);
        self.num_failures += 1;
        *self.num_fail_per_sec.entry(now).or_default() += 1;
        self.check_invariants();
    }

    fn log_request(&mut self, response_time: u64, now: i64) {
        self.num_requests += 1;
        self.total_response_time += response_time;
        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time),
            None => response_time,
        });
        self.max_response_time = self.max_response_time.max(response_time);
        *self
            .response_times
            .entry(round_response_time(response_time))
            .or_default() += 1;
        *self.num_reqs_per_sec.entry(now).or_default() += 1;
        *self.response_times_per_sec.entry(now).or_default() += response_time;
    }

    /// Componentwise sum of another accumulator into this one.
    pub fn fold(&mut self, other: &EndpointStats) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.min_response_time = match (self.min_response_time, other.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        self.total_content_length += other.total_content_length;
        for (bucket, count) in &other.response_times {
            *self.response_times.entry(*bucket).or_default() += count;
        }
        for (second, count) in &other.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(*second).or_default() += count;
        }
        for (second, count) in &other.num_fail_per_sec {
            *self.num_fail_per_sec.entry(*second).or_default() += count;
        }
        for (second, sum) in &other.response_times_per_sec {
            *self.response_times_per_sec.entry(*second).or_default() += sum;
        }
        self.check_invariants();
    }

    /// Mean response time in milliseconds.
    pub fn average_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_response_time as f64 / self.num_requests as f64
    }

    /// Requests per second over the window, derived from the number of
    /// distinct seconds observed rather than wall time, so the figure stays
    /// stable across scheduler jitter.
    pub fn requests_per_second(&self) -> f64 {
        let seconds = self.num_reqs_per_sec.len();
        if seconds == 0 {
            return 0.0;
        }
        self.num_requests as f64 / seconds as f64
    }

    /// Negative counts cannot happen with unsigned arithmetic; the remaining
    /// cross-field invariants are fatal when violated.
    fn check_invariants(&self) {
        assert!(
            self.num_failures <= self.num_requests,
            "endpoint {}/{}: failure count {} exceeds request count {}",
            self.method,
            self.name,
            self.num_failures,
            self.num_requests,
        );
        if let Some(min) = self.min_response_time {
            assert!(
                min <= self.max_response_time,
                "endpoint {}/{}: min {} above max {}",
                self.method,
                self.name,
                min,
                self.max_response_time,
            );
        }
    }
}

/// A snapshot emitted at the end of a report window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Per-endpoint rows, sorted by (method, name).
    pub stats: Vec<EndpointStats>,
    /// Componentwise sum of the per-endpoint rows.
    pub stats_total: EndpointStats,
    /// Error occurrence counts keyed `"<request type>: <name>: <error>"`.
    pub errors: HashMap<String, u64>,
    /// Active virtual users at emission time.
    pub user_count: i64,
}

/// Control messages understood by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsCommand {
    /// Drop window and cumulative data alike.
    ClearAll,
    /// Emit a report immediately instead of waiting for the ticker.
    ReportNow,
    /// Emit the final cumulative report and exit.
    Stop,
}

/// Cloneable producer half of the stats pipeline.
///
/// Recording never blocks: a saturated ingress drops the sample and bumps
/// the drop counter.
#[derive(Debug, Clone)]
pub struct Recorder {
    success_tx: mpsc::Sender<RequestSuccess>,
    failure_tx: mpsc::Sender<RequestFailure>,
    dropped: Arc<AtomicU64>,
}

impl Recorder {
    /// Report a success.
    pub fn record_success(
        &self,
        request_type: &str,
        name: &str,
        response_time: u64,
        response_length: u64,
    ) {
        let sample = RequestSuccess {
            request_type: request_type.to_owned(),
            name: name.to_owned(),
            response_time,
            response_length,
        };
        if self.success_tx.try_send(sample).is_err() {
            self.shed();
        }
    }

    /// Report a failure.
    pub fn record_failure(&self, request_type: &str, name: &str, response_time: u64, error: &str) {
        let sample = RequestFailure {
            request_type: request_type.to_owned(),
            name: name.to_owned(),
            response_time,
            error: error.to_owned(),
        };
        if self.failure_tx.try_send(sample).is_err() {
            self.shed();
        }
    }

    /// Samples shed because the ingress was saturated or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn shed(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(dropped = total, "stats ingress saturated, sample shed");
    }
}

/// Receiving halves of the sample ingress, consumed by the collector.
pub struct SampleChannels {
    success_rx: mpsc::Receiver<RequestSuccess>,
    failure_rx: mpsc::Receiver<RequestFailure>,
}

/// Create the bounded sample ingress. The [`Recorder`] side exists before
/// any collector or runner, so task bodies can capture a clone early.
pub fn sample_channels(buffer: usize) -> (Recorder, SampleChannels) {
    let (success_tx, success_rx) = mpsc::channel(buffer);
    let (failure_tx, failure_rx) = mpsc::channel(buffer);
    let recorder = Recorder {
        success_tx,
        failure_tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (
        recorder,
        SampleChannels {
            success_rx,
            failure_rx,
        },
    )
}

/// Consumer-side handles of the stats pipeline.
pub struct StatsHandle {
    /// Control channel into the collector.
    pub control: mpsc::Sender<StatsCommand>,
    /// Report stream out of the collector.
    pub reports: mpsc::Receiver<Report>,
}

/// The aggregation task. Owns all accumulators; they are mutated only from
/// its loop.
pub struct StatsCollector {
    success_rx: mpsc::Receiver<RequestSuccess>,
    failure_rx: mpsc::Receiver<RequestFailure>,
    control_rx: mpsc::Receiver<StatsCommand>,
    report_tx: mpsc::Sender<Report>,
    report_interval: Duration,
    user_count: Arc<AtomicI64>,

    entries: HashMap<(String, String), EndpointStats>,
    errors: HashMap<String, u64>,
    cumulative: HashMap<(String, String), EndpointStats>,
    cumulative_errors: HashMap<String, u64>,
}

impl StatsCollector {
    /// Build a collector over an existing sample ingress. The collector
    /// runs once [`run`](Self::run) is awaited (typically inside
    /// `tokio::spawn`).
    pub fn new(
        samples: SampleChannels,
        config: &ChannelConfig,
        report_interval: Duration,
        user_count: Arc<AtomicI64>,
    ) -> (Self, StatsHandle) {
        let (control_tx, control_rx) = mpsc::channel(config.control_buffer);
        let (report_tx, report_rx) = mpsc::channel(config.report_buffer);

        let collector = Self {
            success_rx: samples.success_rx,
            failure_rx: samples.failure_rx,
            control_rx,
            report_tx,
            report_interval,
            user_count,
            entries: HashMap::new(),
            errors: HashMap::new(),
            cumulative: HashMap::new(),
            cumulative_errors: HashMap::new(),
        };
        let handle = StatsHandle {
            control: control_tx,
            reports: report_rx,
        };
        (collector, handle)
    }

    /// Fold samples and emit reports until told to stop. Emits one final
    /// cumulative report on the way out.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                Some(sample) = self.success_rx.recv() => self.fold_success(sample),
                Some(sample) = self.failure_rx.recv() => self.fold_failure(sample),
                command = self.control_rx.recv() => match command {
                    Some(StatsCommand::ClearAll) => self.clear_all(),
                    Some(StatsCommand::ReportNow) => self.flush_window().await,
                    Some(StatsCommand::Stop) | None => break,
                },
                _ = ticker.tick() => self.flush_window().await,
            }
        }

        self.drain_pending();
        let report = self.final_report();
        let _ = self.report_tx.send(report).await;
        tracing::debug!("stats collector drained");
    }

    fn fold_success(&mut self, sample: RequestSuccess) {
        let now = chrono::Utc::now().timestamp();
        self.entry(&sample.request_type, &sample.name).log(
            sample.response_time,
            sample.response_length,
            now,
        );
    }

    fn fold_failure(&mut self, sample: RequestFailure) {
        let now = chrono::Utc::now().timestamp();
        self.entry(&sample.request_type, &sample.name)
            .log_failure(sample.response_time, now);
        let key = format!("{}: {}: {}", sample.request_type, sample.name, sample.error);
        *self.errors.entry(key).or_default() += 1;
    }

    fn entry(&mut self, method: &str, name: &str) -> &mut EndpointStats {
        self.entries
            .entry((method.to_owned(), name.to_owned()))
            .or_insert_with(|| EndpointStats::new(method, name))
    }

    /// Emit the window and reset it, folding it into the cumulative
    /// accumulators first.
    async fn flush_window(&mut self) {
        let report = build_report(
            &self.entries,
            &self.errors,
            self.user_count.load(Ordering::Acquire),
        );

        for (key, entry) in self.entries.drain() {
            self.cumulative
                .entry(key)
                .and_modify(|total| total.fold(&entry))
                .or_insert(entry);
        }
        for (key, count) in self.errors.drain() {
            *self.cumulative_errors.entry(key).or_default() += count;
        }

        let _ = self.report_tx.send(report).await;
    }

    fn clear_all(&mut self) {
        self.entries.clear();
        self.errors.clear();
        self.cumulative.clear();
        self.cumulative_errors.clear();
    }

    /// Absorb whatever samples are already queued so the final report does
    /// not miss the tail of the run.
    fn drain_pending(&mut self) {
        while let Ok(sample) = self.success_rx.try_recv() {
            self.fold_success(sample);
        }
        while let Ok(sample) = self.failure_rx.try_recv() {
            self.fold_failure(sample);
        }
    }

    fn final_report(&mut self) -> Report {
        for (key, entry) in self.entries.drain() {
            self.cumulative
                .entry(key)
                .and_modify(|total| total.fold(&entry))
                .or_insert(entry);
        }
        for (key, count) in self.errors.drain() {
            *self.cumulative_errors.entry(key).or_default() += count;
        }
        build_report(
            &self.cumulative,
            &self.cumulative_errors,
            self.user_count.load(Ordering::Acquire),
        )
    }
}

fn build_report(
    entries: &HashMap<(String, String), EndpointStats>,
    errors: &HashMap<String, u64>,
    user_count: i64,
) -> Report {
    let mut stats: Vec<EndpointStats> = entries.values().cloned().collect();
    stats.sort_by(|a, b| (&a.method, &a.name).cmp(&(&b.method, &b.name)));

    let mut stats_total = EndpointStats::new("", "Total");
    for entry in &stats {
        stats_total.fold(entry);
    }

    Report {
        stats,
        stats_total,
        errors: errors.clone(),
        user_count,
    }
}
