//! Integration tests for the local and slave runners

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use boomer_protocol::message::{outbound, Message};
use boomer_protocol::{ClientHandle, InProcessMaster};
use serde_json::json;

use crate::channel::ChannelConfig;
use crate::events::{EventBus, EVENT_SPAWN_COMPLETE};
use crate::output::Output;
use crate::runner::{HatchType, LocalRunner, LocalRunnerConfig, SlaveRunner, SlaveRunnerConfig, State};
use crate::stats::{sample_channels, Recorder, Report, SampleChannels};
use crate::task::{Task, TaskSet};

const FAST: Duration = Duration::from_millis(100);

fn pipes() -> (Recorder, SampleChannels) {
    sample_channels(ChannelConfig::default().stats_buffer)
}

/// A task named `hello` that records one success per invocation, the way
/// user code does through the facade.
fn hello_task(recorder: Recorder) -> Task {
    Task::new("hello", 1, move || {
        let recorder = recorder.clone();
        async move {
            recorder.record_success("", "hello", 1, 4);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

struct CapturingOutput {
    reports: Arc<Mutex<Vec<Report>>>,
    stops: Arc<AtomicU64>,
}

impl Output for CapturingOutput {
    fn on_event(&self, report: &Report) {
        self.reports.lock().unwrap().push(report.clone());
    }

    fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Local runner
// ============================================================================

#[tokio::test]
async fn test_local_runner_hatches_and_reports() {
    let (recorder, samples) = pipes();
    let events = Arc::new(EventBus::new());
    let spawn_complete = Arc::new(AtomicU64::new(0));
    {
        let hits = Arc::clone(&spawn_complete);
        events.subscribe(EVENT_SPAWN_COMPLETE, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let reports = Arc::new(Mutex::new(Vec::new()));
    let stops = Arc::new(AtomicU64::new(0));
    let config = LocalRunnerConfig {
        hatch_count: 10,
        report_interval: FAST,
        ..Default::default()
    };
    let mut runner = LocalRunner::new(
        TaskSet::new(vec![hello_task(recorder.clone())]),
        None,
        config,
        events,
        recorder,
        samples,
    );
    runner.add_output(Box::new(CapturingOutput {
        reports: Arc::clone(&reports),
        stops: Arc::clone(&stops),
    }));

    runner.start();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(runner.user_count(), 10);
    assert_eq!(spawn_complete.load(Ordering::SeqCst), 1);

    runner.close().await;
    assert_eq!(runner.user_count(), 0);

    let reports = reports.lock().unwrap();
    assert!(!reports.is_empty());
    let first = reports.iter().find(|r| r.stats_total.num_requests > 0).unwrap();
    assert_eq!(first.user_count, 10);
    // Everything bucketed under ("", "hello").
    assert_eq!(first.stats.len(), 1);
    assert_eq!(first.stats[0].method, "");
    assert_eq!(first.stats[0].name, "hello");
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_local_runner_smooth_hatch_paces() {
    let (recorder, samples) = pipes();
    let config = LocalRunnerConfig {
        hatch_count: 5,
        hatch_type: HatchType::Smooth,
        hatch_rate: 10,
        report_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let mut runner = LocalRunner::new(
        TaskSet::new(vec![hello_task(recorder.clone())]),
        None,
        config,
        Arc::new(EventBus::new()),
        recorder,
        samples,
    );
    runner.start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let midway = runner.user_count();
    assert!(midway >= 1 && midway < 5, "midway count was {midway}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runner.user_count(), 5);
    runner.close().await;
}

#[tokio::test]
async fn test_local_runner_close_is_idempotent() {
    let (recorder, samples) = pipes();
    let config = LocalRunnerConfig {
        hatch_count: 3,
        report_interval: FAST,
        ..Default::default()
    };
    let mut runner = LocalRunner::new(
        TaskSet::new(vec![hello_task(recorder.clone())]),
        None,
        config,
        Arc::new(EventBus::new()),
        recorder,
        samples,
    );
    runner.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    runner.close().await;
    runner.close().await;
    assert_eq!(runner.user_count(), 0);
}

// ============================================================================
// Slave runner
// ============================================================================

fn slave_fixture(heartbeat: Duration, report: Duration) -> (SlaveRunner, InProcessMaster) {
    let (recorder, samples) = pipes();
    let config = SlaveRunnerConfig {
        heartbeat_interval: heartbeat,
        report_interval: report,
        ..Default::default()
    };
    let mut runner = SlaveRunner::new(
        TaskSet::new(vec![hello_task(recorder.clone())]),
        None,
        config,
        Arc::new(EventBus::new()),
        recorder,
        samples,
    );
    let (client, master) = ClientHandle::in_process(128);
    runner.start_with_client(client);
    (runner, master)
}

async fn next_non_heartbeat(master: &mut InProcessMaster) -> Option<Message> {
    loop {
        match timeout(Duration::from_secs(2), master.from_slave.recv()).await {
            Ok(Some(msg)) if msg.is_heartbeat() => continue,
            Ok(msg) => return msg,
            Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn test_slave_registers_before_anything_else() {
    let (mut runner, mut master) = slave_fixture(FAST, FAST);

    let first = timeout(Duration::from_secs(1), master.from_slave.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.typ, outbound::CLIENT_READY);
    assert_eq!(first.node_id, runner.node_id());
    runner.close().await;
}

#[tokio::test]
async fn test_slave_spawn_completes_within_deadline() {
    let (mut runner, mut master) = slave_fixture(FAST, Duration::from_secs(60));
    let mut state = runner.state();

    let ready = next_non_heartbeat(&mut master).await.unwrap();
    assert_eq!(ready.typ, outbound::CLIENT_READY);

    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 20, "spawn_rate": 10.0 })),
            "master",
        ))
        .await
        .unwrap();

    let complete = timeout(Duration::from_secs(2), async {
        loop {
            let msg = next_non_heartbeat(&mut master).await.unwrap();
            if msg.typ == outbound::SPAWNING_COMPLETE {
                return msg;
            }
        }
    })
    .await
    .expect("spawning_complete within 2s");
    assert_eq!(complete.data.unwrap()["user_count"], json!(20));

    state.wait_for(|s| *s == State::Running).await.unwrap();
    runner.close().await;
}

#[tokio::test]
async fn test_slave_stop_keeps_session() {
    let (mut runner, mut master) = slave_fixture(FAST, Duration::from_secs(60));
    let mut state = runner.state();

    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 4, "spawn_rate": 0.0 })),
            "master",
        ))
        .await
        .unwrap();
    state.wait_for(|s| *s == State::Running).await.unwrap();

    master
        .to_slave
        .send(Message::new("stop", None, "master"))
        .await
        .unwrap();

    let stopped = timeout(Duration::from_secs(2), async {
        loop {
            let msg = next_non_heartbeat(&mut master).await.unwrap();
            if msg.typ == outbound::CLIENT_STOPPED {
                return msg;
            }
        }
    })
    .await
    .expect("client_stopped");
    assert_eq!(stopped.typ, outbound::CLIENT_STOPPED);
    state.wait_for(|s| *s == State::Stopped).await.unwrap();

    // A heartbeat after the stop still flows: the session is alive. Earlier
    // beats carry earlier states, so drain until one reflects the stop.
    timeout(Duration::from_secs(1), async {
        loop {
            if let Some(msg) = master.from_slave.recv().await {
                if msg.is_heartbeat() && msg.data.unwrap()["state"] == json!("stopped") {
                    return;
                }
            }
        }
    })
    .await
    .expect("heartbeat in stopped state");
    runner.close().await;
}

#[tokio::test]
async fn test_slave_heartbeat_carries_state_and_cpu() {
    let (mut runner, mut master) = slave_fixture(FAST, Duration::from_secs(60));

    let beat = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(msg) = master.from_slave.recv().await {
                if msg.is_heartbeat() {
                    return msg;
                }
            }
        }
    })
    .await
    .unwrap();
    let data = beat.data.unwrap();
    assert_eq!(data["state"], json!("ready"));
    let cpu = data["current_cpu_usage"].as_f64().unwrap();
    assert!((0.0..=100.0).contains(&cpu));
    runner.close().await;
}

#[tokio::test]
async fn test_slave_master_disconnect_goes_missing_and_reregisters() {
    let (mut runner, mut master) = slave_fixture(FAST, Duration::from_secs(60));
    let mut state = runner.state();

    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 3, "spawn_rate": 0.0 })),
            "master",
        ))
        .await
        .unwrap();
    state.wait_for(|s| *s == State::Running).await.unwrap();
    let ready = next_non_heartbeat(&mut master).await.unwrap();
    assert_eq!(ready.typ, outbound::CLIENT_READY);
    let complete = next_non_heartbeat(&mut master).await.unwrap();
    assert_eq!(complete.typ, outbound::SPAWNING_COMPLETE);

    // Master goes silent: its sending half vanishes.
    let (unused_tx, _unused_rx) = tokio::sync::mpsc::channel(1);
    drop(std::mem::replace(&mut master.to_slave, unused_tx));

    // Missing is transient (the runner re-enters ready immediately), so the
    // fresh client_ready is the durable evidence of the transition.
    let reregistered = timeout(Duration::from_secs(4), async {
        loop {
            let msg = next_non_heartbeat(&mut master).await.unwrap();
            if msg.typ == outbound::CLIENT_READY {
                return;
            }
        }
    })
    .await;
    assert!(reregistered.is_ok(), "no client_ready after disconnect");
    assert_eq!(*state.borrow(), State::Ready);

    // The session drop stopped all workers.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.user_count(), 0);

    runner.close().await;
}

#[tokio::test]
async fn test_slave_quit_sends_quit_and_nothing_after() {
    let (mut runner, mut master) = slave_fixture(FAST, FAST);

    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 2, "spawn_rate": 0.0 })),
            "master",
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    runner.close().await;

    // Drain the full outbound backlog: client_ready first, a quit present,
    // and never a stats frame after it.
    let mut seen = Vec::new();
    while let Ok(Some(msg)) = timeout(FAST, master.from_slave.recv()).await {
        seen.push(msg.typ);
    }
    assert_eq!(seen.first().map(String::as_str), Some(outbound::CLIENT_READY));
    let quit_at = seen
        .iter()
        .position(|t| t == outbound::QUIT)
        .expect("quit message sent");
    assert!(
        seen[quit_at + 1..].iter().all(|t| t != outbound::STATS),
        "stats sent after quit: {seen:?}"
    );
}

#[tokio::test]
async fn test_slave_stats_follow_report_ticks() {
    let (mut runner, mut master) = slave_fixture(Duration::from_secs(60), FAST);

    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 2, "spawn_rate": 0.0 })),
            "master",
        ))
        .await
        .unwrap();

    let stats = timeout(Duration::from_secs(3), async {
        loop {
            let msg = next_non_heartbeat(&mut master).await.unwrap();
            if msg.typ == outbound::STATS {
                return msg;
            }
        }
    })
    .await
    .expect("stats message");
    let data = stats.data.unwrap();
    assert!(data["stats_total"]["num_requests"].as_u64().unwrap() > 0);
    assert_eq!(data["user_count"], json!(2));
    runner.close().await;
}

#[tokio::test]
async fn test_slave_ignores_unknown_messages() {
    let (mut runner, mut master) = slave_fixture(FAST, Duration::from_secs(60));

    master
        .to_slave
        .send(Message::new("rebalance", None, "master"))
        .await
        .unwrap();
    master
        .to_slave
        .send(Message::new(
            "spawn",
            Some(json!({ "user_count": 1, "spawn_rate": 0.0 })),
            "master",
        ))
        .await
        .unwrap();

    // The unknown message is skipped and the spawn still lands.
    let mut state = runner.state();
    state.wait_for(|s| *s == State::Running).await.unwrap();
    runner.close().await;
}
