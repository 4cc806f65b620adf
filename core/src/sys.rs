//! Process-level introspection: CPU usage and node identity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;

/// Background CPU sampler feeding the heartbeat's usage figure.
///
/// The gauge is a percentage in `[0, 100]` across all cores, refreshed once
/// per sampling interval.
#[derive(Debug)]
pub struct CpuMonitor {
    usage: Arc<AtomicU64>,
    sampler: JoinHandle<()>,
}

impl CpuMonitor {
    /// Start sampling every `interval`.
    pub fn start(interval: Duration) -> Self {
        let usage = Arc::new(AtomicU64::new(0f64.to_bits()));
        let gauge = Arc::clone(&usage);
        let sampler = tokio::spawn(async move {
            let mut system = System::new();
            // Two refreshes are needed before sysinfo yields a meaningful
            // delta; the first reading is discarded.
            system.refresh_cpu_usage();
            let interval = interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            loop {
                tokio::time::sleep(interval).await;
                system.refresh_cpu_usage();
                let percent = f64::from(system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
                gauge.store(percent.to_bits(), Ordering::Relaxed);
            }
        });
        Self { usage, sampler }
    }

    /// Most recent CPU usage percentage.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.usage.load(Ordering::Relaxed))
    }

    /// Stop sampling.
    pub fn stop(&self) {
        self.sampler.abort();
    }
}

impl Drop for CpuMonitor {
    fn drop(&mut self) {
        self.sampler.abort();
    }
}

/// Form a node identity: `<hostname>_<32 hex chars>`, stable for the
/// process's lifetime once formed.
pub fn node_id() -> String {
    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_owned());
    let entropy: [u8; 16] = rand::random();
    let suffix: String = entropy.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{hostname}_{suffix}")
}
