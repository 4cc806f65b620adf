//! Test lifecycles: the standalone runner and the master-driven slave
//!
//! Both runners own the same machinery (task set, worker pool, optional
//! rate limiter, stats collector, outputs) and differ in what drives the
//! lifecycle: the local runner hatches once and runs until closed, the slave
//! runner is a state machine fed by master messages and local tickers.

pub mod local;
pub mod slave;

#[cfg(test)]
mod tests;

pub use local::{LocalRunner, LocalRunnerConfig};
pub use slave::{SlaveRunner, SlaveRunnerConfig};

/// Runner lifecycle state. The local runner never enters `Missing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for work.
    Ready,
    /// Bringing the worker count to a target.
    Spawning,
    /// Workers are up and executing tasks.
    Running,
    /// Workers stopped, session alive.
    Stopped,
    /// Lost contact with the master.
    Missing,
}

impl State {
    /// Wire representation carried in heartbeats.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Ready => "ready",
            State::Spawning => "spawning",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Missing => "missing",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How workers are brought up, before a spawn rate is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HatchType {
    /// Spawn everything at once.
    #[default]
    Asap,
    /// Spawn at a constant pace.
    Smooth,
}

impl HatchType {
    /// Parse `"asap"` / `"smooth"`. Anything else is `None`, which callers
    /// log and ignore.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asap" => Some(HatchType::Asap),
            "smooth" => Some(HatchType::Smooth),
            _ => None,
        }
    }

    /// Resolve into a concrete hatch plan for the given spawn rate.
    pub fn plan(&self, hatch_rate: u64) -> crate::pool::HatchPlan {
        match self {
            HatchType::Asap => crate::pool::HatchPlan::Asap,
            HatchType::Smooth => crate::pool::HatchPlan::Smooth { hatch_rate },
        }
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn test_state_wire_strings() {
        assert_eq!(State::Ready.as_str(), "ready");
        assert_eq!(State::Missing.to_string(), "missing");
    }

    #[test]
    fn test_hatch_type_parse() {
        assert_eq!(HatchType::parse("asap"), Some(HatchType::Asap));
        assert_eq!(HatchType::parse("smooth"), Some(HatchType::Smooth));
        assert_eq!(HatchType::parse("warp"), None);
        assert_eq!(HatchType::parse(""), None);
    }

    #[test]
    fn test_zero_rate_smooth_plan_degrades_to_asap_spawning() {
        // The plan keeps the smooth variant; the pool treats a zero rate as
        // as-fast-as-possible.
        let plan = HatchType::Smooth.plan(0);
        assert_eq!(plan, crate::pool::HatchPlan::Smooth { hatch_rate: 0 });
    }
}
