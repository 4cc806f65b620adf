//! Recognized configuration options and their effects
//!
//! Embedding binaries own `main` and argument parsing; this struct is the
//! library's contract for what a binary should accept. It derives
//! `clap::Parser`, so a thin `main` can parse it directly.

use std::sync::Arc;

use clap::Parser;

use boomer_core::rate::{RampedRateLimiter, RateLimiter, StableRateLimiter};
use boomer_core::Result;

/// Runtime options of a load-generation worker.
#[derive(Debug, Clone, Parser)]
#[command(name = "boomer", about = "Programmable load-generation worker", long_about = None)]
pub struct Options {
    /// Host of the master in distributed mode.
    #[arg(long, default_value = "127.0.0.1")]
    pub master_host: String,

    /// Port of the master in distributed mode.
    #[arg(long, default_value_t = 5557)]
    pub master_port: u16,

    /// How workers are brought up: "asap" or "smooth".
    #[arg(long, default_value = "asap")]
    pub hatch_type: String,

    /// Users to start per second in smooth mode.
    #[arg(long, default_value_t = 0)]
    pub hatch_rate: u64,

    /// Target active user count in standalone mode.
    #[arg(long, visible_alias = "hatch-count", default_value_t = 1)]
    pub num_users: usize,

    /// Token-bucket ceiling in requests per second; 0 disables the limiter.
    #[arg(long, default_value_t = 0)]
    pub max_rps: i64,

    /// Ramp the request ceiling up in steps: "N" (per second) or "N/Ms"
    /// (e.g. "100/3s").
    #[arg(long)]
    pub request_increase_rate: Option<String>,

    /// Comma-separated task names: run each named task once, then exit.
    #[arg(long)]
    pub run_tasks: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(["boomer"])
    }
}

impl Options {
    /// Build the rate limiter these options describe, if any.
    ///
    /// A set `request_increase_rate` yields a ramped bucket, bounded by
    /// `max_rps` when that is positive and unbounded otherwise; a bare
    /// positive `max_rps` yields a stable bucket. Malformed values are
    /// configuration errors.
    pub fn rate_limiter(&self) -> Result<Option<Arc<dyn RateLimiter>>> {
        if let Some(increase_rate) = &self.request_increase_rate {
            let target = if self.max_rps > 0 {
                tracing::warn!(
                    max_rps = self.max_rps,
                    "both max-rps and request-increase-rate set, max-rps caps the ramp"
                );
                self.max_rps
            } else {
                i64::MAX
            };
            let limiter = RampedRateLimiter::new(target, increase_rate)?;
            return Ok(Some(Arc::new(limiter)));
        }
        if self.max_rps > 0 {
            let limiter = StableRateLimiter::new(self.max_rps)?;
            return Ok(Some(Arc::new(limiter)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.master_host, "127.0.0.1");
        assert_eq!(options.master_port, 5557);
        assert_eq!(options.hatch_type, "asap");
        assert_eq!(options.num_users, 1);
        assert_eq!(options.max_rps, 0);
        assert!(options.run_tasks.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let options = Options::parse_from([
            "boomer",
            "--master-host",
            "10.0.0.2",
            "--master-port",
            "5558",
            "--hatch-type",
            "smooth",
            "--hatch-rate",
            "5",
            "--hatch-count",
            "50",
            "--max-rps",
            "100",
        ]);
        assert_eq!(options.master_host, "10.0.0.2");
        assert_eq!(options.master_port, 5558);
        assert_eq!(options.hatch_type, "smooth");
        assert_eq!(options.hatch_rate, 5);
        assert_eq!(options.num_users, 50);
        assert_eq!(options.max_rps, 100);
    }

    #[test]
    fn test_no_limiter_by_default() {
        assert!(Options::default().rate_limiter().unwrap().is_none());
    }

    #[test]
    fn test_max_rps_builds_stable_limiter() {
        let options = Options {
            max_rps: 100,
            ..Default::default()
        };
        assert!(options.rate_limiter().unwrap().is_some());
    }

    #[test]
    fn test_increase_rate_builds_ramped_limiter() {
        let options = Options {
            request_increase_rate: Some("10/2s".to_owned()),
            ..Default::default()
        };
        assert!(options.rate_limiter().unwrap().is_some());
    }

    #[test]
    fn test_malformed_increase_rate_is_config_error() {
        let options = Options {
            request_increase_rate: Some("warp speed".to_owned()),
            ..Default::default()
        };
        assert!(options.rate_limiter().is_err());
    }
}
