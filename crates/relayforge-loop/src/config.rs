//! Event loop configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration shared by every loop of an [`EventLoopGroup`](crate::EventLoopGroup).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Capacity of the inbound event queue. Producers get
    /// [`RejectReason::QueueFull`](crate::RejectReason::QueueFull) when it is exhausted.
    pub queue_capacity: usize,
    /// Maximum events drained per iteration before timers get a turn.
    pub max_batch: usize,
    /// How often [`LoopState::on_sweep`](crate::LoopState::on_sweep) runs.
    pub sweep_interval: Duration,
    /// How long a shutting-down loop keeps draining queued events.
    pub shutdown_grace: Duration,
    /// Worker threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65_536,
            max_batch: 1_024,
            sweep_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(5),
            thread_name_prefix: "event-loop".to_string(),
        }
    }
}

impl LoopConfig {
    /// Smallest accepted sweep interval.
    pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`EventLoop::new`](crate::EventLoop::new).
    pub fn validated(mut self) -> Self {
        if self.queue_capacity == 0 {
            warn!("queue_capacity of 0 is not allowed, using 1");
            self.queue_capacity = 1;
        }
        if self.max_batch == 0 {
            warn!("max_batch of 0 is not allowed, using 1");
            self.max_batch = 1;
        }
        if self.sweep_interval < Self::MIN_SWEEP_INTERVAL {
            warn!(
                interval = ?self.sweep_interval,
                min = ?Self::MIN_SWEEP_INTERVAL,
                "sweep_interval below minimum, clamping"
            );
            self.sweep_interval = Self::MIN_SWEEP_INTERVAL;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "event-loop".to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_clamps_zero_values() {
        let cfg = LoopConfig {
            queue_capacity: 0,
            max_batch: 0,
            sweep_interval: Duration::ZERO,
            thread_name_prefix: String::new(),
            ..LoopConfig::default()
        }
        .validated();

        assert_eq!(cfg.queue_capacity, 1);
        assert_eq!(cfg.max_batch, 1);
        assert_eq!(cfg.sweep_interval, LoopConfig::MIN_SWEEP_INTERVAL);
        assert_eq!(cfg.thread_name_prefix, "event-loop");
    }

    #[test]
    fn test_validated_keeps_sane_values() {
        let cfg = LoopConfig::default().validated();
        assert_eq!(cfg.queue_capacity, 65_536);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(10));
    }
}
