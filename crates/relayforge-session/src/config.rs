//! Session configuration and the reconnect backoff curve.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-session limits and timers. One copy lives in every [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Most envelopes held for replay while the link is down. Sends beyond
    /// this fail with [`SessionError::Backpressure`](crate::SessionError::Backpressure).
    pub max_unacked: usize,
    /// Deadline applied to calls that don't name their own.
    pub default_call_timeout: Duration,
    /// Reconnect attempts an initiator makes before closing the session.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// How long an acceptor keeps a dropped session around for the peer
    /// to come back before closing it.
    pub reconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_unacked: 4_096,
            default_call_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_grace: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Clamp and fix any out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.max_unacked == 0 {
            warn!("max_unacked of 0 is not allowed, using 1");
            self.max_unacked = 1;
        }
        if self.default_call_timeout.is_zero() {
            warn!("default_call_timeout of 0 is not allowed, using 1ms");
            self.default_call_timeout = Duration::from_millis(1);
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            warn!(
                base = ?self.reconnect_base_delay,
                max = ?self.reconnect_max_delay,
                "reconnect_max_delay below reconnect_base_delay, raising it"
            );
            self.reconnect_max_delay = self.reconnect_base_delay;
        }
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Exponential from `reconnect_base_delay`, capped at
    /// `reconnect_max_delay`, with up to 20% random jitter added so a
    /// fleet of sessions doesn't retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.reconnect_base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.reconnect_max_delay);
        let jitter_cap = capped.as_millis() as u64 / 5;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_cap)
        };
        capped + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_fixes_zero_and_inverted_values() {
        let cfg = SessionConfig {
            max_unacked: 0,
            default_call_timeout: Duration::ZERO,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(1),
            ..SessionConfig::default()
        }
        .validated();

        assert_eq!(cfg.max_unacked, 1);
        assert_eq!(cfg.default_call_timeout, Duration::from_millis(1));
        assert_eq!(cfg.reconnect_max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let cfg = SessionConfig {
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_millis(1_000),
            ..SessionConfig::default()
        };

        let first = cfg.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));

        let third = cfg.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(480));

        let tenth = cfg.backoff(10);
        assert!(tenth >= Duration::from_millis(1_000) && tenth <= Duration::from_millis(1_200));
    }
}
