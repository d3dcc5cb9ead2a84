//! Node configuration, loadable from TOML.

use std::num::NonZeroUsize;
use std::thread;

use relayforge_loop::LoopConfig;
use relayforge_session::{MAX_NODE_ID, SessionConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::NodeError;

/// Everything a [`Node`](crate::Node) needs to start.
///
/// ```rust
/// use relayforge::NodeConfig;
///
/// let config = NodeConfig::from_toml_str(r#"
///     name = "scene-3"
///     node_id = 3
///     loops = 2
///
///     [session]
///     max_unacked = 1024
/// "#).unwrap();
///
/// assert_eq!(config.name, "scene-3");
/// assert_eq!(config.loops, 2);
/// assert_eq!(config.session.max_unacked, 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name, sent in handshakes and used in logs.
    pub name: String,
    /// Node bits for the default guid generator. Distinct per node.
    pub node_id: u16,
    /// Number of event loops. 0 means one per available CPU.
    pub loops: usize,
    /// Settings shared by every event loop.
    #[serde(rename = "loop")]
    pub event_loop: LoopConfig,
    /// Settings applied to every session.
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            node_id: 0,
            loops: 0,
            event_loop: LoopConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// [`NodeError::Config`] when the document is not valid TOML or a
    /// value has the wrong type.
    pub fn from_toml_str(source: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(source).map_err(|e| NodeError::Config(e.to_string()))?;
        Ok(config.validated())
    }

    /// Clamp and fix any out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.name.trim().is_empty() {
            warn!("empty node name, using \"node\"");
            self.name = "node".to_string();
        }
        if self.node_id > MAX_NODE_ID {
            warn!(node_id = self.node_id, max = MAX_NODE_ID, "node_id out of range, masking");
            self.node_id &= MAX_NODE_ID;
        }
        if self.loops == 0 {
            self.loops = thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1);
        }
        self.event_loop = self.event_loop.validated();
        self.session = self.session.validated();
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_from_toml_str_reads_nested_sections() {
        let config = NodeConfig::from_toml_str(
            r#"
            name = "gateway-1"
            node_id = 12
            loops = 4

            [loop]
            queue_capacity = 256
            thread_name_prefix = "gw"

            [session]
            max_unacked = 64
            max_reconnect_attempts = 3

            [session.default_call_timeout]
            secs = 2
            nanos = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "gateway-1");
        assert_eq!(config.node_id, 12);
        assert_eq!(config.loops, 4);
        assert_eq!(config.event_loop.queue_capacity, 256);
        assert_eq!(config.event_loop.thread_name_prefix, "gw");
        assert_eq!(config.session.max_unacked, 64);
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.session.default_call_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_from_toml_str_rejects_wrong_types() {
        let result = NodeConfig::from_toml_str("loops = \"many\"");
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn test_validated_fills_in_loops_and_name() {
        let config = NodeConfig {
            name: "  ".to_string(),
            loops: 0,
            node_id: u16::MAX,
            ..NodeConfig::default()
        }
        .validated();

        assert_eq!(config.name, "node");
        assert!(config.loops >= 1);
        assert_eq!(config.node_id, MAX_NODE_ID);
    }
}
