//! Recognized configuration options for the sync engine.

use std::time::Duration;

/// Tunables for the sync engine; construct with [`Config::default`] and
/// override individual fields, or use [`Config::from_env`] in
/// `collab-server`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Quiet period before a dirty document is saved.
    pub debounce: Duration,
    /// Upper bound on save latency from the first dirty event.
    pub max_debounce: Duration,
    /// Time to wait after the last connection detaches before unloading.
    pub unload_grace: Duration,
    /// Max wait during shutdown flush.
    pub unload_timeout: Duration,
    /// Pub/sub channel name prefix.
    pub cluster_prefix: String,
    /// Opaque per-process tag distinguishing cluster peers.
    pub instance_id: String,
    /// Max accepted wire frame size, in bytes.
    pub max_frame_size: usize,
    /// Awareness entry staleness timeout.
    pub awareness_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_debounce: Duration::from_secs(10),
            unload_grace: Duration::from_secs(5),
            unload_timeout: Duration::from_secs(5),
            cluster_prefix: "yhp".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            max_frame_size: 16 * 1024 * 1024,
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// The pub/sub channel name for a given document name.
    pub fn channel_for(&self, doc_name: &str) -> String {
        format!("{}:doc:{}", self.cluster_prefix, doc_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.debounce, Duration::from_secs(2));
        assert_eq!(c.max_debounce, Duration::from_secs(10));
        assert_eq!(c.unload_grace, Duration::from_secs(5));
        assert_eq!(c.unload_timeout, Duration::from_secs(5));
        assert_eq!(c.cluster_prefix, "yhp");
        assert_eq!(c.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(c.awareness_timeout, Duration::from_secs(30));
    }

    #[test]
    fn channel_naming() {
        let c = Config::default();
        assert_eq!(c.channel_for("room-1"), format!("yhp:doc:room-1"));
    }
}
