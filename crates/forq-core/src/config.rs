//! Worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a worker's reservation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue names to poll, in priority order.
    #[serde(default)]
    pub queues: Vec<String>,

    /// Sleep between empty polls. Zero makes the loop single-shot: it
    /// exits after the first reservation attempt that finds nothing.
    #[serde(default = "default_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Whether to fork a child per job. Ignored on platforms that cannot
    /// fork; the worker degrades to inline execution there.
    #[serde(default = "default_fork")]
    pub fork: bool,
}

const fn default_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_fork() -> bool {
    cfg!(unix)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            interval: default_interval(),
            fork: default_fork(),
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.queues.is_empty());
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.fork, cfg!(unix));
    }

    #[test]
    fn test_deserialize_with_humantime_interval() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{"queues": ["high", "low"], "interval": "250ms", "fork": false}"#,
        )
        .unwrap();
        assert_eq!(config.queues, ["high", "low"]);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert!(!config.fork);
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let config: WorkerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_interval_round_trips() {
        let config = WorkerConfig {
            queues: vec!["default".to_string()],
            interval: Duration::from_secs(2),
            fork: false,
        };
        let decoded: WorkerConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(decoded.interval, config.interval);
    }
}
