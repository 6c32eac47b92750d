use std::{fs, path::Path, path::PathBuf, time::Duration};

use labrpc::anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;

/// Tunables of a paxos manager.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PaxosConfig {
    /// Concurrent tasks allowed on the worker pool.
    pub max_threads: usize,
    /// Interval between failure detection pings.
    pub ping_interval_ms: u64,
    /// Silence after which a peer is considered down.
    pub failure_timeout_ms: u64,
    /// Age after which an unacknowledged accept or prepare is sent again.
    pub resend_interval_ms: u64,
    /// Interval between state checkpoints of every group.
    pub log_state_interval_ms: u64,
    /// Interval between log garbage collection rounds.
    pub log_delete_interval_ms: u64,
    /// Parent folder of every node's durable log.
    pub log_folder: PathBuf,
    /// fsync every durable log write.
    pub sync_writes: bool,
    /// Create the default group over all nodes at start.
    pub debug: bool,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            max_threads: 5,
            ping_interval_ms: 1_000,
            failure_timeout_ms: 5_000,
            resend_interval_ms: 2_000,
            log_state_interval_ms: 100_000_000,
            log_delete_interval_ms: 100_000_000,
            log_folder: PathBuf::from("paxoslog"),
            sync_writes: true,
            debug: false,
        }
    }
}

impl PaxosConfig {
    /// Load a JSON config; absent fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load the whitespace separated `Key value` format used by test setups.
    /// Lines that are not exactly two tokens, and unknown keys, are skipped.
    pub fn from_test_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading test config {}", path.display()))?;
        let mut config = Self {
            debug: true,
            ..Self::default()
        };
        for line in data.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 2 {
                continue;
            }
            let (key, value) = (tokens[0], tokens[1]);
            match key {
                "NumberOfReplicas" => debug!("cluster size {} comes from the node list", value),
                "MaxThreads" => config.max_threads = value.parse()?,
                "EnableLogging" => config.sync_writes = value.parse()?,
                "GarbageCollectionInterval" => config.log_delete_interval_ms = value.parse()?,
                "FailureDetectionPingInterval" => config.ping_interval_ms = value.parse()?,
                "FailureDetectionTimeoutInterval" => config.failure_timeout_ms = value.parse()?,
                "PaxosLogFolder" => config.log_folder = PathBuf::from(value),
                _ => warn!("ignoring unknown test config key {}", key),
            }
        }
        Ok(config)
    }

    /// Set the interval between failure detection pings.
    pub fn set_failure_detection_ping_interval(&mut self, interval: Duration) {
        self.ping_interval_ms = interval.as_millis() as u64;
    }

    /// Set the silence after which a peer is considered down.
    pub fn set_failure_detection_timeout_interval(&mut self, timeout: Duration) {
        self.failure_timeout_ms = timeout.as_millis() as u64;
    }

    /// Set the parent folder of the durable logs.
    pub fn set_paxos_log_folder<P: Into<PathBuf>>(&mut self, folder: P) {
        self.log_folder = folder.into();
    }

    /// Interval between failure detection pings.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Silence after which a peer is considered down.
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    /// Age after which an unacknowledged accept or prepare is sent again.
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    /// Interval between state checkpoints.
    pub fn log_state_interval(&self) -> Duration {
        Duration::from_millis(self.log_state_interval_ms)
    }

    /// Interval between log garbage collection rounds.
    pub fn log_delete_interval(&self) -> Duration {
        Duration::from_millis(self.log_delete_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_json_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paxos.json");
        fs::write(&path, r#"{"max_threads": 8, "resend_interval_ms": 100}"#).unwrap();

        let c = PaxosConfig::from_file(&path).unwrap();
        assert_eq!(c.max_threads, 8);
        assert_eq!(c.resend_interval(), Duration::from_millis(100));
        assert_eq!(c.ping_interval_ms, PaxosConfig::default().ping_interval_ms);
    }

    #[test]
    fn test_legacy_test_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testConfig");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "NumberOfReplicas 5").unwrap();
        writeln!(f, "MaxThreads   12").unwrap();
        writeln!(f, "EnableLogging false").unwrap();
        writeln!(f, "this line is ignored").unwrap();
        writeln!(f, "Unknown 3").unwrap();

        let c = PaxosConfig::from_test_config(&path).unwrap();
        assert_eq!(c.max_threads, 12);
        assert!(!c.sync_writes);
        assert!(c.debug);
    }

    #[test]
    fn test_setters() {
        let mut c = PaxosConfig::default();
        c.set_failure_detection_ping_interval(Duration::from_millis(50));
        c.set_failure_detection_timeout_interval(Duration::from_millis(400));
        c.set_paxos_log_folder("/tmp/paxoslog_1");
        assert_eq!(c.ping_interval(), Duration::from_millis(50));
        assert_eq!(c.failure_timeout(), Duration::from_millis(400));
        assert_eq!(c.log_folder, PathBuf::from("/tmp/paxoslog_1"));
    }
}
