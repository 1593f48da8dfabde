use serde::Deserialize;
use std::fs;
use std::path::Path;

/// One kernel queue to observe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Name of the subscription, also used as the capture thread name.
    #[serde(default)]
    pub name: Option<String>,

    /// NFQUEUE number used by the iptables/nftables rule.
    #[serde(default)]
    pub queue_num: Option<u16>,
}

impl QueueConfig {
    pub fn display_name(&self) -> String {
        match (&self.name, self.queue_num) {
            (Some(name), _) => name.clone(),
            (None, Some(queue_num)) => format!("queue-{}", queue_num),
            (None, None) => "queue".to_string(),
        }
    }
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Kernel queues to bind.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    /// Append-only event log (one JSON record per line).
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Items per event queue shard.
    #[serde(default = "default_shard_capacity")]
    pub shard_capacity: usize,

    /// Sink retry interval in milliseconds while no event is queued.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// fsync the event log after every event.
    #[serde(default)]
    pub fsync: bool,

    /// Address the status API listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Status API port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_events_path() -> String {
    "firewall-events.json".to_string()
}

fn default_shard_capacity() -> usize {
    fwmon::queue::DEFAULT_SHARD_CAPACITY
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            events_path: default_events_path(),
            shard_capacity: default_shard_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            fsync: false,
            listen: default_listen(),
            port: default_port(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if !cli.queue.is_empty() {
            self.queues = cli
                .queue
                .iter()
                .map(|&queue_num| QueueConfig {
                    name: None,
                    queue_num: Some(queue_num),
                })
                .collect();
        }
        if let Some(ref events_path) = cli.events_path {
            self.events_path = events_path.clone();
        }
        if let Some(shard_capacity) = cli.shard_capacity {
            self.shard_capacity = shard_capacity;
        }
        if cli.fsync {
            self.fsync = true;
        }
        if let Some(ref listen) = cli.listen {
            self.listen = listen.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }
}

use clap::Parser;

/// fwmon: NFQUEUE firewall monitor
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Kernel queue number to observe. Repeat for multiple.
    #[arg(long)]
    pub queue: Vec<u16>,

    /// Event log path.
    #[arg(long)]
    pub events_path: Option<String>,

    /// Items per event queue shard.
    #[arg(long)]
    pub shard_capacity: Option<usize>,

    /// fsync the event log after every event.
    #[arg(long)]
    pub fsync: bool,

    /// Address to serve the status API on.
    #[arg(long)]
    pub listen: Option<String>,

    /// Port to serve the status API on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
queues:
  - name: ssh
    queue_num: 1
  - queue_num: 2
events_path: /var/log/fwmon/events.json
fsync: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[0].display_name(), "ssh");
        assert_eq!(config.queues[1].display_name(), "queue-2");
        assert_eq!(config.events_path, "/var/log/fwmon/events.json");
        assert!(config.fsync);
        assert_eq!(config.shard_capacity, 50_000);
        assert_eq!(config.port, 3000);
        assert_eq!(config.listen, "127.0.0.1");
    }

    #[test]
    fn test_queue_without_number_is_kept_for_validation() {
        let config: Config = serde_yaml::from_str("queues:\n  - name: broken\n").unwrap();
        assert_eq!(config.queues[0].queue_num, None);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::default();
        config.queues.push(QueueConfig {
            name: Some("ssh".into()),
            queue_num: Some(1),
        });

        let cli = CliArgs::parse_from([
            "fwmon", "--queue", "5", "--queue", "6", "-p", "9000", "-q",
        ]);
        config.merge_cli(&cli);

        let numbers: Vec<_> = config.queues.iter().map(|q| q.queue_num).collect();
        assert_eq!(numbers, vec![Some(5), Some(6)]);
        assert_eq!(config.port, 9000);
        assert!(config.quiet);
        assert_eq!(config.events_path, "firewall-events.json");
    }
}
