use std::io;

use thiserror::Error;

/// Invalid observer setup. Raised by `subscribe`/`start`, never from a capture thread.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("subscription `{0}` has no queue number")]
    MissingQueueNum(String),

    #[error("subscription `{0}` has no callback")]
    MissingCallback(String),

    #[error("queue {0} already has a subscription")]
    DuplicateQueue(u16),

    #[error("source is already bound to queue {0}")]
    AlreadyBound(u16),

    #[error("source has no bound queue")]
    NotBound,

    #[error("observer has already been started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("queue {queue_num}: {source}")]
    Queue {
        queue_num: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to open kernel queue socket: {0}")]
    Open(#[source] io::Error),

    #[error("failed to spawn capture thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no packet source available for {0}")]
    UnsupportedPlatform(&'static str),
}

impl FirewallError {
    pub fn queue(queue_num: u16, source: io::Error) -> Self {
        Self::Queue { queue_num, source }
    }
}

/// Why a raw capture could not be turned into a `PacketRecord`.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty capture")]
    Empty,

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unsupported network layer")]
    UnsupportedNetwork,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event log line {line} is invalid: {source}")]
    InvalidLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("event sink thread panicked")]
    Panicked,
}
