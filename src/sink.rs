//! Destinations for operator-facing messages (remote progress, ref changes, warnings).
//!
//! The relay never blocks on logging: sinks must return immediately.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::Level;

pub trait LogSink: Send + Sync {
    fn emit(&self, level: Level, message: &str);
}

/// Forwards messages to `tracing` under the `git_relay::remote` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "git_relay::remote", "{message}"),
            Level::WARN => tracing::warn!(target: "git_relay::remote", "{message}"),
            Level::INFO => tracing::info!(target: "git_relay::remote", "{message}"),
            Level::DEBUG => tracing::debug!(target: "git_relay::remote", "{message}"),
            Level::TRACE => tracing::trace!(target: "git_relay::remote", "{message}"),
        }
    }
}

/// Buffers messages in a bounded channel. When the buffer is full new messages are dropped and
/// counted.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<(Level, String)>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(Level, String)>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LogSink for ChannelSink {
    fn emit(&self, level: Level, message: &str) {
        if self.sender.try_send((level, message.to_string())).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
