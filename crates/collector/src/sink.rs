use std::io::Write;

use anyhow::{anyhow, Context, Result};
use kmeta_core::{LogGroup, Sink};
use tokio::sync::mpsc;

/// Writes each group as one JSON line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn submit(&self, group: LogGroup) -> Result<()> {
        let line = serde_json::to_string(&group).context("serializing log group")?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line).context("writing log group to stdout")?;
        Ok(())
    }
}

/// Forwards groups into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogGroup>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogGroup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn submit(&self, group: LogGroup) -> Result<()> {
        self.tx.send(group).map_err(|_| anyhow!("log group receiver dropped"))
    }
}
