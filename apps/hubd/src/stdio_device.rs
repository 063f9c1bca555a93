//! Hub connection over stdin/stdout, one JSON message per line.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use hub_bus::Message;
use hub_provider::{ConnectionError, HubDevice};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

pub struct StdioDevice {
    connection_id: String,
    stdout: Mutex<tokio::io::Stdout>,
    closed: Arc<Notify>,
}

impl StdioDevice {
    /// The returned `Notify` fires once stdin is exhausted.
    pub fn new(connection_id: impl Into<String>) -> (Self, Arc<Notify>) {
        let closed = Arc::new(Notify::new());
        (
            Self {
                connection_id: connection_id.into(),
                stdout: Mutex::new(tokio::io::stdout()),
                closed: closed.clone(),
            },
            closed,
        )
    }
}

fn parse_line(line: &str) -> Option<Message> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Message>(trimmed) {
        Ok(msg) => Some(msg),
        Err(err) => {
            warn!(target: "hub.bridge", error = %err, "skipping undecodable hub line");
            None
        }
    }
}

#[async_trait]
impl HubDevice for StdioDevice {
    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn events(&self) -> BoxStream<'static, Message> {
        let lines = BufReader::new(tokio::io::stdin()).lines();
        let closed = self.closed.clone();
        stream::unfold((lines, closed), |(mut lines, closed)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(msg) = parse_line(&line) {
                            return Some((msg, (lines, closed)));
                        }
                    }
                    Ok(None) => {
                        info!(target: "hub.bridge", "stdin closed");
                        closed.notify_one();
                        return None;
                    }
                    Err(err) => {
                        warn!(target: "hub.bridge", error = %err, "failed to read from stdin");
                        closed.notify_one();
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    async fn send_command(&self, command: Message) -> Result<(), ConnectionError> {
        let mut line = serde_json::to_vec(&command)
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;
        line.push(b'\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}
