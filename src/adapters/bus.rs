//! Line-oriented event bus feeds.
//!
//! The bus client prints one event per line, either as a JSON object
//! `{"tag": ..., "data": {...}}` or as `<tag><whitespace><json data>`.
//! Feeds parse those lines into [`RawEvent`]s and forward them over a
//! channel to whoever consumes the stream.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::RawEvent;

/// Errors that can occur while feeding events
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Event command is empty")]
    EmptyCommand,

    #[error("Failed to spawn event command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse one line of bus output. Returns `None` for blank or unreadable lines.
pub fn parse_event_line(line: &str) -> Option<RawEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        return match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Dropping unreadable event line");
                None
            }
        };
    }

    let (tag, rest) = line.split_once(char::is_whitespace)?;
    let data = match rest.trim() {
        "" => Value::Null,
        body => match serde_json::from_str(body) {
            Ok(data) => data,
            Err(e) => {
                debug!(tag, error = %e, "Dropping event with unreadable payload");
                return None;
            }
        },
    };

    Some(RawEvent::new(tag, data))
}

/// Forward parsed lines until the input ends or the receiver goes away
async fn forward_lines<R>(reader: R, tx: &mpsc::Sender<RawEvent>) -> Result<usize, FeedError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_event_line(&line) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            debug!("Event receiver closed, stopping feed");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Live feed from a bus client subprocess
#[derive(Debug, Clone)]
pub struct CommandFeed {
    program: String,
    args: Vec<String>,
}

impl CommandFeed {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a feed from a whitespace-separated command line
    pub fn from_command_line(command: &str) -> Result<Self, FeedError> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().ok_or(FeedError::EmptyCommand)?;
        Ok(Self::new(program, parts.collect()))
    }

    /// Run the bus client and forward its events. Returns the number of
    /// events forwarded.
    pub async fn forward(self, tx: mpsc::Sender<RawEvent>) -> Result<usize, FeedError> {
        info!(program = %self.program, args = ?self.args, "Starting event feed");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FeedError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            return Ok(0);
        };

        let forwarded = forward_lines(BufReader::new(stdout), &tx).await?;

        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                warn!(program = %self.program, %status, "Event command exited with failure");
            }
        }

        Ok(forwarded)
    }
}

/// Feed that replays previously captured bus output from a file
#[derive(Debug, Clone)]
pub struct ReplayFeed {
    path: PathBuf,
}

impl ReplayFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn forward(self, tx: mpsc::Sender<RawEvent>) -> Result<usize, FeedError> {
        info!(path = %self.path.display(), "Replaying events");
        let file = File::open(&self.path).await?;
        forward_lines(BufReader::new(file), &tx).await
    }
}
