/// Per-command output record: what ran, what it printed, how it ended.
/// Saved and loaded as pretty JSON.

use crate::ipc::{OutputMessage, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed { exit_code: i32 },
    Error { message: String },
    Terminated { message: String },
    Crashed { message: String },
}

impl Outcome {
    pub fn from_message(message: &OutputMessage) -> Option<Self> {
        match message {
            OutputMessage::Completed { exit_code } => Some(Self::Completed { exit_code: *exit_code }),
            OutputMessage::Error { message } => Some(Self::Error { message: message.clone() }),
            OutputMessage::Terminated { message } => Some(Self::Terminated { message: message.clone() }),
            OutputMessage::Crashed { message } => Some(Self::Crashed { message: message.clone() }),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0 })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub command: String,
    pub pid: Option<u32>,
    pub lines: VecDeque<TranscriptLine>,
    pub outcome: Option<Outcome>,
    /// Lines dropped from the front to stay under `max_lines`.
    #[serde(default)]
    pub dropped: usize,
    #[serde(skip, default = "default_max_lines")]
    max_lines: usize,
}

fn default_max_lines() -> usize {
    10_000
}

impl Transcript {
    pub fn new(command: &str, max_lines: usize) -> Self {
        Self {
            command: command.into(),
            pid: None,
            lines: VecDeque::new(),
            outcome: None,
            dropped: 0,
            max_lines: max_lines.max(1),
        }
    }

    /// Fold one output message in. Returns `true` once the command has
    /// reached a terminal state.
    pub fn record(&mut self, message: &OutputMessage) -> bool {
        match message {
            OutputMessage::Started { command, pid } => {
                self.command = command.clone();
                self.pid = Some(*pid);
            }
            OutputMessage::Output { stream, text } => self.push_line(*stream, text),
            other => {
                if let Some(outcome) = Outcome::from_message(other) {
                    self.outcome = Some(outcome);
                }
            }
        }
        self.is_finished()
    }

    fn push_line(&mut self, stream: Stream, text: &str) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(TranscriptLine { stream, text: text.into() });
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// All output, both streams, in arrival order.
    pub fn text(&self) -> String {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }

    pub fn stream_text(&self, stream: Stream) -> String {
        self.lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.as_str())
            .collect()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
