/// Wire types and framing for the two supervisor channels.
/// Every frame is a single JSON document terminated by `\n`; serde_json never
/// emits a raw newline inside a document, so the newline is an unambiguous
/// delimiter.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Upper bound on a single buffered frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame too large ({0} bytes buffered)")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A shell command to run in the supervisor. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default = "default_use_shell")]
    pub use_shell: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_use_shell() -> bool {
    true
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            use_shell: true,
            env: HashMap::new(),
        }
    }

    pub fn use_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    /// Add one environment override on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Manager -> supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Execute(CommandRequest),
    Terminate,
    Ping,
    Exit,
}

impl Request {
    /// Whether handling this request ends the currently running command.
    pub fn preempts_command(&self) -> bool {
        matches!(self, Request::Execute(_) | Request::Terminate | Request::Exit)
    }
}

/// Supervisor -> manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputMessage {
    Started { command: String, pid: u32 },
    Output { stream: Stream, text: String },
    Completed { exit_code: i32 },
    Error { message: String },
    Terminated { message: String },
    Crashed { message: String },
    Alive { message: String },
    /// Answer to an explicit terminate when nothing was running.
    Idle { message: String },
}

impl OutputMessage {
    /// Terminal messages end a command's message stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputMessage::Completed { .. }
                | OutputMessage::Error { .. }
                | OutputMessage::Terminated { .. }
                | OutputMessage::Crashed { .. }
        )
    }
}

/// Serialize one frame, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Write one frame with a single `write_all` so frames never interleave.
pub fn write_frame<W: Write, T: Serialize>(out: &mut W, message: &T) -> io::Result<()> {
    let frame = encode(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&frame)?;
    out.flush()
}

/// Result of draining a non-blocking source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Source would block; more data may come later.
    Open,
    /// Source reached end-of-file.
    Closed,
}

/// Incremental frame splitter. Bytes go in, decoded frames come out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read everything currently available from a non-blocking source.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<Fill> {
        let mut chunk = [0u8; 8192];
        loop {
            match src.read(&mut chunk) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Next complete frame, if any. Blank lines are skipped. An oversized
    /// frame is dropped up to its terminating newline and reported once.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<Result<T, IpcError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_FRAME_LEN {
                    let len = self.buf.len();
                    self.buf.clear();
                    let first = !self.discarding;
                    self.discarding = true;
                    if first {
                        return Some(Err(IpcError::FrameTooLarge(len)));
                    }
                }
                return None;
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(serde_json::from_slice(line).map_err(IpcError::from));
        }
    }

    /// Decode every complete frame, logging and skipping malformed ones.
    pub fn drain_frames<T: DeserializeOwned>(&mut self) -> Vec<T> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            match frame {
                Ok(frame) => frames.push(frame),
                Err(e) => log::warn!("dropping frame: {e}"),
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = Request::Execute(CommandRequest::new("echo hi").env("A", "1"));
        let frame = encode(&req).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains(r#""action":"execute""#));
        assert!(text.contains(r#""command":"echo hi""#));

        let ping = String::from_utf8(encode(&Request::Ping).unwrap()).unwrap();
        assert_eq!(ping, "{\"action\":\"ping\"}\n");
    }

    #[test]
    fn test_execute_defaults_when_fields_missing() {
        let mut dec = FrameDecoder::new();
        dec.feed(b"{\"action\":\"execute\",\"command\":\"ls\"}\n");
        let req: Request = dec.next_frame().unwrap().unwrap();
        assert_eq!(req, Request::Execute(CommandRequest::new("ls")));
    }

    #[test]
    fn test_output_wire_format() {
        let msg = OutputMessage::Output { stream: Stream::Stderr, text: "oops\n".into() };
        let text = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert_eq!(text, "{\"status\":\"output\",\"stream\":\"stderr\",\"text\":\"oops\\n\"}\n");
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut dec = FrameDecoder::new();
        let frame = encode(&OutputMessage::Completed { exit_code: 3 }).unwrap();
        let (a, b) = frame.split_at(5);
        dec.feed(a);
        assert!(dec.next_frame::<OutputMessage>().is_none());
        dec.feed(b);
        dec.feed(&encode(&OutputMessage::Alive { message: "up".into() }).unwrap());
        let frames: Vec<OutputMessage> = dec.drain_frames();
        assert_eq!(frames, vec![
            OutputMessage::Completed { exit_code: 3 },
            OutputMessage::Alive { message: "up".into() },
        ]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut dec = FrameDecoder::new();
        dec.feed(b"not json\n\n{\"action\":\"exit\"}\n");
        assert!(matches!(dec.next_frame::<Request>(), Some(Err(IpcError::Malformed(_)))));
        assert_eq!(dec.next_frame::<Request>().unwrap().unwrap(), Request::Exit);
        assert!(dec.next_frame::<Request>().is_none());
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut dec = FrameDecoder::new();
        dec.feed(&vec![b'x'; MAX_FRAME_LEN + 1]);
        assert!(matches!(dec.next_frame::<Request>(), Some(Err(IpcError::FrameTooLarge(_)))));
        dec.feed(b"still the same frame\n{\"action\":\"ping\"}\n");
        assert_eq!(dec.next_frame::<Request>().unwrap().unwrap(), Request::Ping);
    }

    #[test]
    fn test_fill_from_reports_eof() {
        let mut dec = FrameDecoder::new();
        let mut src: &[u8] = b"{\"action\":\"terminate\"}\n";
        assert_eq!(dec.fill_from(&mut src).unwrap(), Fill::Closed);
        assert_eq!(dec.next_frame::<Request>().unwrap().unwrap(), Request::Terminate);
    }

    #[test]
    fn test_terminal_and_preempting_kinds() {
        assert!(OutputMessage::Completed { exit_code: 0 }.is_terminal());
        assert!(OutputMessage::Crashed { message: String::new() }.is_terminal());
        assert!(!OutputMessage::Alive { message: String::new() }.is_terminal());
        assert!(!OutputMessage::Idle { message: String::new() }.is_terminal());
        assert!(Request::Terminate.preempts_command());
        assert!(!Request::Ping.preempts_command());
    }
}
