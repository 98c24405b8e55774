/// Caller side of the manager contract: a fast output probe, a slow health
/// probe, and crash recovery. A GUI calls the two probes from its own
/// timers; `run_until_finished` drives both on the calling thread.

use crate::classify::{Classifier, Verdict};
use crate::config::Config;
use crate::ipc::{CommandRequest, OutputMessage};
use crate::manager::TerminalManager;
use crate::transcript::{Outcome, Transcript};

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A health check failed; `failures` in a row so far.
    Unhealthy { failures: u32 },
    Restarted,
    RestartFailed,
    /// The command ran past its deadline and was terminated.
    TimedOut,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Unhealthy { failures } => write!(f, "supervisor not responding ({failures} checks)"),
            Notice::Restarted => write!(f, "supervisor restarted"),
            Notice::RestartFailed => write!(f, "failed to restart supervisor"),
            Notice::TimedOut => write!(f, "command timed out, terminating"),
        }
    }
}

/// Receives everything the poller sees. Only `on_message` is required.
pub trait PollHandler {
    fn on_message(&mut self, message: &OutputMessage);

    fn on_finished(&mut self, _transcript: &Transcript, _verdict: Option<&Verdict>) {}

    fn on_notice(&mut self, _notice: &Notice) {}
}

pub struct Poller {
    output_interval: Duration,
    health_interval: Duration,
    restart_after_failures: u32,
    max_lines: usize,
    classifier: Option<Classifier>,
    /// Output of the command currently running.
    current: Option<Transcript>,
    finished: Option<Transcript>,
    health_failures: u32,
}

impl Poller {
    pub fn new(config: &Config) -> Self {
        Self {
            output_interval: Duration::from_millis(config.poller.output_interval_ms.max(1)),
            health_interval: Duration::from_millis(config.poller.health_interval_ms.max(1)),
            restart_after_failures: config.poller.restart_after_failures.max(1),
            max_lines: config.transcript.max_lines,
            classifier: None,
            current: None,
            finished: None,
            health_failures: 0,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Start a command and a fresh transcript for it.
    pub fn execute(&mut self, manager: &mut TerminalManager, request: CommandRequest) -> bool {
        let command = request.command.clone();
        if !manager.execute_command(request) {
            return false;
        }
        self.current = Some(Transcript::new(&command, self.max_lines));
        self.finished = None;
        true
    }

    /// The most recently finished transcript, if not yet taken.
    pub fn take_finished(&mut self) -> Option<Transcript> {
        self.finished.take()
    }

    /// Fast probe. Forwards every message, keeps the transcript, restarts
    /// on a crash. `false` once the manager is stopped and stays stopped.
    pub fn poll_output(&mut self, manager: &mut TerminalManager, handler: &mut dyn PollHandler) -> bool {
        let Some(messages) = manager.get_output() else {
            return manager.is_running();
        };

        for message in &messages {
            handler.on_message(message);
            match message {
                OutputMessage::Started { command, .. } if self.current.is_none() => {
                    self.current = Some(Transcript::new(command, self.max_lines));
                }
                OutputMessage::Alive { .. } | OutputMessage::Idle { .. } => continue,
                _ => {}
            }

            let crashed = matches!(message, OutputMessage::Crashed { .. });
            if message.is_terminal() && self.current.is_none() && !crashed {
                // Spawn errors for commands sent around the poller.
                self.current = Some(Transcript::new("", self.max_lines));
            }
            if let Some(transcript) = self.current.as_mut() {
                if transcript.record(message) {
                    self.finish(handler);
                }
            }
            if crashed {
                log::warn!("supervisor crashed, restarting");
                self.restart(manager, handler);
            }
        }
        manager.is_running()
    }

    /// Slow probe. Restarts only after `restart_after_failures` failed
    /// checks in a row.
    pub fn check_health(&mut self, manager: &mut TerminalManager, handler: &mut dyn PollHandler) -> bool {
        if manager.check_health() {
            self.health_failures = 0;
            return true;
        }
        self.health_failures += 1;
        handler.on_notice(&Notice::Unhealthy { failures: self.health_failures });
        if self.health_failures >= self.restart_after_failures {
            self.health_failures = 0;
            // Hand out whatever is buffered first; a pending crash restarts
            // on its own.
            self.poll_output(manager, handler);
            if !manager.check_health() {
                self.abandon(handler, "supervisor restarted after failed health checks");
                self.restart(manager, handler);
            }
        }
        false
    }

    /// Drive both probes until the current command finishes. With a
    /// `deadline` the command is terminated once it has run that long.
    pub fn run_until_finished(
        &mut self,
        manager: &mut TerminalManager,
        handler: &mut dyn PollHandler,
        deadline: Option<Duration>,
    ) -> Option<Transcript> {
        let started = Instant::now();
        let mut next_health = started + self.health_interval;
        let mut timed_out = false;

        loop {
            let running = self.poll_output(manager, handler);
            if let Some(transcript) = self.take_finished() {
                return Some(transcript);
            }
            if !running && self.current.is_none() {
                return None;
            }

            let now = Instant::now();
            if now >= next_health {
                self.check_health(manager, handler);
                next_health = now + self.health_interval;
            }
            if let Some(limit) = deadline {
                if !timed_out && now.duration_since(started) >= limit {
                    timed_out = true;
                    handler.on_notice(&Notice::TimedOut);
                    manager.terminate_command();
                }
            }
            thread::sleep(self.output_interval);
        }
    }

    fn finish(&mut self, handler: &mut dyn PollHandler) {
        let Some(transcript) = self.current.take() else { return };
        let verdict = match (&self.classifier, &transcript.outcome) {
            (Some(classifier), Some(Outcome::Completed { .. })) => Some(classifier.classify(&transcript.text())),
            _ => None,
        };
        handler.on_finished(&transcript, verdict.as_ref());
        self.finished = Some(transcript);
    }

    fn abandon(&mut self, handler: &mut dyn PollHandler, reason: &str) {
        if let Some(transcript) = self.current.as_mut() {
            transcript.record(&OutputMessage::Crashed { message: reason.into() });
            self.finish(handler);
        }
    }

    fn restart(&mut self, manager: &mut TerminalManager, handler: &mut dyn PollHandler) {
        let notice = if manager.restart() { Notice::Restarted } else { Notice::RestartFailed };
        log::info!("{notice}");
        handler.on_notice(&notice);
    }
}
