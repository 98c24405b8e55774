/// GUI-side half of the supervisor pair. Owns the supervisor process, the
/// command and output channels and the exit signal, and offers a polling
/// API that never blocks for long and never returns an error: every
/// failure is logged and folded into a `false` or `None`.

use crate::config::{Config, SupervisorConfig};
use crate::exit_signal::{install_exit_fd, ExitSignal};
use crate::ipc::{encode, CommandRequest, Fill, FrameDecoder, OutputMessage, Request, MAX_FRAME_LEN};
use crate::process::{is_own_command_group, kill_process, kill_process_group, set_nonblocking};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const OUTPUT: Token = Token(0);

/// Unsent request bytes allowed to pile up while the supervisor is not reading.
const MAX_OUTBOX_LEN: usize = 4 * MAX_FRAME_LEN;

/// Subcommand the supervisor executable is started with.
pub const SUPERVISE_SUBCOMMAND: &str = "supervise";

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub output_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for ManagerOptions {
    fn from(cfg: &SupervisorConfig) -> Self {
        let program = cfg.program.clone().unwrap_or_else(|| {
            std::env::current_exe().unwrap_or_else(|_| PathBuf::from("atl-terminal"))
        });
        Self {
            program,
            args: vec![
                SUPERVISE_SUBCOMMAND.to_string(),
                format!("--request-poll-ms={}", cfg.request_poll_ms),
                format!("--output-poll-ms={}", cfg.output_poll_ms),
                format!("--kill-confirm-ms={}", cfg.kill_confirm_ms),
            ],
            stop_timeout: Duration::from_millis(cfg.stop_timeout_ms),
            restart_delay: Duration::from_millis(cfg.restart_delay_ms),
            output_timeout: Duration::from_millis(cfg.output_timeout_ms),
        }
    }
}

impl ManagerOptions {
    /// Run `program` with exactly `args` as the supervisor.
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        self.program = program.into();
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// One live supervisor process and the channels to it. Dropped as a whole
/// on stop, so a new start never sees an old channel.
struct SupervisorHandle {
    process: Child,
    pid: u32,
    commands: ChildStdin,
    /// Encoded requests the command pipe has not taken yet.
    outbox: VecDeque<u8>,
    output: ChildStdout,
    decoder: FrameDecoder,
    poll: Poll,
    events: Events,
    exit: ExitSignal,
    output_closed: bool,
    crash_reported: bool,
}

impl SupervisorHandle {
    fn spawn(options: &ManagerOptions) -> io::Result<Self> {
        let (exit, watch) = ExitSignal::pair()?;
        let watch_fd = watch.as_raw_fd();

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // SAFETY: the hook only calls fcntl/dup2, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || install_exit_fd(watch_fd));
        }
        let mut process = cmd.spawn()?;
        drop(watch);

        match Self::attach(&mut process) {
            Ok((commands, output, poll)) => Ok(Self {
                pid: process.id(),
                process,
                commands,
                outbox: VecDeque::new(),
                output,
                decoder: FrameDecoder::new(),
                poll,
                events: Events::with_capacity(4),
                exit,
                output_closed: false,
                crash_reported: false,
            }),
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                Err(e)
            }
        }
    }

    fn attach(process: &mut Child) -> io::Result<(ChildStdin, ChildStdout, Poll)> {
        let missing = |what: &str| io::Error::new(io::ErrorKind::Other, format!("supervisor {what} not piped"));
        let commands = process.stdin.take().ok_or_else(|| missing("stdin"))?;
        let output = process.stdout.take().ok_or_else(|| missing("stdout"))?;
        set_nonblocking(commands.as_raw_fd())?;
        set_nonblocking(output.as_raw_fd())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&output.as_raw_fd()), OUTPUT, Interest::READABLE)?;
        Ok((commands, output, poll))
    }

    /// Queue a request and push as much of the queue as the pipe takes
    /// right now. Never waits for the supervisor to read.
    fn send(&mut self, request: &Request) -> io::Result<()> {
        let frame = encode(request).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if self.outbox.len() + frame.len() > MAX_OUTBOX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("command channel backlog full ({} bytes unsent)", self.outbox.len()),
            ));
        }
        self.outbox.extend(frame);
        self.flush()
    }

    /// Write queued request bytes until the pipe would block. Requests are
    /// queued whole and stay in order.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            let (head, _) = self.outbox.as_slices();
            match self.commands.write(head) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.outbox.clear();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Bytes still waiting for the supervisor to read them.
    fn unsent(&self) -> usize {
        self.outbox.len()
    }

    /// Decode whatever the supervisor has written, waiting up to `timeout`
    /// for the first bytes.
    fn receive(&mut self, timeout: Duration) -> io::Result<Vec<OutputMessage>> {
        if let Err(e) = self.flush() {
            log::debug!("command channel flush failed: {e}");
        }
        if !self.output_closed {
            if !timeout.is_zero() {
                match self.poll.poll(&mut self.events, Some(timeout)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            if self.decoder.fill_from(&mut self.output)? == Fill::Closed {
                self.output_closed = true;
            }
        }
        let frames: Vec<OutputMessage> = self.decoder.drain_frames();
        if frames.iter().any(|m| matches!(m, OutputMessage::Crashed { .. })) {
            self.crash_reported = true;
        }
        Ok(frames)
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.process.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::warn!("cannot query supervisor {}: {e}", self.pid);
                None
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// Wait for the process to end, draining and discarding its output so a
    /// supervisor blocked on a full pipe can still get to the exit.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let _ = self.receive(Duration::ZERO);
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// SIGKILL the supervisor itself and reap it.
    fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = kill_process(self.pid) {
            log::warn!("SIGKILL to supervisor {} failed: {e}", self.pid);
            let _ = self.process.kill();
        }
        if let Err(e) = self.process.wait() {
            log::warn!("reaping supervisor {} failed: {e}", self.pid);
        }
    }
}

pub struct TerminalManager {
    options: ManagerOptions,
    handle: Option<SupervisorHandle>,
    is_running: bool,
    /// Messages read off the output channel but not yet handed out.
    pending: VecDeque<OutputMessage>,
    /// Pid of the command the supervisor last reported as started.
    child_pid: Option<u32>,
}

impl TerminalManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            options,
            handle: None,
            is_running: false,
            pending: VecDeque::new(),
            child_pid: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ManagerOptions::from(&config.supervisor))
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn supervisor_pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Spawn a supervisor with fresh channels. `false` if one is already
    /// running or the spawn fails.
    pub fn start(&mut self) -> bool {
        if self.is_running {
            return false;
        }
        self.pending.clear();
        self.child_pid = None;

        match SupervisorHandle::spawn(&self.options) {
            Ok(handle) => {
                log::info!("supervisor started with pid {}", handle.pid);
                self.handle = Some(handle);
                self.is_running = true;
                true
            }
            Err(e) => {
                log::error!("failed to start supervisor {}: {e}", self.options.program.display());
                self.is_running = false;
                false
            }
        }
    }

    /// Ask the supervisor to exit, wait up to the stop timeout, then kill
    /// it. State is reset either way.
    pub fn stop(&mut self) -> bool {
        if !self.is_running {
            return false;
        }
        if let Some(mut handle) = self.handle.take() {
            log::info!("stopping supervisor {}", handle.pid);
            handle.exit.set();
            if let Err(e) = handle.send(&Request::Exit) {
                log::warn!("exit request not delivered: {e}");
            }
            if !handle.wait_for_exit(self.options.stop_timeout) {
                log::warn!("supervisor {} still alive, killing it", handle.pid);
                handle.kill();
            }
        }
        self.reset();
        log::info!("supervisor stopped");
        true
    }

    pub fn restart(&mut self) -> bool {
        log::info!("restarting supervisor");
        self.stop();
        thread::sleep(self.options.restart_delay);
        self.start()
    }

    /// Queue a command. Completion shows up later through `get_output`.
    pub fn execute_command(&mut self, request: CommandRequest) -> bool {
        if !self.is_running {
            log::debug!("cannot execute {:?}: supervisor not running", request.command);
            return false;
        }
        let Some(handle) = self.handle.as_mut() else { return false };
        log::debug!("sending execute: {}", request.command);
        match handle.send(&Request::Execute(request)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("execute request not delivered: {e}");
                false
            }
        }
    }

    /// Queue a terminate and, if the command is still there, SIGKILL its
    /// process group from here as well in case the supervisor loop is
    /// wedged. Neither step waits on the other.
    pub fn terminate_command(&mut self) -> bool {
        if !self.is_running {
            return false;
        }
        self.pump(Duration::ZERO);
        let Some(handle) = self.handle.as_mut() else { return false };
        let queued = match handle.send(&Request::Terminate) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("terminate request not delivered: {e}");
                false
            }
        };
        if handle.unsent() > 0 {
            log::debug!("supervisor not reading, {} request bytes pending", handle.unsent());
        }
        if handle.is_alive() {
            // Skip a pid the supervisor reaped and the system handed to someone else.
            if let Some(pid) = self.child_pid.filter(|&pid| is_own_command_group(pid)) {
                log::debug!("sending SIGKILL to command group {pid}");
                if let Err(e) = kill_process_group(pid) {
                    log::warn!("direct kill of {pid} failed: {e}");
                }
            }
        }
        queued
    }

    /// Process liveness plus a ping. The `Alive` reply is not waited for;
    /// it arrives later through `get_output`.
    pub fn check_health(&mut self) -> bool {
        if !self.is_running {
            return false;
        }
        if self.reap_if_dead() {
            return false;
        }
        let Some(handle) = self.handle.as_mut() else { return false };
        if let Err(e) = handle.send(&Request::Ping) {
            log::warn!("ping not delivered: {e}");
            self.reap_if_dead();
            return false;
        }
        handle.is_alive()
    }

    pub fn get_output(&mut self) -> Option<Vec<OutputMessage>> {
        self.get_output_timeout(self.options.output_timeout)
    }

    /// Everything received so far, in order, waiting at most `timeout` when
    /// nothing is buffered. `None` when there is nothing.
    pub fn get_output_timeout(&mut self, timeout: Duration) -> Option<Vec<OutputMessage>> {
        if self.is_running {
            let wait = if self.pending.is_empty() { timeout } else { Duration::ZERO };
            self.pump(wait);
            self.reap_if_dead();
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.drain(..).collect())
        }
    }

    /// Hard stop: kill the command, kill the supervisor, reset. Safe to
    /// call when already stopped.
    pub fn kill_terminal(&mut self) -> bool {
        if !self.is_running {
            log::debug!("kill_terminal: supervisor not running");
            return false;
        }
        log::info!("killing supervisor and its command");
        self.terminate_command();
        if let Some(handle) = self.handle.as_mut() {
            handle.kill();
        }
        self.stop();
        true
    }

    fn pump(&mut self, timeout: Duration) {
        let Some(handle) = self.handle.as_mut() else { return };
        match handle.receive(timeout) {
            Ok(messages) => {
                for message in messages {
                    self.track(&message);
                    self.pending.push_back(message);
                }
            }
            Err(e) => log::warn!("reading supervisor output failed: {e}"),
        }
    }

    fn track(&mut self, message: &OutputMessage) {
        match message {
            OutputMessage::Started { pid, .. } => self.child_pid = Some(*pid),
            m if m.is_terminal() => self.child_pid = None,
            _ => {}
        }
    }

    /// If the supervisor died on its own: collect its last words, make sure
    /// the orphaned command is gone, queue a `Crashed`, and go to stopped.
    fn reap_if_dead(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else { return false };
        let Some(status) = handle.exit_status() else { return false };

        self.pump(Duration::ZERO);
        let crash_reported = self.handle.as_ref().is_some_and(|h| h.crash_reported);
        log::warn!("supervisor exited unexpectedly ({status})");

        if let Some(pid) = self.child_pid.filter(|&pid| is_own_command_group(pid)) {
            if let Err(e) = kill_process_group(pid) {
                log::warn!("cleanup kill of orphaned command {pid} failed: {e}");
            }
        }
        if !crash_reported {
            self.pending.push_back(OutputMessage::Crashed {
                message: format!("supervisor process exited unexpectedly ({status})"),
            });
        }
        self.handle = None;
        self.is_running = false;
        self.child_pid = None;
        true
    }

    fn reset(&mut self) {
        self.handle = None;
        self.is_running = false;
        self.pending.clear();
        self.child_pid = None;
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        if self.is_running {
            self.kill_terminal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_supervisor(script: &str) -> TerminalManager {
        let mut options = ManagerOptions::default().with_program("/bin/sh", &["-c", script]);
        options.stop_timeout = Duration::from_millis(300);
        options.restart_delay = Duration::from_millis(10);
        TerminalManager::new(options)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_execute_before_start_is_rejected() {
        let mut mgr = fake_supervisor("exec sleep 30");
        assert!(!mgr.execute_command(CommandRequest::new("echo hi")));
        assert!(!mgr.terminate_command());
        assert!(!mgr.check_health());
        assert!(mgr.get_output().is_none());
        assert!(mgr.supervisor_pid().is_none());
    }

    #[test]
    fn test_stop_and_kill_when_stopped_are_noops() {
        let mut mgr = fake_supervisor("exec sleep 30");
        assert!(!mgr.stop());
        assert!(!mgr.stop());
        assert!(!mgr.kill_terminal());
        assert!(!mgr.is_running());
    }

    #[test]
    fn test_start_failure_leaves_stopped() {
        let options = ManagerOptions::default().with_program("/definitely/not/a/program", &[]);
        let mut mgr = TerminalManager::new(options);
        assert!(!mgr.start());
        assert!(!mgr.is_running());
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut mgr = fake_supervisor("exec sleep 30");
        assert!(mgr.start());
        assert!(!mgr.start());
        assert!(mgr.stop());
    }

    #[test]
    fn test_unresponsive_supervisor_is_killed_on_stop() {
        // Ignores the exit request entirely.
        let mut mgr = fake_supervisor("exec sleep 30");
        assert!(mgr.start());
        assert!(mgr.check_health());
        let started = Instant::now();
        assert!(mgr.stop());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!mgr.is_running());
        assert!(!mgr.stop());
    }

    #[test]
    fn test_requests_never_wait_on_a_stalled_supervisor() {
        // Never reads its input.
        let mut mgr = fake_supervisor("exec sleep 30");
        assert!(mgr.start());
        let big = format!("echo {}", "x".repeat(1 << 20));
        let begun = Instant::now();
        for _ in 0..4 {
            assert!(mgr.execute_command(CommandRequest::new(big.clone())));
        }
        assert!(mgr.terminate_command());
        assert!(begun.elapsed() < Duration::from_secs(2));

        // The backlog is bounded; past it requests are refused, not waited on.
        let accepted = (0..40).filter(|_| mgr.execute_command(CommandRequest::new(big.clone()))).count();
        assert!(accepted < 40);
        assert!(begun.elapsed() < Duration::from_secs(3));
        assert!(mgr.stop());
    }

    #[test]
    fn test_frames_from_supervisor_are_delivered() {
        let mut mgr = fake_supervisor(
            r#"printf '{"status":"alive","message":"hi"}\n{"status":"started","command":"x","pid":4242}\n'; exec sleep 30"#,
        );
        assert!(mgr.start());
        let mut seen = Vec::new();
        assert!(wait_for(|| {
            seen.extend(mgr.get_output().unwrap_or_default());
            seen.len() >= 2
        }));
        assert_eq!(seen[0], OutputMessage::Alive { message: "hi".into() });
        assert_eq!(mgr.child_pid(), Some(4242));
        mgr.stop();
        assert_eq!(mgr.child_pid(), None);
    }

    #[test]
    fn test_dead_supervisor_is_detected() {
        let mut mgr = fake_supervisor("exit 3");
        assert!(mgr.start());
        assert!(wait_for(|| !mgr.check_health()));
        assert!(!mgr.is_running());
        let msgs = mgr.get_output().expect("crash notice");
        assert!(matches!(msgs.last(), Some(OutputMessage::Crashed { .. })));
        assert!(mgr.get_output().is_none());
        assert!(mgr.restart());
        assert!(mgr.is_running());
    }

    #[test]
    fn test_self_reported_crash_is_not_duplicated() {
        let mut mgr = fake_supervisor(r#"printf '{"status":"crashed","message":"boom"}\n'; exit 1"#);
        assert!(mgr.start());
        let mut seen = Vec::new();
        assert!(wait_for(|| {
            seen.extend(mgr.get_output().unwrap_or_default());
            !mgr.is_running()
        }));
        seen.extend(mgr.get_output().unwrap_or_default());
        let crashes = seen.iter().filter(|m| matches!(m, OutputMessage::Crashed { .. })).count();
        assert_eq!(crashes, 1);
    }

    #[test]
    fn test_options_from_config() {
        let cfg = SupervisorConfig { program: Some("/opt/sup".into()), ..SupervisorConfig::default() };
        let options = ManagerOptions::from(&cfg);
        assert_eq!(options.program, PathBuf::from("/opt/sup"));
        assert_eq!(options.args[0], SUPERVISE_SUBCOMMAND);
        assert!(options.args.contains(&"--request-poll-ms=100".to_string()));
        assert_eq!(options.stop_timeout, Duration::from_secs(5));
    }
}
