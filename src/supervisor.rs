/// Supervisor process: reads requests from the command channel, runs at
/// most one shell command at a time, and streams its lifecycle and output
/// back over the output channel.
///
/// The loop multiplexes the command channel, the exit signal and the
/// child's pipes through one `mio::Poll`, so requests are serviced while a
/// command is running and a hung child can never block shutdown.

use crate::config::SupervisorConfig;
use crate::exit_signal::ExitWatch;
use crate::ipc::{write_frame, CommandRequest, Fill, FrameDecoder, OutputMessage, Request, Stream};
use crate::process::{set_nonblocking, SupervisedChild};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

const REQUESTS: Token = Token(0);
const EXIT: Token = Token(1);
const CHILD_STDOUT: Token = Token(2);
const CHILD_STDERR: Token = Token(3);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Poll timeout while no command is running.
    pub request_poll: Duration,
    /// Poll timeout while a command is running.
    pub output_poll: Duration,
    /// How long a killed child gets to confirm its exit.
    pub kill_confirm: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            request_poll: Duration::from_millis(100),
            output_poll: Duration::from_millis(10),
            kill_confirm: Duration::from_millis(500),
        }
    }
}

impl From<&SupervisorConfig> for SupervisorOptions {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            request_poll: Duration::from_millis(cfg.request_poll_ms),
            output_poll: Duration::from_millis(cfg.output_poll_ms),
            kill_confirm: Duration::from_millis(cfg.kill_confirm_ms),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Supervisor<R: Read + AsRawFd, W: Write> {
    requests: R,
    decoder: FrameDecoder,
    queued: VecDeque<Request>,
    requests_closed: bool,
    output: W,
    exit: Option<ExitWatch>,
    current: Option<SupervisedChild>,
    poll: Poll,
    events: Events,
    options: SupervisorOptions,
}

impl<R: Read + AsRawFd, W: Write> Supervisor<R, W> {
    /// `requests` is switched to non-blocking mode; `output` is written
    /// with blocking, whole-frame writes.
    pub fn new(
        requests: R,
        output: W,
        mut exit: Option<ExitWatch>,
        options: SupervisorOptions,
    ) -> io::Result<Self> {
        set_nonblocking(requests.as_raw_fd())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&requests.as_raw_fd()), REQUESTS, Interest::READABLE)?;
        if let Some(watch) = exit.as_mut() {
            poll.registry()
                .register(watch.receiver(), EXIT, Interest::READABLE)?;
        }
        Ok(Self {
            requests,
            decoder: FrameDecoder::new(),
            queued: VecDeque::new(),
            requests_closed: false,
            output,
            exit,
            current: None,
            poll,
            events: Events::with_capacity(16),
            options,
        })
    }

    /// Serve requests until `exit`, the exit signal, or the command channel
    /// closing. Errors returned here mean the output channel is broken.
    pub fn run(&mut self) -> io::Result<()> {
        log::info!("supervisor {} ready", std::process::id());
        loop {
            if self.exit_requested() {
                log::debug!("exit signal observed");
                self.terminate_current(false)?;
                return Ok(());
            }

            let timeout = if self.current.is_some() {
                self.options.output_poll
            } else {
                self.options.request_poll
            };
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }

            self.read_requests();
            while let Some(request) = self.queued.pop_front() {
                if self.dispatch(request)? == Flow::Exit {
                    return Ok(());
                }
            }
            if self.requests_closed {
                log::info!("command channel closed, exiting");
                self.terminate_current(false)?;
                return Ok(());
            }

            self.pump_current()?;
        }
    }

    /// Best-effort last words after a fatal error: kill the running
    /// command and try to report the crash.
    pub fn report_crash(&mut self, message: &str) {
        if let Some(mut child) = self.current.take() {
            let _ = child.hard_kill(self.options.kill_confirm);
        }
        let crashed = OutputMessage::Crashed { message: message.to_string() };
        if let Err(e) = write_frame(&mut self.output, &crashed) {
            log::debug!("crash report not delivered: {e}");
        }
    }

    fn exit_requested(&mut self) -> bool {
        self.exit.as_mut().is_some_and(ExitWatch::is_set)
    }

    fn read_requests(&mut self) {
        if self.requests_closed {
            return;
        }
        match self.decoder.fill_from(&mut self.requests) {
            Ok(Fill::Open) => {}
            Ok(Fill::Closed) => self.requests_closed = true,
            Err(e) => {
                log::warn!("command channel read failed: {e}");
                self.requests_closed = true;
            }
        }
        let decoded: Vec<Request> = self.decoder.drain_frames();
        self.queued.extend(decoded);
    }

    fn dispatch(&mut self, request: Request) -> io::Result<Flow> {
        log::debug!("request: {request:?}");
        match request {
            Request::Execute(command) => self.execute(command)?,
            Request::Terminate => self.terminate_current(true)?,
            Request::Ping => self.emit(OutputMessage::Alive {
                message: format!("supervisor {} is running", std::process::id()),
            })?,
            Request::Exit => {
                self.terminate_current(false)?;
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn execute(&mut self, request: CommandRequest) -> io::Result<()> {
        self.terminate_current(false)?;

        let mut child = match SupervisedChild::spawn(&request) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("spawn failed for {:?}: {e}", request.command);
                return self.emit(OutputMessage::Error {
                    message: format!("Error executing command: {e}"),
                });
            }
        };

        if let Err(e) = self.register_child(&child) {
            log::warn!("cannot watch pid {}: {e}", child.pid());
            let _ = child.hard_kill(self.options.kill_confirm);
            return self.emit(OutputMessage::Error {
                message: format!("Error executing command: {e}"),
            });
        }

        let pid = child.pid();
        self.current = Some(child);
        self.emit(OutputMessage::Started { command: request.command, pid })
    }

    /// Kill the running command and report it. With nothing running, an
    /// explicit terminate is acknowledged with `Idle`; internal calls stay
    /// silent.
    fn terminate_current(&mut self, acknowledge_idle: bool) -> io::Result<()> {
        let Some(mut child) = self.current.take() else {
            if acknowledge_idle {
                self.emit(OutputMessage::Idle { message: "No command running".into() })?;
            }
            return Ok(());
        };

        self.deregister_child(&child);
        let pid = child.pid();
        log::info!("forcefully terminating pid {pid}");
        match child.hard_kill(self.options.kill_confirm) {
            Ok(()) => self.emit(OutputMessage::Terminated {
                message: format!("Process {pid} forcefully terminated"),
            }),
            Err(e) => self.emit(OutputMessage::Error {
                message: format!("Error terminating process {pid}: {e}"),
            }),
        }
    }

    fn pump_current(&mut self) -> io::Result<()> {
        let Some(child) = self.current.as_mut() else { return Ok(()) };

        for (stream, text) in child.read_available() {
            self.emit(OutputMessage::Output { stream, text })?;
        }

        let Some(child) = self.current.as_mut() else { return Ok(()) };
        let exit_code = match child.try_exit() {
            Ok(None) => return Ok(()),
            Ok(Some(code)) => code,
            Err(e) => {
                log::warn!("waiting on pid {} failed: {e}", child.pid());
                return self.terminate_current(false);
            }
        };

        // The manager queues a terminate before it kills the child directly,
        // so a death we see here may already have a request explaining it.
        self.read_requests();
        if self.queued.iter().any(Request::preempts_command) {
            return Ok(());
        }

        let Some(child) = self.current.take() else { return Ok(()) };
        self.deregister_child(&child);
        log::info!("pid {} exited with code {exit_code}", child.pid());
        for (stream, text) in child.finish() {
            self.emit(OutputMessage::Output { stream, text })?;
        }
        self.emit(OutputMessage::Completed { exit_code })
    }

    fn register_child(&self, child: &SupervisedChild) -> io::Result<()> {
        for (stream, fd) in child.pipe_fds() {
            let token = match stream {
                Stream::Stdout => CHILD_STDOUT,
                Stream::Stderr => CHILD_STDERR,
            };
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        }
        Ok(())
    }

    fn deregister_child(&self, child: &SupervisedChild) {
        for (_, fd) in child.pipe_fds() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    fn emit(&mut self, message: OutputMessage) -> io::Result<()> {
        write_frame(&mut self.output, &message)
    }
}

/// Entry point of the `supervise` subcommand: stdin is the command
/// channel, stdout the output channel, fd 3 the exit signal. Returns the
/// process exit status.
pub fn run_from_stdio(options: SupervisorOptions) -> i32 {
    // SAFETY: this process owns its stdio; nothing else reads stdin or
    // writes stdout once the supervisor starts.
    let requests = unsafe { File::from_raw_fd(0) };
    let output = unsafe { File::from_raw_fd(1) };
    let exit = ExitWatch::inherited();
    if exit.is_none() {
        log::warn!("no exit signal inherited, relying on the command channel");
    }

    let mut supervisor = match Supervisor::new(requests, output, exit, options) {
        Ok(s) => s,
        Err(e) => {
            // The manager notices the dead process and reports the crash.
            log::error!("supervisor setup failed: {e}");
            return 1;
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| supervisor.run())) {
        Ok(Ok(())) => {
            log::info!("supervisor {} exiting", std::process::id());
            0
        }
        Ok(Err(e)) => {
            log::error!("supervisor crashed: {e}");
            supervisor.report_crash(&e.to_string());
            1
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("supervisor panicked: {message}");
            supervisor.report_crash(&format!("panic: {message}"));
            101
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
