use super::lines::LineBuffer;
use super::{exit_code, kill_process_group, set_nonblocking};
use crate::ipc::{CommandRequest, Stream};

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Shell used for `use_shell` requests.
pub const SHELL: &str = "/bin/sh";

/// Reads per stream per call, so a chatty child cannot starve the caller.
const MAX_READS_PER_PUMP: usize = 64;

/// One running command: the process, its two pipes, and the partial lines
/// read from them so far. Pipes are non-blocking; nothing here waits on
/// child I/O.
pub struct SupervisedChild {
    child: Child,
    pid: u32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_lines: LineBuffer,
    stderr_lines: LineBuffer,
}

impl SupervisedChild {
    /// Spawn the request in its own process group with piped stdout/stderr.
    pub fn spawn(request: &CommandRequest) -> io::Result<Self> {
        let mut child = build_command(request)?.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let fds = [
            stdout.as_ref().map(AsRawFd::as_raw_fd),
            stderr.as_ref().map(AsRawFd::as_raw_fd),
        ];
        for fd in fds.into_iter().flatten() {
            if let Err(e) = set_nonblocking(fd) {
                let _ = kill_process_group(pid);
                let _ = child.wait();
                return Err(e);
            }
        }

        log::debug!("spawned pid {pid}: {}", request.command);
        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            stdout_lines: LineBuffer::new(),
            stderr_lines: LineBuffer::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Descriptors still open, for readiness registration.
    pub fn pipe_fds(&self) -> Vec<(Stream, RawFd)> {
        let mut fds = Vec::with_capacity(2);
        if let Some(out) = &self.stdout {
            fds.push((Stream::Stdout, out.as_raw_fd()));
        }
        if let Some(err) = &self.stderr {
            fds.push((Stream::Stderr, err.as_raw_fd()));
        }
        fds
    }

    /// Both pipes have reached EOF.
    pub fn pipes_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    /// Every complete line currently readable, stdout first. A stream that
    /// hits EOF or a read error is closed and its partial line flushed.
    pub fn read_available(&mut self) -> Vec<(Stream, String)> {
        let mut lines = Vec::new();
        read_stream(&mut self.stdout, &mut self.stdout_lines, Stream::Stdout, &mut lines);
        read_stream(&mut self.stderr, &mut self.stderr_lines, Stream::Stderr, &mut lines);
        lines
    }

    /// Exit code if the process has ended.
    pub fn try_exit(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    /// After exit: whatever is still buffered in the pipes, then any
    /// partial lines. Pipes held open by a backgrounded grandchild are not
    /// waited on.
    pub fn finish(mut self) -> Vec<(Stream, String)> {
        let mut lines = self.read_available();
        if let Some(rest) = self.stdout_lines.flush() {
            lines.push((Stream::Stdout, rest));
        }
        if let Some(rest) = self.stderr_lines.flush() {
            lines.push((Stream::Stderr, rest));
        }
        lines
    }

    /// SIGKILL the process group, wait up to `confirm` for the exit, fall
    /// back to killing the process itself, then close both pipes.
    pub fn hard_kill(&mut self, confirm: Duration) -> io::Result<()> {
        let pid = self.pid;
        match kill_process_group(pid) {
            Ok(true) => log::debug!("SIGKILL sent to process group {pid}"),
            Ok(false) => log::debug!("process group {pid} already gone"),
            Err(e) => log::warn!("SIGKILL to process group {pid} failed: {e}"),
        }

        if self.wait_timeout(confirm)?.is_none() {
            log::warn!("process {pid} still alive after SIGKILL, killing directly");
            self.child.kill()?;
            self.child.wait()?;
        }

        self.stdout = None;
        self.stderr = None;
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = kill_process_group(self.pid);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn build_command(request: &CommandRequest) -> io::Result<Command> {
    let mut cmd = if request.use_shell {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(&request.command);
        cmd
    } else {
        let mut parts = request.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(parts);
        cmd
    };
    cmd.envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    Ok(cmd)
}

fn read_stream<R: Read>(
    pipe: &mut Option<R>,
    lines: &mut LineBuffer,
    stream: Stream,
    out: &mut Vec<(Stream, String)>,
) {
    let Some(reader) = pipe.as_mut() else { return };
    let mut chunk = [0u8; 8192];
    let mut closed = false;
    for _ in 0..MAX_READS_PER_PUMP {
        match reader.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => out.extend(lines.push(&chunk[..n]).into_iter().map(|l| (stream, l))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("{stream} read failed, closing pipe: {e}");
                closed = true;
                break;
            }
        }
    }
    if closed {
        if let Some(rest) = lines.flush() {
            out.push((stream, rest));
        }
        *pipe = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pump until the process exits and both pipes are drained.
    fn run_to_end(child: &mut SupervisedChild) -> (Vec<(Stream, String)>, i32) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut lines = Vec::new();
        loop {
            lines.extend(child.read_available());
            if let Some(code) = child.try_exit().unwrap() {
                if child.pipes_closed() || Instant::now() > deadline {
                    return (lines, code);
                }
            }
            assert!(Instant::now() < deadline, "child did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_stdout_and_stderr_are_tagged() {
        let req = CommandRequest::new("echo out; echo err >&2; exit 3");
        let mut child = SupervisedChild::spawn(&req).unwrap();
        let (lines, code) = run_to_end(&mut child);
        assert_eq!(code, 3);
        assert!(lines.contains(&(Stream::Stdout, "out\n".to_string())));
        assert!(lines.contains(&(Stream::Stderr, "err\n".to_string())));
    }

    #[test]
    fn test_env_overrides_are_merged() {
        let req = CommandRequest::new("echo \"$ATL_TEST_VAR:$HOME\"").env("ATL_TEST_VAR", "set");
        let mut child = SupervisedChild::spawn(&req).unwrap();
        let (lines, _) = run_to_end(&mut child);
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(lines, vec![(Stream::Stdout, format!("set:{home}\n"))]);
    }

    #[test]
    fn test_without_shell_splits_arguments() {
        let req = CommandRequest::new("echo a  b").use_shell(false);
        let mut child = SupervisedChild::spawn(&req).unwrap();
        let (lines, code) = run_to_end(&mut child);
        assert_eq!(code, 0);
        assert_eq!(lines, vec![(Stream::Stdout, "a b\n".to_string())]);
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let req = CommandRequest::new("/definitely/not/here").use_shell(false);
        assert!(SupervisedChild::spawn(&req).is_err());
        assert!(SupervisedChild::spawn(&CommandRequest::new("  ").use_shell(false)).is_err());
    }

    #[test]
    fn test_partial_last_line_is_flushed() {
        let req = CommandRequest::new("printf 'no newline'");
        let mut child = SupervisedChild::spawn(&req).unwrap();
        let (lines, _) = run_to_end(&mut child);
        assert_eq!(lines, vec![(Stream::Stdout, "no newline".to_string())]);
    }

    #[test]
    fn test_hard_kill_is_immediate() {
        let req = CommandRequest::new("trap '' TERM; sleep 30");
        let mut child = SupervisedChild::spawn(&req).unwrap();
        let started = Instant::now();
        child.hard_kill(Duration::from_millis(500)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(child.try_exit().unwrap(), Some(-9));
        assert!(child.pipes_closed());
    }

    #[test]
    fn test_hard_kill_reaches_grandchildren() {
        let marker = std::env::temp_dir().join(format!("atl_grandchild_{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let req = CommandRequest::new(format!("(sleep 1; touch {}) & wait", marker.display()));
        let mut child = SupervisedChild::spawn(&req).unwrap();
        child.hard_kill(Duration::from_millis(500)).unwrap();
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "grandchild survived the group kill");
    }

    #[test]
    fn test_finish_collects_trailing_output() {
        let req = CommandRequest::new("echo one; printf two");
        let mut child = SupervisedChild::spawn(&req).unwrap();
        while child.try_exit().unwrap().is_none() {
            thread::sleep(Duration::from_millis(5));
        }
        let lines = child.finish();
        let text: String = lines.into_iter().map(|(_, l)| l).collect();
        assert_eq!(text, "one\ntwo");
    }
}
