/// Child process plumbing: spawning, non-blocking pipes, hard kills.

mod child;
mod lines;

pub use child::{SupervisedChild, SHELL};
pub use lines::{LineBuffer, MAX_LINE_LEN};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getsid, Pid};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn checked_pid(pid: u32) -> io::Result<Pid> {
    // 0 and 1 would hit our own group or init.
    match i32::try_from(pid) {
        Ok(raw) if raw > 1 => Ok(Pid::from_raw(raw)),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("refusing to signal pid {pid}"))),
    }
}

/// SIGKILL a whole process group. `Ok(false)` when the group is already gone.
pub fn kill_process_group(pgid: u32) -> io::Result<bool> {
    match killpg(checked_pid(pgid)?, Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether group `pgid` can still be one of our commands. A live leader
/// must share this process's session; a pid reused outside it fails. With
/// the leader gone the pid cannot be recycled while stragglers keep the
/// group alive, so that case passes.
pub fn is_own_command_group(pgid: u32) -> bool {
    let Ok(p) = checked_pid(pgid) else { return false };
    match getpgid(Some(p)) {
        Err(Errno::ESRCH) => true,
        Ok(g) if g == p => match (getsid(Some(p)), getsid(None)) {
            (Ok(theirs), Ok(ours)) => theirs == ours,
            _ => false,
        },
        _ => false,
    }
}

/// SIGKILL a single process. `Ok(false)` when it is already gone.
pub fn kill_process(pid: u32) -> io::Result<bool> {
    match kill(checked_pid(pid)?, Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Exit code as reported to the manager: the code itself, or `-signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_refuses_special_pids() {
        assert!(kill_process_group(0).is_err());
        assert!(kill_process(1).is_err());
        assert!(kill_process(u32::MAX).is_err());
    }

    #[test]
    fn test_own_command_group_detection() {
        use std::os::unix::process::CommandExt;

        let mut leader = Command::new(SHELL).arg("-c").arg("sleep 5").process_group(0).spawn().unwrap();
        let mut member = Command::new(SHELL).arg("-c").arg("sleep 5").spawn().unwrap();
        let mut foreign = Command::new(SHELL);
        foreign.arg("-c").arg("sleep 5");
        unsafe {
            foreign.pre_exec(|| nix::unistd::setsid().map(drop).map_err(io::Error::from));
        }
        let mut foreign = foreign.spawn().unwrap();

        assert!(is_own_command_group(leader.id()));
        assert!(!is_own_command_group(member.id()));
        assert!(!is_own_command_group(foreign.id()), "leader of another session");

        leader.kill().unwrap();
        leader.wait().unwrap();
        // Gone: killing the group is harmless either way.
        assert!(is_own_command_group(leader.id()));
        for child in [&mut member, &mut foreign] {
            child.kill().unwrap();
            child.wait().unwrap();
        }
        assert!(!is_own_command_group(0));
    }

    #[test]
    fn test_exit_code_of_signaled_process() {
        let mut child = Command::new(SHELL).arg("-c").arg("sleep 5").spawn().unwrap();
        assert!(kill_process(child.id()).unwrap());
        let status = child.wait().unwrap();
        assert_eq!(exit_code(status), -9);
    }

    #[test]
    fn test_exit_code_of_normal_exit() {
        let status = Command::new(SHELL).arg("-c").arg("exit 7").status().unwrap();
        assert_eq!(exit_code(status), 7);
    }
}
