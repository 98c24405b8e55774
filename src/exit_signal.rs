/// Exit signal shared between the manager and its supervisor process.
///
/// Backed by a pipe. The manager keeps the write end; the supervisor
/// inherits the read end as [`EXIT_SIGNAL_FD`]. The signal counts as set
/// once the read end turns readable, either because the manager wrote a
/// byte or because the manager went away and the pipe hit EOF. Nothing
/// ever clears it: a stop/restart cycle builds a brand new pipe.

use mio::unix::pipe::{self, Receiver, Sender};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Descriptor the supervisor finds its end of the pipe on.
pub const EXIT_SIGNAL_FD: RawFd = 3;

/// Manager side.
pub struct ExitSignal {
    tx: Sender,
    set: bool,
}

/// Supervisor side.
pub struct ExitWatch {
    rx: Receiver,
    set: bool,
}

impl ExitSignal {
    /// Create a fresh, unset signal together with the end to hand over.
    pub fn pair() -> io::Result<(ExitSignal, ExitWatch)> {
        let (tx, rx) = pipe::new()?;
        Ok((ExitSignal { tx, set: false }, ExitWatch { rx, set: false }))
    }

    /// Set the signal. Monotonic; repeated calls are no-ops.
    pub fn set(&mut self) {
        if self.set {
            return;
        }
        self.set = true;
        match self.tx.write(&[1]) {
            Ok(_) => {}
            // A full pipe is already readable, a closed one means the
            // supervisor is gone. Either way there is nothing left to tell it.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::debug!("exit signal write failed: {e}"),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set
    }
}

impl ExitWatch {
    /// Adopt the descriptor inherited from the manager, if there is one.
    pub fn inherited() -> Option<ExitWatch> {
        // SAFETY: F_GETFD only queries descriptor flags.
        if unsafe { nix::libc::fcntl(EXIT_SIGNAL_FD, nix::libc::F_GETFD) } < 0 {
            return None;
        }
        // Keep it away from the commands this process spawns.
        unsafe { nix::libc::fcntl(EXIT_SIGNAL_FD, nix::libc::F_SETFD, nix::libc::FD_CLOEXEC) };
        // SAFETY: the descriptor is open and nothing else in this process owns it.
        let rx = unsafe { Receiver::from_raw_fd(EXIT_SIGNAL_FD) };
        if let Err(e) = rx.set_nonblocking(true) {
            log::warn!("exit signal descriptor unusable: {e}");
            return None;
        }
        Some(ExitWatch { rx, set: false })
    }

    /// Non-blocking check. Once observed set, stays set.
    pub fn is_set(&mut self) -> bool {
        if self.set {
            return true;
        }
        let mut byte = [0u8; 1];
        loop {
            match self.rx.read(&mut byte) {
                Ok(_) => {
                    // Either a byte or EOF; both mean stop.
                    self.set = true;
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    log::warn!("exit signal unreadable, treating as set: {e}");
                    self.set = true;
                    return true;
                }
            }
        }
    }

    pub fn receiver(&mut self) -> &mut Receiver {
        &mut self.rx
    }
}

impl AsRawFd for ExitWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

/// Runs in the forked child before exec: put `fd` at [`EXIT_SIGNAL_FD`]
/// without the close-on-exec flag. Only async-signal-safe calls here.
pub(crate) fn install_exit_fd(fd: RawFd) -> io::Result<()> {
    let rc = if fd == EXIT_SIGNAL_FD {
        // dup2 onto itself would leave FD_CLOEXEC in place.
        unsafe { nix::libc::fcntl(fd, nix::libc::F_SETFD, 0) }
    } else {
        unsafe { nix::libc::dup2(fd, EXIT_SIGNAL_FD) }
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
