//! Pseudo-terminal child process management.
//!
//! The agent CLI is spawned inside a PTY so it sees an interactive terminal
//! (pipes change its streaming behavior). The master end is non-blocking and
//! integrates with `poll()`; input is injected by writing to the master.

use std::cell::Cell;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use anima_types::AnimaError;

/// A child process attached to a pseudo-terminal.
pub struct PtySession {
    master: OwnedFd,
    child_pid: Pid,
    /// Exit code once the child has been reaped. Negative for signals.
    exit_code: Cell<Option<i32>>,
}

impl PtySession {
    /// Spawn `command` in a fresh PTY with the given working directory and
    /// extra environment. The child becomes a session leader with the slave
    /// as its controlling terminal.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Self, AnimaError> {
        let pty =
            openpty(None, None).map_err(|e| AnimaError::SessionError(format!("openpty: {e}")))?;

        // Safety: standard fork-then-exec for PTY setup; the child only
        // calls async-signal-safe operations before execvp.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);

                let setup = || -> Result<(), AnimaError> {
                    unistd::setsid()
                        .map_err(|e| AnimaError::SessionError(format!("setsid: {e}")))?;

                    unsafe {
                        if libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                            let err = std::io::Error::last_os_error();
                            eprintln!("anima-agent: TIOCSCTTY failed: {err}");
                        }
                    }

                    unistd::dup2(pty.slave.as_raw_fd(), libc::STDIN_FILENO)
                        .map_err(|e| AnimaError::SessionError(format!("dup2 stdin: {e}")))?;
                    unistd::dup2(pty.slave.as_raw_fd(), libc::STDOUT_FILENO)
                        .map_err(|e| AnimaError::SessionError(format!("dup2 stdout: {e}")))?;
                    unistd::dup2(pty.slave.as_raw_fd(), libc::STDERR_FILENO)
                        .map_err(|e| AnimaError::SessionError(format!("dup2 stderr: {e}")))?;

                    unistd::chdir(working_dir)
                        .map_err(|e| AnimaError::SessionError(format!("chdir: {e}")))?;

                    for (key, value) in env {
                        std::env::set_var(key, value);
                    }

                    let c_command = CString::new(command)
                        .map_err(|e| AnimaError::SessionError(format!("command: {e}")))?;
                    let mut c_args = vec![c_command.clone()];
                    for arg in args {
                        c_args.push(
                            CString::new(arg.as_str())
                                .map_err(|e| AnimaError::SessionError(format!("arg: {e}")))?,
                        );
                    }
                    unistd::execvp(&c_command, &c_args)
                        .map_err(|e| AnimaError::SessionError(format!("execvp {command}: {e}")))?;
                    unreachable!("execvp returned Ok");
                };

                if let Err(e) = setup() {
                    eprintln!("anima-agent: child setup failed: {e}");
                    std::process::exit(127);
                }
                unreachable!();
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);

                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| AnimaError::SessionError(format!("fcntl F_GETFL: {e}")))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| AnimaError::SessionError(format!("fcntl F_SETFL: {e}")))?;

                Ok(Self {
                    master: pty.master,
                    child_pid: child,
                    exit_code: Cell::new(None),
                })
            }
            Err(e) => Err(AnimaError::SessionError(format!("fork: {e}"))),
        }
    }

    /// Non-blocking read from the master. `Ok(0)` means no data right now
    /// (EAGAIN) or the child closed the slave (EIO on Linux).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, AnimaError> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(AnimaError::SessionError(format!("pty read: {e}"))),
        }
    }

    /// Write all bytes to the child's terminal input.
    pub fn write_all(&self, data: &[u8]) -> Result<(), AnimaError> {
        if !self.is_alive() {
            return Err(AnimaError::SessionDead(format!(
                "pid {} exited with {:?}",
                self.child_pid,
                self.exit_code.get()
            )));
        }
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(nix::errno::Errno::EIO) => {
                    return Err(AnimaError::SessionDead(format!(
                        "pid {} closed its terminal",
                        self.child_pid
                    )));
                }
                Err(e) => return Err(AnimaError::SessionError(format!("pty write: {e}"))),
            }
        }
        Ok(())
    }

    /// Send one line of text followed by a newline.
    pub fn send_line(&self, text: &str) -> Result<(), AnimaError> {
        let mut data = text.as_bytes().to_vec();
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Poll the master for readability. Returns `true` when data (or HUP)
    /// is available within `timeout_ms`.
    pub fn poll_readable(&self, timeout_ms: i32) -> Result<bool, AnimaError> {
        let borrowed = self.master.as_fd();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms as u32).unwrap_or(PollTimeout::MAX)
        };

        match nix::poll::poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP))
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(AnimaError::SessionError(format!("poll: {e}"))),
        }
    }

    /// Whether the child is still running. Reaps and records the exit code
    /// as a side effect when the child has terminated.
    pub fn is_alive(&self) -> bool {
        if self.exit_code.get().is_some() {
            return false;
        }
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, code)) => {
                self.exit_code.set(Some(code));
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.exit_code.set(Some(-(sig as i32)));
                false
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Block until the child exits; returns the exit code (negative for
    /// signal termination). Idempotent once reaped.
    pub fn wait(&self) -> Result<i32, AnimaError> {
        if let Some(code) = self.exit_code.get() {
            return Ok(code);
        }
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.exit_code.set(Some(code));
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    let code = -(sig as i32);
                    self.exit_code.set(Some(code));
                    return Ok(code);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    self.exit_code.set(Some(0));
                    return Ok(0);
                }
                Err(e) => return Err(AnimaError::SessionError(format!("waitpid: {e}"))),
            }
        }
    }

    /// Exit code if the child has already been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    /// Send SIGTERM to the child.
    pub fn terminate(&self) -> Result<(), AnimaError> {
        signal::kill(self.child_pid, Signal::SIGTERM)
            .map_err(|e| AnimaError::SessionError(format!("SIGTERM: {e}")))
    }

    /// Send SIGKILL to the child.
    pub fn kill(&self) -> Result<(), AnimaError> {
        signal::kill(self.child_pid, Signal::SIGKILL)
            .map_err(|e| AnimaError::SessionError(format!("SIGKILL: {e}")))
    }

    /// The child's process id.
    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// The raw master fd, for external poll integration.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn drain(session: &PtySession) -> String {
        let mut buf = [0u8; 4096];
        let mut out = Vec::new();
        loop {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn spawn_echo_and_read() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["hello anima".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn");

        std::thread::sleep(Duration::from_millis(100));
        let text = drain(&session);
        assert!(text.contains("hello anima"), "got: {text:?}");
        assert_eq!(session.wait().unwrap(), 0);
    }

    #[test]
    fn write_reaches_child_stdin() {
        let session =
            PtySession::spawn("/bin/cat", &[], &PathBuf::from("/tmp"), &[]).expect("spawn");

        std::thread::sleep(Duration::from_millis(50));
        session.send_line("frame one").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let text = drain(&session);
        assert!(text.contains("frame one"), "got: {text:?}");

        session.write_all(&[0x04]).unwrap(); // Ctrl-D
        assert_eq!(session.wait().unwrap(), 0);
    }

    #[test]
    fn is_alive_reports_exit_and_wait_is_idempotent() {
        let session = PtySession::spawn(
            "/bin/sleep",
            &["0".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn");

        std::thread::sleep(Duration::from_millis(200));
        assert!(!session.is_alive());
        assert_eq!(session.wait().unwrap(), 0);
        assert_eq!(session.wait().unwrap(), 0);
        assert_eq!(session.exit_code(), Some(0));
    }

    #[test]
    fn write_to_dead_child_is_session_dead() {
        let session = PtySession::spawn(
            "/bin/sleep",
            &["0".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn");

        session.wait().unwrap();
        let err = session.send_line("anyone there?").unwrap_err();
        assert!(matches!(err, AnimaError::SessionDead(_)));
    }

    #[test]
    fn kill_terminates_stubborn_child() {
        let session = PtySession::spawn(
            "/bin/sleep",
            &["300".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn");

        assert!(session.is_alive());
        session.kill().unwrap();
        let code = session.wait().unwrap();
        assert_eq!(code, -(Signal::SIGKILL as i32));
    }

    #[test]
    fn poll_readable_sees_output() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["poll me".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn");

        assert!(session.poll_readable(1000).unwrap());
        session.wait().ok();
    }
}
