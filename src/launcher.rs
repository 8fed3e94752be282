//! Process launching through a shared delegate.
//!
//! The broker never forks or reaps directly: every `proc_open`, `waitpid`,
//! and `change_user` goes through a [`SpawnDelegate`] held by a [`Launcher`],
//! and every call is serialized by the launcher's delegate lock.

use std::io;
use std::os::unix::io::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid, User};

/// Polling interval while waiting for a child to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The three remote pipe ends remapped onto a child's standard streams.
pub struct ChildPipes {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// A facility that spawns and reaps compiler children on the broker's behalf.
pub trait SpawnDelegate: Send + Sync {
    /// Fork and exec `command` with `stdio` as the child's fds 0..2.
    fn proc_open(
        &self,
        command: &str,
        stdio: ChildPipes,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> io::Result<Pid>;

    /// Wait for `pid` to exit, giving up after `timeout`.
    fn waitpid(&self, pid: Pid, timeout: Duration) -> io::Result<WaitStatus>;

    /// Run subsequently spawned children as `username`.
    fn change_user(&self, username: &str) -> io::Result<()>;
}

/// Default delegate: spawns children from this process via `Command`.
#[derive(Default)]
pub struct DirectSpawn {
    run_as: Mutex<Option<(Uid, Gid)>>,
}

impl SpawnDelegate for DirectSpawn {
    fn proc_open(
        &self,
        command: &str,
        stdio: ChildPipes,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> io::Result<Pid> {
        let mut words = command.split_whitespace();
        let program = words.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty compiler command")
        })?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .stdin(Stdio::from(stdio.stdin))
            .stdout(Stdio::from(stdio.stdout))
            .stderr(Stdio::from(stdio.stderr));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some((uid, gid)) = *self.run_as.lock().expect("spawn delegate lock poisoned") {
            cmd.uid(uid.as_raw()).gid(gid.as_raw());
        }

        let child = cmd.spawn()?;
        // The Child handle owns nothing we need; the pid is reaped through
        // waitpid below.
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn waitpid(&self, pid: Pid, timeout: Duration) -> io::Result<WaitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out waiting for pid {pid}"),
                        ));
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Ok(status) => return Ok(status),
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn change_user(&self, username: &str) -> io::Result<()> {
        let user = User::from_name(username)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no such user: {username}"))
            })?;
        *self.run_as.lock().expect("spawn delegate lock poisoned") = Some((user.uid, user.gid));
        Ok(())
    }
}

/// Holds the process-wide delegate and the mutex serializing access to it.
pub struct Launcher {
    lock: Mutex<()>,
    delegate: RwLock<Option<Arc<dyn SpawnDelegate>>>,
}

impl Launcher {
    /// A launcher with no delegate; calls fail until one is created.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            delegate: RwLock::new(None),
        }
    }

    /// Install the default delegate if none is present.
    pub fn create_delegate(&self) {
        let mut delegate = self.delegate.write().expect("launcher delegate poisoned");
        if delegate.is_none() {
            *delegate = Some(Arc::new(DirectSpawn::default()));
        }
    }

    /// Replace the delegate, e.g. with a host-provided spawning facility.
    pub fn set_delegate(&self, delegate: Arc<dyn SpawnDelegate>) {
        *self.delegate.write().expect("launcher delegate poisoned") = Some(delegate);
    }

    /// Drop the delegate; subsequent calls fail until a new one is created.
    pub fn close_delegate(&self) {
        *self.delegate.write().expect("launcher delegate poisoned") = None;
    }

    /// Take the delegate lock for a sequence of launcher calls.
    pub fn delegate(&self) -> DelegateGuard<'_> {
        DelegateGuard {
            _serial: self.lock.lock().expect("launcher delegate lock poisoned"),
            delegate: self
                .delegate
                .read()
                .expect("launcher delegate poisoned")
                .clone(),
        }
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped, serialized access to the launcher's delegate.
pub struct DelegateGuard<'a> {
    _serial: MutexGuard<'a, ()>,
    delegate: Option<Arc<dyn SpawnDelegate>>,
}

impl DelegateGuard<'_> {
    fn require(&self) -> io::Result<&dyn SpawnDelegate> {
        self.delegate.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "launcher delegate is closed")
        })
    }

    pub fn proc_open(
        &self,
        command: &str,
        stdio: ChildPipes,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> io::Result<Pid> {
        self.require()?.proc_open(command, stdio, cwd, env)
    }

    pub fn waitpid(&self, pid: Pid, timeout: Duration) -> io::Result<WaitStatus> {
        self.require()?.waitpid(pid, timeout)
    }

    pub fn change_user(&self, username: &str) -> io::Result<()> {
        self.require()?.change_user(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{Pipe, PipeFd};
    use std::io::{Read, Write};

    fn three_pipes() -> (Pipe, Pipe, Pipe) {
        (
            Pipe::new().unwrap(),
            Pipe::new().unwrap(),
            Pipe::new().unwrap(),
        )
    }

    #[test]
    fn test_proc_open_round_trip() {
        let delegate = DirectSpawn::default();
        let (stdin, stdout, stderr) = three_pipes();

        let pid = delegate
            .proc_open(
                "cat",
                ChildPipes {
                    stdin: stdin.read,
                    stdout: stdout.write,
                    stderr: stderr.write,
                },
                None,
                &[],
            )
            .expect("failed to spawn cat");

        let mut writer = PipeFd::new(stdin.write);
        writer.write_all(b"hello\n").unwrap();
        drop(writer); // EOF lets cat exit

        let mut output = String::new();
        PipeFd::new(stdout.read)
            .read_to_string(&mut output)
            .unwrap();
        assert_eq!(output, "hello\n");

        let status = delegate.waitpid(pid, Duration::from_secs(5)).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn test_waitpid_times_out() {
        let delegate = DirectSpawn::default();
        let (stdin, stdout, stderr) = three_pipes();

        let pid = delegate
            .proc_open(
                "sleep 30",
                ChildPipes {
                    stdin: stdin.read,
                    stdout: stdout.write,
                    stderr: stderr.write,
                },
                None,
                &[],
            )
            .expect("failed to spawn sleep");

        let err = delegate
            .waitpid(pid, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let status = delegate.waitpid(pid, Duration::from_secs(5)).unwrap();
        assert!(matches!(status, WaitStatus::Signaled(..)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let delegate = DirectSpawn::default();
        let (stdin, stdout, stderr) = three_pipes();
        let err = delegate
            .proc_open(
                "  ",
                ChildPipes {
                    stdin: stdin.read,
                    stdout: stdout.write,
                    stderr: stderr.write,
                },
                None,
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_closed_delegate_refuses_calls() {
        let launcher = Launcher::new();
        let guard = launcher.delegate();
        let err = guard
            .waitpid(Pid::from_raw(1), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_create_then_close_delegate() {
        let launcher = Launcher::new();
        launcher.create_delegate();
        {
            let guard = launcher.delegate();
            assert!(guard.require().is_ok());
        }
        launcher.close_delegate();
        let guard = launcher.delegate();
        assert!(guard.require().is_err());
    }
}
