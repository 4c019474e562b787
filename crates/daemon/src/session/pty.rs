//! Pseudo-terminal allocation and shell spawning.
//!
//! The [`PtyBackend`] trait is the seam between the session lifecycle and
//! the operating system: it hands out a connected controller/target pair and
//! starts a process on the target. [`UnixPtyBackend`] implements it with
//! `posix_openpt` and `fork`/`execve`.
//!
//! Every descriptor is opened close-on-exec and owned by an [`OwnedFd`] from
//! the moment it exists, so an early return at any step closes whatever was
//! opened so far.

use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Interactive shells are disabled by policy.
    #[error("unrestricted shell access is disabled")]
    PolicyDenied,

    /// Failed to allocate the PTY pair.
    #[error("failed to allocate PTY: {0}")]
    AllocationFailed(String),

    /// Failed to start the shell process.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal or reap the shell.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// True for failures that happened before a session existed.
    pub fn is_creation_failure(&self) -> bool {
        matches!(
            self,
            SessionError::PolicyDenied
                | SessionError::AllocationFailed(_)
                | SessionError::SpawnFailed(_)
        )
    }
}

/// Status of a shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Process is running.
    Running,
    /// Process exited with a code.
    Exited(i32),
    /// Process was killed by a signal.
    Killed(i32),
    /// Process is gone but its status was collected elsewhere.
    Terminated,
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl WindowSize {
    /// Creates a window size.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Readiness wait between write retries.
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// The program, arguments, environment and directory for a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl ShellCommand {
    /// Creates a command for the given program with an empty environment.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable, replacing an earlier value for the key.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// Sets several environment variables.
    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter().fold(self, |cmd, (k, v)| cmd.env(k, v))
    }

    /// Sets the directory the shell starts in. A missing directory is not fatal.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Returns the program path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the environment.
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Returns the working directory, if any.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Resolves the program and converts everything the child needs into C
    /// strings so nothing is allocated after `fork`.
    fn prepare(&self) -> Result<PreparedExec, SessionError> {
        let program = which::which(&self.program).map_err(|e| {
            SessionError::SpawnFailed(format!("{}: {}", self.program.display(), e))
        })?;

        let program = c_string(program.as_os_str().as_bytes())?;
        let mut argv = vec![program.clone()];
        for arg in &self.args {
            argv.push(c_string(arg.as_bytes())?);
        }

        let envp = self
            .env
            .iter()
            .filter(|(k, _)| !k.is_empty() && !k.contains('='))
            .map(|(k, v)| c_string(format!("{}={}", k, v).as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let cwd = match &self.working_dir {
            Some(dir) => Some(c_string(dir.as_os_str().as_bytes())?),
            None => None,
        };

        Ok(PreparedExec {
            program,
            argv,
            envp,
            cwd,
        })
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, SessionError> {
    CString::new(bytes).map_err(|_| {
        SessionError::SpawnFailed(format!(
            "argument contains a NUL byte: {:?}",
            OsStr::from_bytes(bytes)
        ))
    })
}

struct PreparedExec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

/// Null-terminated pointer array over borrowed C strings.
fn pointer_array(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// A freshly allocated PTY pair.
#[derive(Debug)]
pub struct PtyPair {
    /// The broker's side.
    pub controller: PtyController,
    /// The side that becomes the shell's controlling terminal.
    pub target: OwnedFd,
}

/// Capability interface for PTY-backed processes.
///
/// `spawn` takes the target by value: it is closed in the caller's process
/// whether or not the spawn succeeds.
pub trait PtyBackend: Send + Sync {
    /// Allocates a connected controller/target pair with the given geometry.
    fn allocate(&self, size: WindowSize) -> Result<PtyPair, SessionError>;

    /// Starts `command` with `target` as its controlling terminal.
    fn spawn(&self, target: OwnedFd, command: &ShellCommand) -> Result<ChildProcess, SessionError>;
}

/// POSIX implementation of [`PtyBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPtyBackend;

impl UnixPtyBackend {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }
}

fn allocation_error(step: &'static str) -> impl Fn(Errno) -> SessionError {
    move |e| SessionError::AllocationFailed(format!("{}: {}", step, e))
}

#[cfg(target_os = "linux")]
fn target_path(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(target_os = "linux"))]
fn target_path(master: &PtyMaster) -> nix::Result<String> {
    static PTSNAME_LOCK: Mutex<()> = Mutex::new(());
    let _guard = PTSNAME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: ptsname's static buffer is only touched while the lock is held.
    unsafe { nix::pty::ptsname(master) }
}

impl PtyBackend for UnixPtyBackend {
    fn allocate(&self, size: WindowSize) -> Result<PtyPair, SessionError> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(allocation_error("posix_openpt"))?;
        grantpt(&master).map_err(allocation_error("grantpt"))?;
        unlockpt(&master).map_err(allocation_error("unlockpt"))?;
        let path = target_path(&master).map_err(allocation_error("ptsname"))?;

        // SAFETY: into_raw_fd transfers sole ownership of a valid descriptor.
        let controller = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };

        let raw = nix::fcntl::open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(allocation_error("open target"))?;
        // SAFETY: open returned a new descriptor that nothing else owns.
        let target = unsafe { OwnedFd::from_raw_fd(raw) };

        let controller = PtyController::new(controller)
            .map_err(|e| SessionError::AllocationFailed(format!("controller setup: {}", e)))?;
        controller
            .resize(size)
            .map_err(|e| SessionError::AllocationFailed(format!("initial size: {}", e)))?;

        tracing::trace!(target_path = %path, rows = size.rows, cols = size.cols, "Allocated PTY");

        Ok(PtyPair { controller, target })
    }

    fn spawn(&self, target: OwnedFd, command: &ShellCommand) -> Result<ChildProcess, SessionError> {
        let exec = command.prepare()?;
        let argv = pointer_array(&exec.argv);
        let envp = pointer_array(&exec.envp);

        // SAFETY: the child only calls async-signal-safe libc functions on
        // memory prepared above, then execs or exits.
        match unsafe { fork() } {
            Err(e) => Err(SessionError::SpawnFailed(format!("fork: {}", e))),
            Ok(ForkResult::Child) => unsafe {
                exec_child(target.as_raw_fd(), &exec, &argv, &envp)
            },
            Ok(ForkResult::Parent { child }) => {
                drop(target);
                tracing::debug!(
                    pid = child.as_raw(),
                    program = %command.program().display(),
                    "Spawned shell"
                );
                Ok(ChildProcess::new(child))
            }
        }
    }
}

/// Child side of the fork. Never returns.
///
/// # Safety
///
/// Must only be called in a freshly forked child. All pointers must stay
/// valid, which holds because the parent's memory is copied.
unsafe fn exec_child(
    target: RawFd,
    exec: &PreparedExec,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    if libc::setsid() < 0 {
        libc::_exit(126);
    }
    if libc::ioctl(target, libc::TIOCSCTTY as _, 0) < 0 {
        libc::_exit(126);
    }
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(target, fd) < 0 {
            libc::_exit(126);
        }
    }
    if target > libc::STDERR_FILENO {
        libc::close(target);
    }

    // The runtime ignores SIGPIPE; ignored dispositions survive exec.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());

    if let Some(cwd) = &exec.cwd {
        // Best effort: the shell starts in the inherited directory otherwise.
        libc::chdir(cwd.as_ptr());
    }

    libc::execve(exec.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    libc::_exit(127)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Waits until `fd` reports any of `events`. Returns false on timeout.
fn wait_for(fd: &File, events: PollFlags, timeout: Duration) -> io::Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd.as_fd(), events)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// The broker's side of a PTY: input writes and geometry updates.
#[derive(Debug)]
pub struct PtyController {
    file: File,
}

impl PtyController {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// Duplicates the descriptor for a reader. The duplicate is close-on-exec.
    pub fn try_clone_reader(&self) -> io::Result<PtyReader> {
        Ok(PtyReader {
            file: self.file.try_clone()?,
        })
    }

    /// Writes all of `data`, waiting while the terminal's input queue is full.
    ///
    /// A full queue is ordinary flow control, so there is no deadline. The
    /// write gives up only when `cancel` fires or the terminal fails.
    pub fn write_all(&self, mut data: &[u8], cancel: &CancellationToken) -> io::Result<()> {
        while !data.is_empty() {
            match (&self.file).write(data) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "terminal closed"));
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if cancel.is_cancelled() {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
                    }
                    wait_for(&self.file, PollFlags::POLLOUT, WRITE_RETRY_INTERVAL)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Updates the terminal geometry.
    pub fn resize(&self, size: WindowSize) -> io::Result<()> {
        let winsize = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reads the current terminal geometry.
    pub fn size(&self) -> io::Result<WindowSize> {
        // SAFETY: winsize is plain data; TIOCGWINSZ fills it in.
        let mut winsize: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::TIOCGWINSZ as _, &mut winsize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WindowSize::new(winsize.ws_row, winsize.ws_col))
    }
}

/// A read-only duplicate of a controller descriptor.
#[derive(Debug)]
pub struct PtyReader {
    file: File,
}

impl PtyReader {
    /// Waits up to `timeout` for output or hang-up.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        wait_for(&self.file, PollFlags::POLLIN, timeout)
    }

    /// Non-blocking read. `WouldBlock` means nothing is pending.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Handle on a spawned shell.
///
/// The shell leads its own session, so its pid is also its process group id.
/// Once the exit status is collected the pid is never signalled again.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Mutex<Option<SessionStatus>>,
}

impl ChildProcess {
    /// Wraps a child created by `fork`.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: Mutex::new(None),
        }
    }

    /// Returns the process id.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Returns the collected status, or `Running` if not yet reaped.
    pub fn status(&self) -> SessionStatus {
        self.lock_status().unwrap_or(SessionStatus::Running)
    }

    /// Returns true once the exit status has been collected.
    pub fn is_reaped(&self) -> bool {
        self.lock_status().is_some()
    }

    fn lock_status(&self) -> Option<SessionStatus> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends `signal` to the shell's process group.
    ///
    /// A group that no longer exists is not an error.
    pub fn signal_group(&self, signal: Signal) -> Result<(), SessionError> {
        if self.is_reaped() {
            return Ok(());
        }
        match killpg(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(format!("{}: {}", signal, e))),
        }
    }

    /// Collects the exit status without blocking.
    pub fn try_reap(&self) -> Result<Option<SessionStatus>, SessionError> {
        self.reap(Some(WaitPidFlag::WNOHANG))
    }

    /// Blocks until the shell exits and collects its status.
    pub fn reap_blocking(&self) -> Result<SessionStatus, SessionError> {
        self.reap(None)
            .map(|status| status.unwrap_or(SessionStatus::Terminated))
    }

    fn reap(&self, flags: Option<WaitPidFlag>) -> Result<Option<SessionStatus>, SessionError> {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = *guard {
            return Ok(Some(status));
        }

        let status = loop {
            match waitpid(self.pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => break SessionStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break SessionStatus::Killed(signal as i32),
                Ok(WaitStatus::StillAlive) => return Ok(None),
                // Stopped or continued: still alive.
                Ok(_) if flags.is_some() => return Ok(None),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break SessionStatus::Terminated,
                Err(e) => return Err(SessionError::KillFailed(format!("waitpid: {}", e))),
            }
        };

        *guard = Some(status);
        Ok(Some(status))
    }
}
