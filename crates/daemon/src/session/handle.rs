//! Live session state shared between the registry, the channel and the reader.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use protocol::Principal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bridge::ReaderEvent;
use super::pty::{ChildProcess, PtyController, SessionError, SessionId, SessionStatus, WindowSize};

/// Last-activity clock, shared with the output reader.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    /// Starts a clock that reads as active now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Records activity.
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Information about a session, suitable for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owner of the session.
    pub principal: i64,
    /// Shell process id.
    pub pid: u32,
    /// Shell status.
    pub status: SessionStatus,
    /// Current terminal geometry.
    pub rows: u16,
    /// Current terminal geometry.
    pub cols: u16,
    /// Unix timestamp when the session was created.
    pub created_at: u64,
    /// Seconds since the last input or output.
    pub idle_secs: u64,
    /// Directory the shell was started in.
    pub working_directory: PathBuf,
}

/// One principal's shell: controller, child and bookkeeping.
///
/// The controller lives behind a lock so that closing the session can drop
/// it while an input write still holds its own reference.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    principal: Principal,
    controller: Mutex<Option<Arc<PtyController>>>,
    child: ChildProcess,
    size: Mutex<WindowSize>,
    created_at: SystemTime,
    working_directory: PathBuf,
    environment: Vec<(String, String)>,
    activity: Arc<Activity>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        principal: Principal,
        controller: PtyController,
        child: ChildProcess,
        size: WindowSize,
        working_directory: PathBuf,
        environment: Vec<(String, String)>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            principal,
            controller: Mutex::new(Some(Arc::new(controller))),
            child,
            size: Mutex::new(size),
            created_at: SystemTime::now(),
            working_directory,
            environment,
            activity: Arc::new(Activity::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the owning principal.
    pub fn principal(&self) -> Principal {
        self.principal
    }

    /// Returns the shell process id.
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// Returns the shell handle.
    pub fn child(&self) -> &ChildProcess {
        &self.child
    }

    /// Returns the creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the starting directory.
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Returns the environment the shell was started with.
    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    /// Returns the last geometry applied.
    pub fn size(&self) -> WindowSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the activity clock.
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Token cancelled when the session is closed.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once teardown has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session closed. Returns false if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Drops the session's controller reference and stops the reader.
    pub(crate) fn release_controller(&self) {
        self.cancel.cancel();
        self.controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn controller(&self) -> Result<Arc<PtyController>, SessionError> {
        self.controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SessionError::AlreadyTerminated(self.id.clone()))
    }

    /// Writes input to the shell.
    ///
    /// Waits for as long as the shell takes to drain its input. Closing the
    /// session abandons the write.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        let controller = self.controller()?;
        let cancel = self.cancel.clone();
        self.activity.touch();

        tokio::task::spawn_blocking(move || controller.write_all(&data, &cancel))
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Applies a new terminal geometry.
    pub fn resize(&self, size: WindowSize) -> Result<(), SessionError> {
        let controller = self.controller()?;
        controller
            .resize(size)
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        self.activity.touch();
        tracing::debug!(session_id = %self.id, rows = size.rows, cols = size.cols, "Resized session");
        Ok(())
    }

    /// Snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            id: self.id.clone(),
            principal: self.principal.id(),
            pid: self.pid(),
            status: self.child.status(),
            rows: size.rows,
            cols: size.cols,
            created_at: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            idle_secs: self.activity.idle_for().as_secs(),
            working_directory: self.working_directory.clone(),
        }
    }
}

/// A created session together with its output stream.
///
/// Owned by the channel that created the session. The stream yields
/// [`ReaderEvent::Output`] until exactly one [`ReaderEvent::Exit`].
#[derive(Debug)]
pub struct SessionHandle {
    /// The shared session.
    pub session: Arc<Session>,
    /// Output events from the reader.
    pub events: mpsc::Receiver<ReaderEvent>,
}
