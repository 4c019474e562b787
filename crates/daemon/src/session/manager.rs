//! Session lifecycle: creation, replacement and teardown.
//!
//! The manager owns the [`SessionRegistry`] and the [`PtyBackend`]. Every
//! path that ends a session (explicit close, replacement, channel teardown,
//! idle expiry, shutdown) goes through the same termination procedure:
//!
//! 1. stop the reader and close the controller,
//! 2. send SIGHUP and SIGTERM to the shell's process group,
//! 3. wait up to the grace period for the shell to exit,
//! 4. send SIGKILL and reap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use protocol::Principal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bridge::{self, DEFAULT_POLL_INTERVAL};
use super::handle::{Session, SessionHandle, SessionInfo};
use super::profile::ShellProfile;
use super::pty::{
    PtyBackend, PtyPair, SessionError, SessionStatus, ShellCommand, UnixPtyBackend, WindowSize,
};
use super::registry::SessionRegistry;
use crate::config::SessionConfig;

/// Default wait between the polite signals and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(250);

/// How often termination checks whether the shell has exited.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the kernel to deliver SIGKILL before reaping in the background.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the idle sweep interval.
const MAX_IDLE_SWEEP: Duration = Duration::from_secs(30);

/// Settings for sessions created by a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Shell program.
    pub shell: PathBuf,
    /// Whether interactive shells may be started at all.
    pub allow_unrestricted_shell: bool,
    /// Grace period before SIGKILL.
    pub kill_grace: Duration,
    /// Bound on a single output readiness wait.
    pub poll_interval: Duration,
    /// Close sessions with no input or output for this long.
    pub idle_timeout: Option<Duration>,
    /// Geometry before the first resize.
    pub initial_size: WindowSize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            allow_unrestricted_shell: false,
            kill_grace: DEFAULT_KILL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: None,
            initial_size: WindowSize::default(),
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: PathBuf::from(&config.shell),
            allow_unrestricted_shell: config.allow_unrestricted_shell,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            initial_size: WindowSize::new(config.rows, config.cols),
        }
    }
}

/// Creates, replaces and tears down sessions.
pub struct SessionManager {
    backend: Arc<dyn PtyBackend>,
    registry: SessionRegistry,
    settings: SessionSettings,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .field("sessions", &self.registry.count())
            .finish()
    }
}

impl SessionManager {
    /// Creates a manager on the host's PTY backend.
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_backend(settings, Arc::new(UnixPtyBackend::new()))
    }

    /// Creates a manager on a specific backend.
    pub fn with_backend(settings: SessionSettings, backend: Arc<dyn PtyBackend>) -> Self {
        Self {
            backend,
            registry: SessionRegistry::new(),
            settings,
        }
    }

    /// Returns the settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Returns the registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Starts a shell for `principal`, replacing any session it already has.
    ///
    /// On failure nothing is registered and every descriptor opened along the
    /// way is closed.
    pub async fn create(
        &self,
        principal: Principal,
        profile: &ShellProfile,
    ) -> Result<SessionHandle, SessionError> {
        if !self.settings.allow_unrestricted_shell {
            tracing::warn!(principal = %principal, "Shell request refused by policy");
            return Err(SessionError::PolicyDenied);
        }

        let size = self.settings.initial_size;
        let PtyPair { controller, target } = self.backend.allocate(size)?;
        let reader = controller
            .try_clone_reader()
            .map_err(|e| SessionError::AllocationFailed(format!("reader: {}", e)))?;

        let environment = profile.shell_environment();
        let command = ShellCommand::new(&self.settings.shell)
            .envs(environment.clone())
            .cwd(&profile.working_directory);
        let child = self.backend.spawn(target, &command)?;

        let session = Arc::new(Session::new(
            principal,
            controller,
            child,
            size,
            profile.working_directory.clone(),
            environment,
        ));
        let (events, _reader_task) =
            bridge::spawn_reader(&session, reader, self.settings.poll_interval);

        if let Some(previous) = self.registry.install(Arc::clone(&session)) {
            tracing::info!(
                principal = %principal,
                session_id = %previous.id(),
                "Replacing existing session"
            );
            self.terminate(&previous).await;
        }

        tracing::info!(
            principal = %principal,
            session_id = %session.id(),
            pid = session.pid(),
            rows = size.rows,
            cols = size.cols,
            "Created new session"
        );

        Ok(SessionHandle { session, events })
    }

    /// Closes the principal's session. Returns false if it had none.
    pub async fn close(&self, principal: Principal) -> bool {
        match self.registry.remove(principal) {
            Some(session) => {
                self.terminate(&session).await;
                true
            }
            None => false,
        }
    }

    /// Closes a specific session, unregistering it only if it is still the
    /// principal's current one. Returns false if it was already closed.
    pub async fn close_session(&self, session: &Arc<Session>) -> bool {
        self.registry.remove_if(session);
        if session.is_closed() {
            return false;
        }
        self.terminate(session).await;
        true
    }

    /// Closes every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let sessions = self.registry.drain();
        let count = sessions.len();
        futures_util::future::join_all(sessions.iter().map(|s| self.terminate(s))).await;
        if count > 0 {
            tracing::info!(count, "Closed all sessions");
        }
        count
    }

    /// Returns the principal's session info.
    pub fn get(&self, principal: Principal) -> Option<SessionInfo> {
        self.registry.get(principal).map(|s| s.info())
    }

    /// Lists all sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.registry.list().iter().map(|s| s.info()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Closes sessions idle longer than the configured timeout.
    pub async fn reap_idle(&self) -> usize {
        let Some(limit) = self.settings.idle_timeout else {
            return 0;
        };

        let idle: Vec<Arc<Session>> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| s.activity().idle_for() >= limit)
            .collect();

        let mut closed = 0;
        for session in idle {
            tracing::info!(
                principal = %session.principal(),
                session_id = %session.id(),
                idle_secs = session.activity().idle_for().as_secs(),
                "Closing idle session"
            );
            if self.close_session(&session).await {
                closed += 1;
            }
        }
        closed
    }

    /// Starts the idle sweep, if an idle timeout is configured.
    pub fn start_idle_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let limit = self.settings.idle_timeout?;
        let interval = limit.min(MAX_IDLE_SWEEP);
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.reap_idle().await;
                    }
                }
            }
        }))
    }

    /// Runs the termination procedure once per session.
    async fn terminate(&self, session: &Arc<Session>) -> SessionStatus {
        if !session.mark_closed() {
            return session.child().status();
        }
        session.release_controller();

        let status = self.stop_child(session).await;
        tracing::info!(
            principal = %session.principal(),
            session_id = %session.id(),
            pid = session.pid(),
            status = ?status,
            "Session closed"
        );
        status
    }

    async fn stop_child(&self, session: &Arc<Session>) -> SessionStatus {
        let child = session.child();
        if let Ok(Some(status)) = child.try_reap() {
            return status;
        }

        for signal in [Signal::SIGHUP, Signal::SIGTERM] {
            if let Err(e) = child.signal_group(signal) {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to signal shell");
            }
        }

        let deadline = Instant::now() + self.settings.kill_grace;
        loop {
            match child.try_reap() {
                Ok(Some(status)) => return status,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "Failed to reap shell");
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(REAP_POLL_INTERVAL.min(deadline - now)).await;
        }

        tracing::debug!(session_id = %session.id(), "Grace period elapsed, sending SIGKILL");
        if let Err(e) = child.signal_group(Signal::SIGKILL) {
            tracing::warn!(session_id = %session.id(), error = %e, "Failed to kill shell");
        }

        let reaping = Arc::clone(session);
        let reaper = tokio::task::spawn_blocking(move || reaping.child().reap_blocking());
        match tokio::time::timeout(KILL_REAP_TIMEOUT, reaper).await {
            Ok(Ok(Ok(status))) => status,
            Ok(Ok(Err(e))) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to reap shell");
                SessionStatus::Terminated
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Reaper task failed");
                SessionStatus::Terminated
            }
            Err(_) => {
                tracing::warn!(session_id = %session.id(), "Shell still running after SIGKILL, reaping in background");
                SessionStatus::Running
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bridge::ReaderEvent;
    use std::collections::BTreeMap;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[derive(Default)]
    struct CountingBackend {
        inner: UnixPtyBackend,
        allocations: AtomicUsize,
        spawns: AtomicUsize,
        fail_allocate: bool,
    }

    impl PtyBackend for CountingBackend {
        fn allocate(&self, size: WindowSize) -> Result<PtyPair, SessionError> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            if self.fail_allocate {
                return Err(SessionError::AllocationFailed("no ptys left".into()));
            }
            self.inner.allocate(size)
        }

        fn spawn(&self, target: OwnedFd, command: &ShellCommand) -> Result<crate::session::pty::ChildProcess, SessionError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(target, command)
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            allow_unrestricted_shell: true,
            ..SessionSettings::default()
        }
    }

    fn profile() -> ShellProfile {
        ShellProfile {
            working_directory: std::env::temp_dir(),
            environment: BTreeMap::from([
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("PS1".to_string(), "$ ".to_string()),
            ]),
        }
    }

    /// Collects output until `marker` appears. Returns whether it was seen.
    async fn wait_for_output(handle: &mut SessionHandle, marker: &str) -> bool {
        let mut seen = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(200), handle.events.recv()).await {
                Ok(Some(ReaderEvent::Output(data))) => {
                    seen.push_str(&data);
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(Some(ReaderEvent::Exit)) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    /// Drains events until the stream ends, returning how many exits were seen
    /// and whether any output followed the first exit.
    async fn drain_events(handle: &mut SessionHandle) -> (usize, bool) {
        let mut exits = 0;
        let mut output_after_exit = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), handle.events.recv()).await {
            match event {
                ReaderEvent::Exit => exits += 1,
                ReaderEvent::Output(_) if exits > 0 => output_after_exit = true,
                ReaderEvent::Output(_) => {}
            }
        }
        (exits, output_after_exit)
    }

    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state == "Z" || state == "X")
                .unwrap_or(false),
        }
    }

    async fn wait_gone(pid: u32) -> bool {
        for _ in 0..100 {
            if process_gone(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_policy_denied_allocates_nothing() {
        let backend = Arc::new(CountingBackend::default());
        let manager = SessionManager::with_backend(SessionSettings::default(), backend.clone());

        let err = manager.create(Principal(1), &profile()).await.unwrap_err();
        assert!(matches!(err, SessionError::PolicyDenied));
        assert_eq!(backend.allocations.load(Ordering::SeqCst), 0);
        assert_eq!(backend.spawns.load(Ordering::SeqCst), 0);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_registers_nothing() {
        let backend = Arc::new(CountingBackend {
            fail_allocate: true,
            ..CountingBackend::default()
        });
        let manager = SessionManager::with_backend(settings(), backend.clone());

        let err = manager.create(Principal(1), &profile()).await.unwrap_err();
        assert!(matches!(err, SessionError::AllocationFailed(_)));
        assert_eq!(backend.spawns.load(Ordering::SeqCst), 0);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_failure() {
        let manager = SessionManager::new(SessionSettings {
            shell: PathBuf::from("/nonexistent/shell"),
            ..settings()
        });
        let err = manager.create(Principal(1), &profile()).await.unwrap_err();
        assert!(matches!(err, SessionError::SpawnFailed(_)));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_create_and_echo() {
        let manager = SessionManager::new(settings());
        let mut handle = manager.create(Principal(7), &profile()).await.unwrap();

        assert_eq!(manager.count(), 1);
        let info = manager.get(Principal(7)).unwrap();
        assert_eq!(info.principal, 7);
        assert_eq!(info.pid, handle.session.pid());
        assert_eq!((info.rows, info.cols), (24, 80));
        assert_eq!(info.status, SessionStatus::Running);

        handle.session.write(b"echo manager_$((6*7))\n".to_vec()).await.unwrap();
        assert!(wait_for_output(&mut handle, "manager_42").await);

        assert!(manager.close(Principal(7)).await);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_shell_gets_terminal_environment() {
        let manager = SessionManager::new(settings());
        let mut handle = manager.create(Principal(1), &profile()).await.unwrap();

        handle
            .session
            .write(b"echo \"term=$TERM color=$COLORTERM\"\n".to_vec())
            .await
            .unwrap();
        assert!(wait_for_output(&mut handle, "term=xterm-256color color=truecolor").await);

        manager.close(Principal(1)).await;
    }

    #[tokio::test]
    async fn test_close_emits_single_exit() {
        let manager = SessionManager::new(settings());
        let mut handle = manager.create(Principal(3), &profile()).await.unwrap();
        let pid = handle.session.pid();

        assert!(manager.close(Principal(3)).await);
        assert!(!manager.close(Principal(3)).await);
        assert!(handle.session.is_closed());

        let (exits, output_after_exit) = drain_events(&mut handle).await;
        assert_eq!(exits, 1);
        assert!(!output_after_exit);
        assert!(wait_gone(pid).await);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let manager = SessionManager::new(settings());
        let handle = manager.create(Principal(3), &profile()).await.unwrap();
        manager.close(Principal(3)).await;

        let err = handle.session.write(b"ls\n".to_vec()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyTerminated(_)));
        assert!(handle.session.resize(WindowSize::new(10, 10)).is_err());
    }

    #[tokio::test]
    async fn test_second_create_replaces_first() {
        let manager = SessionManager::new(settings());
        let mut first = manager.create(Principal(9), &profile()).await.unwrap();
        let first_pid = first.session.pid();

        let mut second = manager.create(Principal(9), &profile()).await.unwrap();
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get(Principal(9)).unwrap().id, *second.session.id());
        assert!(first.session.is_closed());

        let (exits, _) = drain_events(&mut first).await;
        assert_eq!(exits, 1);
        assert!(wait_gone(first_pid).await);

        // Tearing down the stale session must not evict the new one.
        assert!(!manager.close_session(&first.session).await);
        assert_eq!(manager.count(), 1);

        second.session.write(b"echo still_here\n".to_vec()).await.unwrap();
        assert!(wait_for_output(&mut second, "still_here").await);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_close_kills_process_group() {
        let manager = SessionManager::new(settings());
        let mut handle = manager.create(Principal(4), &profile()).await.unwrap();

        // Without job control the background job stays in the shell's group.
        handle
            .session
            .write(b"set +m; sleep 30 & echo bgpid=$!:\n".to_vec())
            .await
            .unwrap();

        let mut seen = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut bg_pid = None;
        while bg_pid.is_none() && Instant::now() < deadline {
            if let Ok(Some(ReaderEvent::Output(data))) =
                timeout(Duration::from_millis(200), handle.events.recv()).await
            {
                seen.push_str(&data);
                // The echoed command line also contains "bgpid=", but not digits.
                bg_pid = seen
                    .split("bgpid=")
                    .skip(1)
                    .filter_map(|rest| rest.split(':').next())
                    .find_map(|pid| pid.trim().parse::<u32>().ok());
            }
        }
        let bg_pid = bg_pid.expect("background pid not printed");

        manager.close(Principal(4)).await;
        assert!(wait_gone(bg_pid).await, "background job survived close");
    }

    #[tokio::test]
    async fn test_stubborn_shell_is_killed_after_grace() {
        let manager = SessionManager::new(SessionSettings {
            kill_grace: Duration::from_millis(100),
            ..settings()
        });
        let mut handle = manager.create(Principal(5), &profile()).await.unwrap();
        handle
            .session
            .write(b"trap '' HUP TERM; echo trapped_ok\n".to_vec())
            .await
            .unwrap();
        assert!(wait_for_output(&mut handle, "trapped_ok").await);

        let started = Instant::now();
        manager.close(Principal(5)).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.session.child().status(), SessionStatus::Killed(9));
    }

    #[tokio::test]
    async fn test_shell_exit_ends_stream() {
        let manager = SessionManager::new(settings());
        let mut handle = manager.create(Principal(6), &profile()).await.unwrap();
        handle.session.write(b"exit 3\n".to_vec()).await.unwrap();

        let (exits, _) = drain_events(&mut handle).await;
        assert_eq!(exits, 1);

        assert!(manager.close_session(&handle.session).await);
        assert_eq!(handle.session.child().status(), SessionStatus::Exited(3));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_and_list() {
        let manager = SessionManager::new(settings());
        let _a = manager.create(Principal(1), &profile()).await.unwrap();
        let _b = manager.create(Principal(2), &profile()).await.unwrap();

        let listed: Vec<i64> = manager.list().iter().map(|s| s.principal).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&1) && listed.contains(&2));

        assert_eq!(manager.close_all().await, 2);
        assert_eq!(manager.count(), 0);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_resize_reflected_in_info() {
        let manager = SessionManager::new(settings());
        let handle = manager.create(Principal(8), &profile()).await.unwrap();
        handle.session.resize(WindowSize::new(40, 120)).unwrap();
        let info = manager.get(Principal(8)).unwrap();
        assert_eq!((info.rows, info.cols), (40, 120));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_idle_sessions_reaped() {
        let manager = Arc::new(SessionManager::new(SessionSettings {
            idle_timeout: Some(Duration::from_millis(300)),
            ..settings()
        }));
        let mut handle = manager.create(Principal(1), &profile()).await.unwrap();
        // Let the prompt settle, then stay quiet.
        let _ = wait_for_output(&mut handle, "$ ").await;
        assert_eq!(manager.reap_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.reap_idle().await, 1);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_idle_reaper_disabled_without_timeout() {
        let manager = Arc::new(SessionManager::new(settings()));
        assert!(manager.start_idle_reaper(CancellationToken::new()).is_none());
        assert_eq!(manager.reap_idle().await, 0);
    }

    #[test]
    fn test_settings_from_config() {
        let config = SessionConfig {
            shell: "/bin/bash".into(),
            allow_unrestricted_shell: true,
            kill_grace_ms: 500,
            poll_interval_ms: 50,
            idle_timeout_secs: 0,
            rows: 30,
            cols: 100,
            ..SessionConfig::default()
        };
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.shell, PathBuf::from("/bin/bash"));
        assert!(settings.allow_unrestricted_shell);
        assert_eq!(settings.kill_grace, Duration::from_millis(500));
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.initial_size, WindowSize::new(30, 100));

        let config = SessionConfig {
            idle_timeout_secs: 600,
            ..config
        };
        assert_eq!(
            SessionSettings::from(&config).idle_timeout,
            Some(Duration::from_secs(600))
        );
    }
}
