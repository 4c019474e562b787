//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session manager and starts the
//! subsystems that feed it: the terminal channel listener, the local IPC
//! control socket and the idle reaper. Stopping it ends every channel and
//! terminates every shell before returning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use protocol::Principal;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::ipc::{get_socket_path, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::network::{ChannelContext, ChannelServer, ChannelSettings};
use crate::session::{ProfileStore, PtyBackend, SessionManager, SessionSettings};

/// Time channels get to wind down on shutdown before sessions are force-closed.
const CHANNEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A channel authenticated and its shell started.
    ChannelOpened { principal: Principal, peer: SocketAddr },
    /// A channel ended and its session was torn down.
    ChannelClosed {
        principal: Principal,
        peer: SocketAddr,
        reason: String,
    },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    sessions: Arc<SessionManager>,
    profiles: Arc<ProfileStore>,
    authenticator: Arc<Authenticator>,
    /// Channel connections, upgraded or not.
    connections: TaskTracker,
    /// Listener and control loops.
    services: TaskTracker,
    shutdown_token: CancellationToken,
    /// Cancelled when a client asks the daemon to stop over IPC.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator that spawns shells on real pseudo-terminals.
    pub fn new(config: Config) -> Result<Self> {
        let sessions = SessionManager::new(SessionSettings::from(&config.session));
        Self::build(config, sessions)
    }

    /// Creates an orchestrator whose sessions use `backend`.
    pub fn with_backend(config: Config, backend: Arc<dyn PtyBackend>) -> Result<Self> {
        let sessions = SessionManager::with_backend(SessionSettings::from(&config.session), backend);
        Self::build(config, sessions)
    }

    fn build(config: Config, sessions: SessionManager) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let authenticator = Authenticator::from_config(&config.security);
        if !authenticator.is_configured() {
            warn!("No bot token or owner configured; every channel will be refused");
        }

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            profiles: Arc::new(ProfileStore::new(config.session.working_dir.clone())),
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            sessions: Arc::new(sessions),
            authenticator: Arc::new(authenticator),
            connections: TaskTracker::new(),
            services: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
            local_addr: None,
            started_at: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Path of the IPC control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.config
            .daemon
            .socket_path
            .clone()
            .unwrap_or_else(get_socket_path)
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let context = Arc::new(ChannelContext {
            authenticator: Arc::clone(&self.authenticator),
            sessions: Arc::clone(&self.sessions),
            profiles: Arc::clone(&self.profiles),
            settings: ChannelSettings::from(&self.config),
            events: self.event_tx.clone(),
        });

        let listen_addr = &self.config.network.listen_addr;
        let server = match ChannelServer::bind(listen_addr, context).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).with_context(|| format!("Failed to listen on {}", listen_addr));
            }
        };
        let local_addr = server.local_addr().context("Failed to read listener address")?;
        self.local_addr = Some(local_addr);
        self.started_at = Some(Instant::now());

        self.services.spawn(server.run(self.shutdown_token.clone(), self.connections.clone()));

        let socket_path = self.socket_path();
        match IpcServer::bind(&socket_path).await {
            Ok(ipc) => {
                info!("Control socket at {}", socket_path.display());
                let control = ControlPlane {
                    sessions: Arc::clone(&self.sessions),
                    connections: self.connections.clone(),
                    started_at: Instant::now(),
                    listen_addr: local_addr,
                    stop_requested: self.stop_requested.clone(),
                };
                self.services.spawn(serve_ipc(ipc, control, self.shutdown_token.clone()));
            }
            Err(e) => {
                let message = format!("Control socket unavailable at {}: {}", socket_path.display(), e);
                warn!("{}", message);
                self.emit_event(OrchestratorEvent::Error { message });
            }
        }

        if let Some(reaper) = self.sessions.start_idle_reaper(self.shutdown_token.clone()) {
            self.services.spawn(async move {
                let _ = reaper.await;
            });
            debug!("Started idle session reaper");
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started on {}", local_addr);
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Open channels are told to end, then any session still alive is
    /// terminated. Returns once no shell started by this daemon remains.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        self.connections.close();
        if tokio::time::timeout(CHANNEL_DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} channel(s) still open after {:?}",
                self.connections.len(),
                CHANNEL_DRAIN_TIMEOUT
            );
        }

        let closed = self.sessions.close_all().await;
        if closed > 0 {
            debug!("Closed {} remaining session(s)", closed);
        }

        self.services.close();
        self.services.wait().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Returns the profile store.
    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    /// Address channels are accepted on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Time since `start` succeeded.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Returns the number of open channel connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Resolves when a control client has asked the daemon to stop.
    pub async fn stop_requested(&self) {
        self.stop_requested.cancelled().await
    }
}

/// What the IPC control loop needs from the orchestrator.
#[derive(Clone)]
struct ControlPlane {
    sessions: Arc<SessionManager>,
    connections: TaskTracker,
    started_at: Instant,
    listen_addr: SocketAddr,
    stop_requested: CancellationToken,
}

impl ControlPlane {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.sessions.count(),
                channel_count: self.connections.len(),
                listen_addr: self.listen_addr.to_string(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.sessions.list(),
            },
            IpcRequest::CloseSession { principal } => {
                let existed = self.sessions.close(Principal(principal)).await;
                IpcResponse::SessionClosed { principal, existed }
            }
        }
    }
}

async fn serve_ipc(server: IpcServer, control: ControlPlane, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => match accepted {
                Ok(conn) => {
                    let control = control.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_ipc_connection(conn, control, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Control socket closed");
}

async fn serve_ipc_connection(
    mut conn: crate::ipc::IpcConnection,
    control: ControlPlane,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = conn.read_request() => request,
        };

        let response = match request {
            Ok(Some(request)) => {
                debug!(?request, "Control request");
                control.handle(request).await
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("Malformed request: {}", e),
            },
            Err(IpcError::Io(e)) => {
                debug!("Control connection failed: {}", e);
                break;
            }
        };

        if conn.send_response(&response).await.is_err() {
            break;
        }
    }
}
