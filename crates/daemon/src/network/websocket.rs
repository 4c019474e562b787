//! WebSocket transport for terminal channels.
//!
//! Each accepted connection on the configured path becomes one channel:
//! authenticate, start the principal's shell, then pump frames both ways
//! until either side ends. The session is torn down on every exit path.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{InboundFrame, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::handshake::{authenticate, ChannelState};
use crate::auth::Authenticator;
use crate::config::Config;
use crate::orchestrator::OrchestratorEvent;
use crate::session::{
    Dispatch, Dispatcher, ProfileStore, ReaderEvent, SessionError, SessionManager,
};

/// Channel behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Request path that upgrades to a terminal channel.
    pub path: String,
    /// Time allowed for the `auth` message.
    pub auth_timeout: Duration,
    /// Treat non-message text frames as typed input.
    pub raw_input_fallback: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            path: "/ws/terminal".to_string(),
            auth_timeout: super::handshake::DEFAULT_AUTH_TIMEOUT,
            raw_input_fallback: true,
        }
    }
}

impl From<&Config> for ChannelSettings {
    fn from(config: &Config) -> Self {
        Self {
            path: config.network.path.clone(),
            auth_timeout: Duration::from_secs(config.network.auth_timeout_secs),
            raw_input_fallback: config.session.raw_input_fallback,
        }
    }
}

/// Everything a channel needs, shared across connections.
pub struct ChannelContext {
    /// Credential and ownership checks.
    pub authenticator: Arc<Authenticator>,
    /// Session lifecycle.
    pub sessions: Arc<SessionManager>,
    /// Per-principal shell profiles.
    pub profiles: Arc<ProfileStore>,
    /// Channel settings.
    pub settings: ChannelSettings,
    /// Where channel open/close events go.
    pub events: broadcast::Sender<OrchestratorEvent>,
}

/// Accepts terminal channels on a TCP listener.
pub struct ChannelServer {
    listener: TcpListener,
    context: Arc<ChannelContext>,
}

impl ChannelServer {
    /// Binds the listener.
    pub async fn bind(addr: &str, context: Arc<ChannelContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled. Each connection
    /// runs on `tracker` so the caller can wait for them to finish.
    pub async fn run(self, shutdown: CancellationToken, tracker: TaskTracker) {
        if let Ok(addr) = self.local_addr() {
            info!("Terminal channels listening on ws://{}{}", addr, self.context.settings.path);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&self.context);
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            handle_connection(stream, peer, context, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        debug!("Channel listener stopped");
    }
}

/// Upgrades one TCP connection and serves it as a terminal channel.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ChannelContext>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    let path = context.settings.path.clone();
    let check_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, "WebSocket upgrade refused: {}", e);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    serve_channel(&mut sink, &mut stream, peer, &context, &shutdown).await;
    let _ = sink.close().await;
}

/// Frames read ahead of the one being applied. Past this the socket is left
/// unread until the shell catches up.
const INPUT_BACKLOG_LIMIT: usize = 64;

/// An inbound data frame waiting to be applied.
enum Inbound {
    Text(InboundFrame),
    Binary(Vec<u8>),
}

impl Inbound {
    fn apply(self, dispatcher: &Dispatcher) -> BoxFuture<'_, Result<Dispatch, SessionError>> {
        match self {
            Inbound::Text(frame) => dispatcher.dispatch(frame).boxed(),
            Inbound::Binary(data) => dispatcher.dispatch_binary(data).boxed(),
        }
    }
}

/// Peer-facing text for a session that could not be started.
///
/// Web clients stop reconnecting on `ALLOW_ALL_COMMANDS` and `not available`.
fn session_error_message(error: &SessionError) -> &'static str {
    match error {
        SessionError::PolicyDenied => "Interactive terminal requires ALLOW_ALL_COMMANDS",
        _ => "Terminal not available",
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), WsError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    match message.to_json() {
        Ok(text) => sink.send(WsMessage::Text(text)).await,
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            Ok(())
        }
    }
}

/// Runs the channel protocol over an already-upgraded connection.
pub async fn serve_channel<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    peer: SocketAddr,
    context: &ChannelContext,
    shutdown: &CancellationToken,
) where
    Si: Sink<WsMessage, Error = WsError> + Unpin,
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut state = ChannelState::default();

    let authenticated = tokio::select! {
        result = authenticate(stream, &context.authenticator, context.settings.auth_timeout) => {
            result.and_then(|principal| state.admit(principal))
        }
        _ = shutdown.cancelled() => return,
    };
    let principal = match authenticated {
        Ok(principal) => principal,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Channel authentication failed");
            if e.peer_reachable() {
                let _ = send(sink, &ServerMessage::error(e.peer_message())).await;
            }
            return;
        }
    };

    info!(peer = %peer, principal = %principal, "Channel authenticated");
    if send(sink, &ServerMessage::AuthOk { principal }).await.is_err() {
        return;
    }

    let profile = context.profiles.profile_for(principal);
    let mut handle = match context.sessions.create(principal, &profile).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(peer = %peer, principal = %principal, error = %e, "Failed to start session");
            let _ = send(sink, &ServerMessage::error(session_error_message(&e))).await;
            return;
        }
    };
    emit(context, OrchestratorEvent::ChannelOpened { principal, peer });

    let dispatcher = Dispatcher::new(Arc::clone(&handle.session), context.settings.raw_input_fallback);

    // Frames are applied one at a time in arrival order. While a write waits
    // on the shell, output keeps flowing so the shell can make progress.
    let mut backlog: VecDeque<Inbound> = VecDeque::new();
    let mut in_flight: Option<BoxFuture<'_, Result<Dispatch, SessionError>>> = None;

    let reason = loop {
        if in_flight.is_none() {
            if let Some(next) = backlog.pop_front() {
                in_flight = Some(next.apply(&dispatcher));
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break "daemon shutting down",
            Some(outcome) = OptionFuture::from(in_flight.as_mut()) => {
                in_flight = None;
                match outcome {
                    Ok(Dispatch::Continue) => {}
                    Ok(Dispatch::Reply(reply)) => {
                        if send(sink, &reply).await.is_err() {
                            break "send failed";
                        }
                    }
                    Ok(Dispatch::Violation(message)) => {
                        warn!(peer = %peer, principal = %principal, "{}", message);
                        let _ = send(sink, &ServerMessage::error(message)).await;
                        break "protocol violation";
                    }
                    Err(e) => {
                        // The reader reports the exit once the session is down.
                        warn!(peer = %peer, principal = %principal, error = %e, "Session I/O failed");
                        context.sessions.close_session(&handle.session).await;
                    }
                }
            }
            frame = stream.next(), if backlog.len() < INPUT_BACKLOG_LIMIT => match frame {
                Some(Ok(WsMessage::Text(text))) => backlog.push_back(Inbound::Text(InboundFrame::parse(&text))),
                Some(Ok(WsMessage::Binary(data))) => backlog.push_back(Inbound::Binary(data)),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => break "peer closed",
                Some(Err(e)) => {
                    debug!(peer = %peer, "Channel read failed: {}", e);
                    break "transport error";
                }
            },
            event = handle.events.recv() => {
                let message = ServerMessage::from(event.unwrap_or(ReaderEvent::Exit));
                if send(sink, &message).await.is_err() {
                    break "send failed";
                }
                if message.is_terminal() {
                    break "session ended";
                }
            }
        }
    };
    drop(in_flight);

    context.sessions.close_session(&handle.session).await;
    info!(peer = %peer, principal = %principal, reason, "Channel closed");
    emit(
        context,
        OrchestratorEvent::ChannelClosed {
            principal,
            peer,
            reason: reason.to_string(),
        },
    );
}

fn emit(context: &ChannelContext, event: OrchestratorEvent) {
    let _ = context.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use std::convert::Infallible;
    use protocol::crypto::unix_now;
    use protocol::{InitDataValidator, Principal};

    const TOKEN: &str = "5:channel-test";

    fn context(allow_shell: bool) -> ChannelContext {
        let (events, _) = broadcast::channel(16);
        ChannelContext {
            authenticator: Arc::new(Authenticator::new(
                Some(InitDataValidator::new(TOKEN).unwrap()),
                [Principal(1)],
            )),
            sessions: Arc::new(SessionManager::new(SessionSettings {
                allow_unrestricted_shell: allow_shell,
                ..SessionSettings::default()
            })),
            profiles: Arc::new(ProfileStore::new(None)),
            settings: ChannelSettings {
                auth_timeout: Duration::from_millis(200),
                ..ChannelSettings::default()
            },
            events,
        }
    }

    fn auth_text(user_id: i64) -> WsMessage {
        let init_data = InitDataValidator::new(TOKEN)
            .unwrap()
            .sign_for_user(user_id, unix_now());
        WsMessage::Text(protocol::ClientMessage::Auth { init_data }.to_json().unwrap())
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn input_text(data: &str) -> WsMessage {
        WsMessage::Text(
            protocol::ClientMessage::Input { data: data.to_string() }
                .to_json()
                .unwrap(),
        )
    }

    fn decode_sent(sent: Vec<WsMessage>) -> Vec<ServerMessage> {
        sent.into_iter()
            .filter_map(|msg| match msg {
                WsMessage::Text(text) => ServerMessage::from_json(&text).ok(),
                _ => None,
            })
            .collect()
    }

    /// Serves a channel over in-memory streams and returns every message
    /// the broker sent. The peer closes after its last frame.
    async fn exchange(context: &ChannelContext, frames: Vec<WsMessage>) -> Vec<ServerMessage> {
        let mut sent: Vec<WsMessage> = Vec::new();
        let mut sink = (&mut sent).sink_map_err(|never: Infallible| -> WsError { match never {} });
        let mut stream = futures_util::stream::iter(frames.into_iter().map(Ok));
        serve_channel(&mut sink, &mut stream, peer(), context, &CancellationToken::new()).await;
        drop(sink);
        decode_sent(sent)
    }

    /// Like [`exchange`], but the peer stays connected after its last frame.
    async fn exchange_open(context: &ChannelContext, frames: Vec<WsMessage>) -> Vec<ServerMessage> {
        let mut sent: Vec<WsMessage> = Vec::new();
        let mut sink = (&mut sent).sink_map_err(|never: Infallible| -> WsError { match never {} });
        let mut stream = futures_util::stream::iter(frames.into_iter().map(Ok))
            .chain(futures_util::stream::pending());
        serve_channel(&mut sink, &mut stream, peer(), context, &CancellationToken::new()).await;
        drop(sink);
        decode_sent(sent)
    }

    #[tokio::test]
    async fn test_invalid_credential_sends_error_only() {
        let context = context(true);
        let frame = WsMessage::Text(r#"{"type":"auth","init_data":"bogus"}"#.into());
        let sent = exchange(&context, vec![frame]).await;
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ServerMessage::Error { message } if message.starts_with("Authentication failed")));
        assert_eq!(context.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_policy_denied_after_auth_ok() {
        let context = context(false);
        let sent = exchange(&context, vec![auth_text(1)]).await;
        assert_eq!(sent[0], ServerMessage::AuthOk { principal: Principal(1) });
        assert_eq!(
            sent[1],
            ServerMessage::error("Interactive terminal requires ALLOW_ALL_COMMANDS")
        );
        assert_eq!(sent.len(), 2);
        assert_eq!(context.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_session() {
        let context = context(true);
        let mut events = context.events.subscribe();
        let sent = exchange(&context, vec![auth_text(1)]).await;

        assert_eq!(sent[0], ServerMessage::AuthOk { principal: Principal(1) });
        assert_eq!(context.sessions.count(), 0);
        assert!(matches!(events.try_recv(), Ok(OrchestratorEvent::ChannelOpened { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(OrchestratorEvent::ChannelClosed { reason, .. }) if reason == "peer closed"
        ));
    }

    #[tokio::test]
    async fn test_second_auth_is_violation() {
        let context = context(true);
        let sent = exchange_open(&context, vec![auth_text(1), auth_text(1)]).await;
        assert_eq!(sent[0], ServerMessage::AuthOk { principal: Principal(1) });
        assert!(sent.contains(&ServerMessage::error("Protocol violation: already authenticated")));
        assert_eq!(context.sessions.count(), 0);
    }

    #[test]
    fn test_start_failures_use_permanent_markers() {
        assert!(session_error_message(&SessionError::PolicyDenied).contains("ALLOW_ALL_COMMANDS"));
        for error in [
            SessionError::SpawnFailed("fork".into()),
            SessionError::AllocationFailed("openpt".into()),
        ] {
            assert!(session_error_message(&error).contains("not available"));
        }
    }

    #[tokio::test]
    async fn test_large_paste_keeps_session_alive() {
        let context = context(true);
        let shutdown = CancellationToken::new();

        // Far more than the terminal's input queue and the output queue hold.
        let paste = format!("{}\n", "x".repeat(79)).repeat(40_000);
        let frames = vec![
            auth_text(1),
            input_text("exec cat\n"),
            input_text(&paste),
            input_text("paste-finished\n"),
        ];
        let mut stream = futures_util::stream::iter(frames.into_iter().map(Ok))
            .chain(futures_util::stream::pending());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = Box::pin(futures_util::sink::unfold(tx, |tx, msg: WsMessage| async move {
            let _ = tx.send(msg);
            Ok::<_, WsError>(tx)
        }));

        let watch = async {
            let mut tail = String::new();
            let mut exited = false;
            while let Some(msg) = rx.recv().await {
                let WsMessage::Text(text) = msg else { continue };
                match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::Output { data }) => {
                        tail.push_str(&data);
                        if tail.contains("paste-finished") {
                            break;
                        }
                        if tail.len() > 4096 {
                            let keep: Vec<char> = tail.chars().rev().take(64).collect();
                            tail = keep.into_iter().rev().collect();
                        }
                    }
                    Ok(ServerMessage::Exit) => {
                        exited = true;
                        break;
                    }
                    _ => {}
                }
            }
            let alive = context.sessions.count() == 1;
            shutdown.cancel();
            (exited, alive)
        };
        let serve = serve_channel(&mut sink, &mut stream, peer(), &context, &shutdown);

        let ((exited, alive), ()) =
            tokio::time::timeout(Duration::from_secs(25), async { tokio::join!(watch, serve) })
                .await
                .expect("paste did not drain");
        assert!(!exited);
        assert!(alive);
        assert_eq!(context.sessions.count(), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.network.path = "/term".into();
        config.network.auth_timeout_secs = 9;
        config.session.raw_input_fallback = false;
        let settings = ChannelSettings::from(&config);
        assert_eq!(settings.path, "/term");
        assert_eq!(settings.auth_timeout, Duration::from_secs(9));
        assert!(!settings.raw_input_fallback);
    }
}
