//! Tunnel client
//!
//! Dials the relay, authenticates, and serves relay-opened streams until the
//! session ends, then reconnects with exponential backoff. The backoff
//! resets once a session has been established.
//!
//! ```text
//! Disconnected ──► Connecting ──► Authenticated ──► Streaming
//!      ▲               │                                │
//!      └─── backoff ◄──┴────────── session ends ◄───────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use kuberde_common::retry::{Backoff, RetryConfig};
use kuberde_mux::{Incoming, MuxSession, Role, SessionConfig};
use parking_lot::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::services::ServiceTable;
use crate::streams::{accept_loop, DialPolicy};
use crate::token::{ActiveSession, Credentials};

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No session and not dialing
    Disconnected,
    /// Dialing the relay
    Connecting,
    /// The relay accepted the upgrade
    Authenticated,
    /// Serving streams
    Streaming,
}

/// Tunnel client settings
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Tunnel handshake timeout
    pub connect_timeout: Duration,
    /// Reconnect backoff
    pub reconnect: RetryConfig,
    /// Session tuning
    pub session: SessionConfig,
    /// Local dialing
    pub dial: DialPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryConfig::for_reconnect(),
            session: SessionConfig::default(),
            dial: DialPolicy::default(),
        }
    }
}

/// Agent tunnel client
pub struct AgentClient {
    config: AgentConfig,
    settings: ClientSettings,
    services: Arc<ServiceTable>,
    credentials: Arc<Credentials>,
    state: Arc<RwLock<ClientState>>,
    active: ActiveSession,
}

impl AgentClient {
    /// Create a client; nothing is dialed until [`Self::run`]
    pub fn new(config: AgentConfig, credentials: Arc<Credentials>, settings: ClientSettings) -> Self {
        Self {
            services: Arc::new(config.services.clone()),
            config,
            settings,
            credentials,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Slot the credential refresher pushes renewed tokens into
    pub fn active_session(&self) -> ActiveSession {
        self.active.clone()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.write() = state;
    }

    /// Dial the relay once and start the multiplexed session
    pub async fn connect(&self) -> Result<(MuxSession, Incoming)> {
        let url = self.config.tunnel_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::config(format!("invalid tunnel request: {e}")))?;
        if let Some(token) = self.credentials.bearer().await? {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AgentError::config(format!("token is not a valid header: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let handshake = tokio::time::timeout(
            self.settings.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| AgentError::Connect(format!("timed out after {:?}", self.settings.connect_timeout)))?;
        let (ws, _) = handshake.map_err(|e| match e {
            WsError::Http(response) => AgentError::Rejected(response.status().as_u16()),
            other => AgentError::Connect(other.to_string()),
        })?;

        let (sink, stream) = ws.split();
        let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, WsError>(Message::Binary(frame))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(frame)) => Some(Ok(frame)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
        Ok(MuxSession::spawn(
            sink,
            stream,
            Role::Client,
            self.settings.session.clone(),
        ))
    }

    /// Serve one session until it ends or `shutdown` fires
    async fn serve(&self, session: MuxSession, incoming: Incoming, shutdown: &CancellationToken) {
        *self.active.lock() = Some(session.clone());
        self.set_state(ClientState::Streaming);

        let accept = tokio::spawn(accept_loop(
            incoming,
            self.services.clone(),
            self.settings.dial.clone(),
            session.cancellation_token(),
        ));
        tokio::select! {
            _ = session.closed() => info!("Tunnel session ended"),
            _ = shutdown.cancelled() => session.close(),
        }
        let _ = accept.await;
        *self.active.lock() = None;
    }

    /// Keep a session up until `shutdown`
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.settings.reconnect.clone());
        while !shutdown.is_cancelled() {
            self.set_state(ClientState::Connecting);
            debug!(agent = %self.config.agent_id, url = %self.config.server_url, "Dialing relay");

            let reason = match self.connect().await {
                Ok((session, incoming)) => {
                    self.set_state(ClientState::Authenticated);
                    info!(agent = %self.config.agent_id, session = session.id(), "Tunnel established");
                    backoff.reset();
                    self.serve(session, incoming, &shutdown).await;
                    self.set_state(ClientState::Disconnected);
                    if shutdown.is_cancelled() {
                        break;
                    }
                    "session ended".to_string()
                }
                Err(e) => {
                    self.set_state(ClientState::Disconnected);
                    if e.is_credential_rejected() {
                        self.credentials.invalidate();
                    }
                    if matches!(e, AgentError::Config(_) | AgentError::Auth(_)) {
                        return Err(e);
                    }
                    e.to_string()
                }
            };

            let delay = backoff.next_delay();
            warn!(
                agent = %self.config.agent_id,
                reason = %reason,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis(),
                "Tunnel down, reconnecting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ClientState::Disconnected);
        info!("Tunnel client stopped");
        Ok(())
    }
}
