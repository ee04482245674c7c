//! Agent tunnel endpoint
//!
//! Agents dial `GET /ws?id={identity}` with a bearer credential and upgrade
//! to WebSocket. Every binary message afterwards is one mux frame. The relay
//! is the stream-opening side; streams the agent tries to open are reset.

use std::future::ready;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use kuberde_auth::extract::query_param;
use kuberde_auth::{authorize_session, extract_token, Authenticator, Principal};
use kuberde_common::AgentIdentity;
use kuberde_mux::{Incoming, MuxSession, Role, SessionEvent};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::registry::SessionRegistry;
use crate::server::AppState;

/// `GET /ws?id={identity}`
pub async fn tunnel_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let raw_id = uri
        .query()
        .and_then(|q| query_param(q, "id"))
        .ok_or_else(|| RelayError::bad_request("missing id query parameter"))?;
    let identity = AgentIdentity::parse(&raw_id)
        .map_err(|e| RelayError::bad_request(e.to_string()))?;

    let found = extract_token(
        headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
        uri.query(),
        headers.get(COOKIE).and_then(|v| v.to_str().ok()),
    );
    let principal = match state.auth.authenticate(found).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!(agent = %identity, error = %e, "Tunnel credential rejected");
            return Err(e.into());
        }
    };
    if let Err(e) = authorize_session(&principal, &identity) {
        warn!(agent = %identity, subject = %principal.username, "Tunnel not permitted for identity");
        return Err(e.into());
    }

    Ok(ws.on_upgrade(move |socket| async move {
        let (session, incoming) = spawn_session(socket, &state);
        supervise(
            state.dataplane.registry.clone(),
            state.auth.clone(),
            identity,
            principal,
            session,
            incoming,
        )
        .await;
    }))
}

fn spawn_session(socket: WebSocket, state: &AppState) -> (MuxSession, Incoming) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| ready(Ok::<_, axum::Error>(Message::Binary(frame))));
    let stream = stream.filter_map(|message| {
        ready(match message {
            Ok(Message::Binary(frame)) => Some(Ok(frame)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });
    MuxSession::spawn(sink, stream, Role::Server, state.session_config.clone())
}

fn until(expiry: DateTime<Utc>) -> Duration {
    (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Own an admitted session until it ends
///
/// Registers the session, accepts refreshed credentials, and closes the
/// session when its credential lapses. The registry entry is released on
/// exit unless a newer session has already replaced it.
pub async fn supervise(
    registry: std::sync::Arc<SessionRegistry>,
    auth: Authenticator,
    identity: AgentIdentity,
    principal: Principal,
    session: MuxSession,
    mut incoming: Incoming,
) {
    let mut expiry = principal.expires_at;
    registry.admit(&identity, session.clone(), Some(expiry));
    info!(
        agent = %identity,
        subject = %principal.username,
        session = session.id(),
        "Agent session established"
    );

    loop {
        tokio::select! {
            _ = session.closed() => break,
            _ = tokio::time::sleep(until(expiry)) => {
                warn!(agent = %identity, "Agent credential expired without refresh");
                break;
            }
            event = incoming.next() => match event {
                None => break,
                Some(SessionEvent::Credential(token)) => {
                    let refreshed = auth
                        .verify(&token)
                        .await
                        .and_then(|p| authorize_session(&p, &identity).map(|()| p));
                    match refreshed {
                        Ok(p) => {
                            expiry = p.expires_at;
                            registry.refresh_credential(&identity, session.id(), expiry);
                            debug!(agent = %identity, %expiry, "Agent credential refreshed");
                        }
                        Err(e) => {
                            warn!(agent = %identity, error = %e, "Refreshed credential rejected");
                            break;
                        }
                    }
                }
                Some(SessionEvent::Stream(stream)) => {
                    debug!(agent = %identity, stream = stream.id(), "Rejecting agent-opened stream");
                    stream.reset();
                }
            }
        }
    }

    session.close();
    registry.remove(&identity, session.id());
}
