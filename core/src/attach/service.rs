use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use kube::api::{Api, ListParams};
use tokio::sync::Mutex;
use uuid::Uuid;

use kocao_common::labels;
use kocao_types::{HarnessRun, HarnessRunPhase};

use crate::audit::{AuditEvent, AuditStore};
use crate::auth::TokenStore;
use crate::Error;

use super::backend;
use super::session::{decide_seat, new_client_channel, AttachSession, ClientHandle, SeatOutcome};
use super::types::{
    normalize_attach_role, AttachRole, Frame, ATTACH_TOKEN_TTL, CLAIM_CLIENT_ID, CLAIM_ROLE,
    CLAIM_SESSION_ID,
};

pub struct AttachService {
    namespace: String,
    client: kube::Client,
    tokens: Arc<TokenStore>,
    audit: Arc<AuditStore>,
    sessions: Mutex<HashMap<String, Arc<AttachSession>>>,
}

impl AttachService {
    pub fn new(namespace: String, client: kube::Client, tokens: Arc<TokenStore>, audit: Arc<AuditStore>) -> Self {
        Self {
            namespace,
            client,
            tokens,
            audit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue_token(
        &self,
        principal_id: &str,
        session_id: &str,
        role: AttachRole,
        client_id: Option<String>,
    ) -> (String, chrono::DateTime<Utc>, String) {
        let client_id = client_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let raw = format!("{}{}", Uuid::new_v4(), Uuid::new_v4());
        let expires_at = Utc::now() + ATTACH_TOKEN_TTL;
        let mut claims = BTreeMap::new();
        claims.insert(CLAIM_SESSION_ID.to_string(), session_id.to_string());
        claims.insert(CLAIM_CLIENT_ID.to_string(), client_id.clone());
        claims.insert(CLAIM_ROLE.to_string(), role.as_str().to_string());
        let _ = self.tokens.create(
            &format!("attach-{principal_id}"),
            &raw,
            std::collections::HashSet::from(["attach:connect".to_string()]),
            Some(expires_at),
            claims,
        );
        (raw, expires_at, client_id)
    }

    pub fn claims_from_token(&self, raw: &str) -> Result<(String, String, AttachRole), Error> {
        let principal = self
            .tokens
            .lookup(raw)
            .ok_or_else(|| Error::UserInput("invalid attach token".to_string()))?;
        let session_id = principal
            .claims
            .get(CLAIM_SESSION_ID)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let client_id = principal
            .claims
            .get(CLAIM_CLIENT_ID)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let role = principal
            .claims
            .get(CLAIM_ROLE)
            .and_then(|r| normalize_attach_role(r));
        match (session_id, client_id, role) {
            (Some(session_id), Some(client_id), Some(role)) => Ok((session_id, client_id, role)),
            _ => Err(Error::UserInput("invalid attach token claims".to_string())),
        }
    }

    async fn find_attach_pod(&self, session_id: &str) -> Result<String, Error> {
        let api: Api<HarnessRun> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{}={session_id}", labels::SESSION_NAME));
        let runs = api.list(&lp).await.map_err(Error::from)?;
        let mut starting_pod = None;
        for run in &runs.items {
            let Some(status) = &run.status else { continue };
            let Some(pod_name) = status.pod_name.as_ref().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            match status.phase {
                HarnessRunPhase::Running => return Ok(pod_name.clone()),
                HarnessRunPhase::Starting => starting_pod = Some(pod_name.clone()),
                _ => {}
            }
        }
        starting_pod.ok_or_else(|| Error::NotFound("no active run pod".to_string()))
    }

    async fn session_for(&self, session_id: &str) -> Arc<AttachSession> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AttachSession::new()))
            .clone()
    }

    /// Drives one client's connection end to end: joins the session
    /// (claiming or deferring the driver seat), lazily starts the exec
    /// backend, then alternates between reading inbound frames and relaying
    /// outbound ones until the socket closes.
    pub async fn handle_connection(
        self: Arc<Self>,
        session_id: String,
        client_id: String,
        role: AttachRole,
        socket: WebSocket,
    ) {
        let (mut sink, mut stream) = socket.split();
        let session = self.session_for(&session_id).await;
        let (send, mut recv) = new_client_channel();

        let now = Instant::now();
        let needs_backend = {
            let mut inner = session.inner.lock().await;
            let current = inner.current_driver(now).map(|s| s.to_string());
            match decide_seat(current.as_deref(), &client_id, role) {
                SeatOutcome::BecomeDriver => inner.refresh_lease(now, &client_id),
                SeatOutcome::RemainViewer => {}
            }
            inner.clients.insert(
                client_id.clone(),
                ClientHandle {
                    send: send.clone(),
                    max_role: role,
                },
            );
            inner.backend_cancel.is_none()
        };
        if needs_backend
            && let Ok(pod) = self.find_attach_pod(&session_id).await
        {
            self.start_backend(&session, &pod).await;
        }
        let (driver_id, lease_ms) = {
            let mut inner = session.inner.lock().await;
            let driver_id = inner.current_driver(now).map(|s| s.to_string());
            let lease_ms = inner.lease_remaining(now).as_millis() as i64;
            inner.broadcast(Frame::State {
                driver_id: driver_id.clone(),
                lease_ms,
            });
            (driver_id, lease_ms)
        };

        let assigned_role = if driver_id.as_deref() == Some(client_id.as_str()) {
            AttachRole::Driver
        } else {
            AttachRole::Viewer
        };
        let _ = send
            .send(Frame::Hello {
                session_id: session_id.clone(),
                client_id: client_id.clone(),
                role: assigned_role.as_str().to_string(),
                driver_id: driver_id.clone(),
                lease_ms,
            })
            .await;

        let writer = tokio::spawn(async move {
            while let Some(frame) = recv.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else { continue };
            let Ok(frame) = serde_json::from_str::<Frame>(&text) else { continue };
            self.handle_frame(&session, &session_id, &client_id, role, frame, &send)
                .await;
        }

        drop(send);
        let _ = writer.await;
        self.on_disconnect(session_id, session, client_id).await;
    }

    async fn start_backend(&self, session: &Arc<AttachSession>, pod: &str) {
        let session_clone = session.clone();
        let namespace = self.namespace.clone();
        let client = self.client.clone();
        let pod = pod.to_string();
        let stdout_session = session.clone();
        let closed_session = session.clone();
        if let Ok(backend) = backend::start(
            client,
            &namespace,
            &pod,
            move |frame| {
                let session = stdout_session.clone();
                tokio::spawn(async move {
                    session.inner.lock().await.broadcast(frame);
                });
            },
            move || {
                tokio::spawn(async move {
                    let mut inner = closed_session.inner.lock().await;
                    inner.stdin_tx = None;
                    inner.size_tx = None;
                    inner.backend_cancel = None;
                    inner.broadcast(Frame::BackendClosed);
                });
            },
        )
        .await
        {
            let mut inner = session_clone.inner.lock().await;
            inner.stdin_tx = Some(backend.stdin);
            inner.size_tx = backend.size;
            inner.backend_cancel = Some(backend.cancel);
        }
    }

    async fn handle_frame(
        &self,
        session: &Arc<AttachSession>,
        session_id: &str,
        client_id: &str,
        max_role: AttachRole,
        frame: Frame,
        send: &tokio::sync::mpsc::Sender<Frame>,
    ) {
        let now = Instant::now();
        match frame {
            Frame::Keepalive => {
                let mut inner = session.inner.lock().await;
                if inner.current_driver(now) == Some(client_id) {
                    inner.refresh_lease(now, client_id);
                }
                let driver_id = inner.current_driver(now).map(|s| s.to_string());
                let lease_ms = inner.lease_remaining(now).as_millis() as i64;
                let _ = send.send(Frame::State { driver_id, lease_ms }).await;
            }
            Frame::Resize { cols, rows } => {
                let inner = session.inner.lock().await;
                if inner.current_driver(now) == Some(client_id)
                    && let Some(size_tx) = &inner.size_tx
                {
                    let _ = size_tx.try_send((cols, rows));
                }
            }
            Frame::TakeControl => {
                if max_role != AttachRole::Driver {
                    let _ = send
                        .send(Frame::Error {
                            message: "insufficient role".to_string(),
                        })
                        .await;
                    return;
                }
                let mut inner = session.inner.lock().await;
                let current = inner.current_driver(now).map(|s| s.to_string());
                if let SeatOutcome::BecomeDriver = decide_seat(current.as_deref(), client_id, AttachRole::Driver) {
                    inner.refresh_lease(now, client_id);
                }
                let driver_id = inner.current_driver(now).map(|s| s.to_string());
                let lease_ms = inner.lease_remaining(now).as_millis() as i64;
                inner.broadcast(Frame::State { driver_id, lease_ms });
            }
            Frame::Stdin { data } => {
                let Ok(payload) = base64::engine::general_purpose::STANDARD.decode(&data) else {
                    let _ = send
                        .send(Frame::Error {
                            message: "invalid stdin payload".to_string(),
                        })
                        .await;
                    return;
                };
                let mut inner = session.inner.lock().await;
                let is_driver = inner.current_driver(now) == Some(client_id);
                if is_driver {
                    inner.refresh_lease(now, client_id);
                }
                let driver_id = inner.driver_client_id.clone();
                let lease_ms = inner.lease_remaining(now).as_millis() as i64;
                inner.broadcast(Frame::State { driver_id, lease_ms });
                if !is_driver {
                    drop(inner);
                    let _ = send
                        .send(Frame::Error {
                            message: "read-only".to_string(),
                        })
                        .await;
                    return;
                }
                let stdin_tx = inner.stdin_tx.clone();
                drop(inner);
                let stdin_tx = match stdin_tx {
                    Some(tx) => Some(tx),
                    None => {
                        let pod = self.find_attach_pod(session_id).await.ok();
                        if let Some(pod) = pod {
                            self.start_backend(session, &pod).await;
                            session.inner.lock().await.stdin_tx.clone()
                        } else {
                            None
                        }
                    }
                };
                match stdin_tx {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => {
                        let _ = send
                            .send(Frame::Error {
                                message: "no active run pod".to_string(),
                            })
                            .await;
                    }
                }
            }
            _ => {
                let _ = send
                    .send(Frame::Error {
                        message: "unknown message type".to_string(),
                    })
                    .await;
            }
        }
    }

    /// Removes the client and, if it was the last one in the session,
    /// schedules a delayed re-check that tears down the exec backend and
    /// drops the session entry only if nobody has reclaimed it meanwhile.
    async fn on_disconnect(self: Arc<Self>, session_id: String, session: Arc<AttachSession>, client_id: String) {
        let cleanup_delay = {
            let mut inner = session.inner.lock().await;
            inner.clients.remove(&client_id);
            if !inner.clients.is_empty() {
                return;
            }
            let remaining = inner.lease_remaining(Instant::now());
            super::session::cleanup_delay(remaining)
        };

        tokio::spawn(async move {
            tokio::time::sleep(cleanup_delay).await;
            let should_remove = {
                let mut inner = session.inner.lock().await;
                let still_empty = inner.clients.is_empty();
                let lease_expired = inner.current_driver(Instant::now()).is_none();
                let should = still_empty && lease_expired;
                if should && let Some(cancel) = inner.backend_cancel.take() {
                    cancel.cancel();
                }
                should
            };
            if should_remove {
                self.sessions.lock().await.remove(&session_id);
            }
        });
    }

    pub fn audit_event(&self, event: AuditEvent) {
        self.audit.append(event);
    }
}
