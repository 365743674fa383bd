//! C4 — Realtime Channel: client/session projections, timer broadcast, and
//! primary/viewer role arbitration. One `broadcast::Sender` per session;
//! the wire transport (WebSocket upgrade and message loop) lives in the
//! gateway crate and only drives this bookkeeping.

use crate::session::SessionManager;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TIMER_INTERVAL: Duration = Duration::from_secs(1);
const ABANDONMENT_GRACE: Duration = Duration::from_secs(35);
const WARNING_THRESHOLD_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename = "session:joined")]
    Joined { port: u16, time_remaining: u64, is_primary: bool, is_viewer: bool, viewer_count: usize },
    #[serde(rename = "session:timer")]
    Timer { time_remaining: u64 },
    #[serde(rename = "session:warning")]
    Warning { seconds_left: u64 },
    #[serde(rename = "session:ended")]
    Ended { reason: String },
    #[serde(rename = "session:error")]
    Error { error: String },
    #[serde(rename = "session:takeover")]
    Takeover,
    #[serde(rename = "session:viewer-count")]
    ViewerCount { count: usize },
}

struct SessionChannel {
    tx: broadcast::Sender<(Option<String>, SessionEvent)>,
    clients: HashSet<String>,
    viewers: HashSet<String>,
    primary: Option<String>,
    warned: bool,
    abandon_timer: Option<JoinHandle<()>>,
}

impl SessionChannel {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            tx,
            clients: HashSet::new(),
            viewers: HashSet::new(),
            primary: None,
            warned: false,
            abandon_timer: None,
        }
    }
}

pub struct JoinResult {
    pub event: SessionEvent,
    pub receiver: broadcast::Receiver<(Option<String>, SessionEvent)>,
}

/// Client/session projections for the realtime channel. Held under a
/// single mutex per the concurrency model; broadcasts take a snapshot
/// under the lock and emit without holding it.
pub struct RealtimeChannel {
    sessions: Arc<SessionManager>,
    channels: Mutex<HashMap<String, SessionChannel>>,
}

impl RealtimeChannel {
    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self { sessions, channels: Mutex::new(HashMap::new()) })
    }

    /// `session:join`. `viewer=true` adds a non-controlling viewer;
    /// otherwise the client becomes (or remains) primary, demoting any
    /// prior primary with a `session:takeover` first.
    pub async fn join(self: &Arc<Self>, session_id: &str, client_id: &str, viewer: bool) -> Option<JoinResult> {
        let snapshot = self.sessions.get_session(session_id).await?;
        if snapshot.status != crate::session::SessionStatus::Active {
            return None;
        }

        let mut channels = self.channels.lock().await;
        let channel = channels.entry(session_id.to_string()).or_insert_with(SessionChannel::new);

        if let Some(handle) = channel.abandon_timer.take() {
            handle.abort();
        }

        channel.clients.insert(client_id.to_string());

        let event = if viewer {
            channel.viewers.insert(client_id.to_string());
            if let Some(primary) = &channel.primary {
                let _ = channel
                    .tx
                    .send((Some(primary.clone()), SessionEvent::ViewerCount { count: channel.viewers.len() }));
            }
            SessionEvent::Joined {
                port: snapshot.port,
                time_remaining: snapshot.time_remaining,
                is_primary: false,
                is_viewer: true,
                viewer_count: channel.viewers.len(),
            }
        } else {
            if let Some(prior) = channel.primary.clone() {
                if prior != client_id {
                    let _ = channel.tx.send((Some(prior), SessionEvent::Takeover));
                }
            }
            channel.primary = Some(client_id.to_string());
            SessionEvent::Joined {
                port: snapshot.port,
                time_remaining: snapshot.time_remaining,
                is_primary: true,
                is_viewer: false,
                viewer_count: channel.viewers.len(),
            }
        };

        let receiver = channel.tx.subscribe();
        Some(JoinResult { event, receiver })
    }

    /// Called when a client's connection closes. If it was the last client
    /// bound to a session, starts the abandonment grace timer.
    pub async fn leave(self: &Arc<Self>, session_id: &str, client_id: &str, end_session_on_abandon: bool) {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(session_id) else { return };

        channel.clients.remove(client_id);
        channel.viewers.remove(client_id);
        if channel.primary.as_deref() == Some(client_id) {
            channel.primary = None;
        }

        if channel.clients.is_empty() {
            let session_id = session_id.to_string();
            let sessions = self.sessions.clone();
            let this = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(ABANDONMENT_GRACE).await;
                let still_empty = {
                    let channels = this.channels.lock().await;
                    channels.get(&session_id).map(|c| c.clients.is_empty()).unwrap_or(true)
                };
                if still_empty && end_session_on_abandon {
                    info!("session {session_id} abandoned, ending it");
                    sessions.end_session(&session_id, "abandoned").await;
                }
            });
            channel.abandon_timer = Some(handle);
        }
    }

    /// `notifySessionEnded`: broadcasts `session:ended{reason}` to every
    /// bound client (admin kill, user end) and drops the session's
    /// projections.
    pub async fn notify_session_ended(&self, session_id: &str, reason: &str) {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.remove(session_id) {
            if let Some(handle) = channel.abandon_timer {
                handle.abort();
            }
            let _ = channel.tx.send((None, SessionEvent::Ended { reason: reason.to_string() }));
        }
    }

    pub async fn viewer_count(&self, session_id: &str) -> usize {
        self.channels.lock().await.get(session_id).map(|c| c.viewers.len()).unwrap_or(0)
    }

    /// Every 1s: emits `session:timer` (and once-only `session:warning` at
    /// 30s) for active sessions, or `session:ended{reason:"expired"}` and
    /// drops the channel for sessions C2 no longer reports as active.
    pub async fn run_timer_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TIMER_INTERVAL);
        loop {
            interval.tick().await;

            let session_ids: Vec<String> = self.channels.lock().await.keys().cloned().collect();
            for id in session_ids {
                let snapshot = self.sessions.get_session(&id).await;
                let ended = match &snapshot {
                    None => true,
                    Some(s) => s.status != crate::session::SessionStatus::Active,
                };

                if ended {
                    let mut channels = self.channels.lock().await;
                    if let Some(channel) = channels.remove(&id) {
                        if let Some(handle) = channel.abandon_timer {
                            handle.abort();
                        }
                        let _ = channel
                            .tx
                            .send((None, SessionEvent::Ended { reason: "expired".to_string() }));
                    }
                    continue;
                }

                let remaining = snapshot.unwrap().time_remaining;
                let mut channels = self.channels.lock().await;
                if let Some(channel) = channels.get_mut(&id) {
                    let _ = channel.tx.send((None, SessionEvent::Timer { time_remaining: remaining }));
                    if remaining == WARNING_THRESHOLD_SECS && !channel.warned {
                        channel.warned = true;
                        let _ = channel
                            .tx
                            .send((None, SessionEvent::Warning { seconds_left: WARNING_THRESHOLD_SECS }));
                    }
                }
            }
            debug!("realtime timer tick complete");
        }
    }

    /// Sessions currently past their grace-timer start but not yet ended —
    /// used by C5 to report a derived `reconnecting` container status.
    pub async fn reconnecting_session_ids(&self) -> HashSet<String> {
        let channels = self.channels.lock().await;
        channels
            .iter()
            .filter(|(_, c)| c.clients.is_empty() && c.abandon_timer.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_event_serializes_with_tag() {
        let event = SessionEvent::Joined {
            port: 4000,
            time_remaining: 300,
            is_primary: true,
            is_viewer: false,
            viewer_count: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"session:joined\""));
    }

    #[test]
    fn warning_serializes_camel_case_field() {
        let event = SessionEvent::Warning { seconds_left: 30 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"secondsLeft\":30"));
    }
}
