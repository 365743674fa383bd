//! C3 — Admission Queue: FIFO with per-IP coalescing, walked to readiness
//! by a background worker that serializes against C1's warm capacity.
//! The worker wakes on a fixed interval or an immediate signal from
//! `enqueue`, via a `tokio::sync::Notify`.

use crate::session::{CreateSessionOutcome, SessionManager};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

const WORKER_INTERVAL: Duration = Duration::from_millis(500);
const PREPARING_DELAY: Duration = Duration::from_millis(500);
const NOMINAL_PARALLELISM: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Preparing,
    Connecting,
    Ready,
    RateLimited,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    url: String,
    raw_ip: String,
    status: QueueStatus,
    session_id: Option<String>,
    port: Option<u16>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntrySnapshot {
    pub id: String,
    pub position: usize,
    pub status: QueueStatus,
    pub session_id: Option<String>,
    pub port: Option<u16>,
    pub total_in_queue: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Notification delivered to a queue subscriber. A defensive copy — the
/// subscriber cannot mutate queue state through it.
#[derive(Debug, Clone)]
pub struct QueueNotification {
    pub entry_id: String,
    pub status: QueueStatus,
    pub session_id: Option<String>,
    pub port: Option<u16>,
}

struct QueueState {
    waiting: VecDeque<String>,
    entries: HashMap<String, Entry>,
    ip_index: HashMap<String, String>,
    callbacks: HashMap<String, mpsc::UnboundedSender<QueueNotification>>,
}

pub struct AdmissionQueue {
    pool: Arc<crate::pool::ContainerPool>,
    sessions: Arc<SessionManager>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new(pool: Arc<crate::pool::ContainerPool>, sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions,
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                entries: HashMap::new(),
                ip_index: HashMap::new(),
                callbacks: HashMap::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// Coalesces on `raw_ip`: a second submission from the same IP while
    /// one is still `waiting` updates its URL in place instead of creating
    /// a new entry.
    pub async fn enqueue(&self, url: &str, raw_ip: &str) -> QueueEntrySnapshot {
        let mut state = self.state.lock().await;

        if let Some(existing_id) = state.ip_index.get(raw_ip).cloned() {
            if let Some(entry) = state.entries.get_mut(&existing_id) {
                if entry.status == QueueStatus::Waiting {
                    entry.url = url.to_string();
                    let snapshot = Self::snapshot_locked(&state, &existing_id);
                    drop(state);
                    self.notify.notify_one();
                    return snapshot;
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        state.entries.insert(
            id.clone(),
            Entry {
                id: id.clone(),
                url: url.to_string(),
                raw_ip: raw_ip.to_string(),
                status: QueueStatus::Waiting,
                session_id: None,
                port: None,
                created_at: chrono::Utc::now(),
            },
        );
        state.waiting.push_back(id.clone());
        state.ip_index.insert(raw_ip.to_string(), id.clone());

        let snapshot = Self::snapshot_locked(&state, &id);
        drop(state);
        self.notify.notify_one();
        snapshot
    }

    pub async fn get(&self, id: &str) -> Option<QueueEntrySnapshot> {
        let state = self.state.lock().await;
        if state.entries.contains_key(id) {
            Some(Self::snapshot_locked(&state, id))
        } else {
            None
        }
    }

    /// Like `get`, but also fills in the (separately computed)
    /// `estimatedWaitSeconds` for an HTTP response.
    pub async fn get_with_wait(&self, id: &str) -> Option<(QueueEntrySnapshot, u64)> {
        let snapshot = self.get(id).await?;
        let wait = self.estimated_wait_seconds().await;
        Some((snapshot, wait))
    }

    /// Removes a waiting entry and its subscription, reindexing positions.
    pub async fn leave(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(id) {
            state.waiting.retain(|e| e != id);
            state.ip_index.remove(&entry.raw_ip);
            state.callbacks.remove(id);
        }
    }

    pub async fn subscribe(&self, id: &str) -> Option<mpsc::UnboundedReceiver<QueueNotification>> {
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(id) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.callbacks.insert(id.to_string(), tx);
        Some(rx)
    }

    pub async fn length(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// All tracked entries (any status), for the admin queue list. Newest
    /// waiting position first.
    pub async fn list_entries(&self) -> Vec<QueueEntrySnapshot> {
        let state = self.state.lock().await;
        state.entries.keys().map(|id| Self::snapshot_locked(&state, id)).collect()
    }

    /// `0` if any container is warm right now, else a rough estimate based
    /// on nominal worker parallelism and historical average duration.
    pub async fn estimated_wait_seconds(&self) -> u64 {
        if self.pool.warm_count().await > 0 {
            return 0;
        }
        let len = self.state.lock().await.waiting.len() as u64;
        let avg = self.sessions.avg_session_duration().await;
        let batches = len.div_ceil(NOMINAL_PARALLELISM);
        (batches as f64 * avg) as u64
    }

    /// Marks every waiting entry `rate_limited`, fires callbacks, and
    /// purges all registries. Returns the count drained.
    pub async fn drain(&self) -> usize {
        let (drained, notifications): (usize, Vec<(mpsc::UnboundedSender<QueueNotification>, QueueNotification)>) = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state.waiting.drain(..).collect();
            let mut notifications = Vec::new();
            for id in &ids {
                if let Some(entry) = state.entries.get_mut(id) {
                    entry.status = QueueStatus::RateLimited;
                }
                if let Some(cb) = state.callbacks.get(id) {
                    notifications.push((
                        cb.clone(),
                        QueueNotification { entry_id: id.clone(), status: QueueStatus::RateLimited, session_id: None, port: None },
                    ));
                }
            }
            state.entries.clear();
            state.ip_index.clear();
            state.callbacks.clear();
            (ids.len(), notifications)
        };

        for (cb, note) in notifications {
            let _ = cb.send(note);
        }
        drained
    }

    fn snapshot_locked(state: &QueueState, id: &str) -> QueueEntrySnapshot {
        let entry = &state.entries[id];
        let position = if entry.status == QueueStatus::Waiting {
            state.waiting.iter().position(|e| e == id).map(|p| p + 1).unwrap_or(0)
        } else {
            0
        };
        QueueEntrySnapshot {
            id: entry.id.clone(),
            position,
            status: entry.status,
            session_id: entry.session_id.clone(),
            port: entry.port,
            total_in_queue: state.waiting.len(),
            created_at: entry.created_at,
        }
    }

    async fn notify_entry(&self, id: &str, status: QueueStatus, session_id: Option<String>, port: Option<u16>) {
        let cb = self.state.lock().await.callbacks.get(id).cloned();
        if let Some(cb) = cb {
            let _ = cb.send(QueueNotification { entry_id: id.to_string(), status, session_id, port });
        }
    }

    /// Processes the first waiting entry through `preparing -> connecting
    /// -> ready`, or requeues/drops it on failure. Runs on every worker
    /// wakeup; a no-op if the queue is empty or the pool has no warm
    /// capacity.
    async fn process_next(self: &Arc<Self>) {
        if self.pool.warm_count().await == 0 {
            return;
        }

        let popped = {
            let mut state = self.state.lock().await;
            let Some(id) = state.waiting.pop_front() else { return };
            state.entries.get(&id).cloned()
        };
        let Some(entry) = popped else { return };

        let rate = self.sessions.check_rate_limit(&entry.raw_ip).await;
        if !rate.allowed {
            let mut state = self.state.lock().await;
            if let Some(e) = state.entries.get_mut(&entry.id) {
                e.status = QueueStatus::RateLimited;
            }
            state.ip_index.remove(&entry.raw_ip);
            drop(state);
            self.notify_entry(&entry.id, QueueStatus::RateLimited, None, None).await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            if let Some(e) = state.entries.get_mut(&entry.id) {
                e.status = QueueStatus::Preparing;
            }
        }
        self.notify_entry(&entry.id, QueueStatus::Preparing, None, None).await;

        tokio::time::sleep(PREPARING_DELAY).await;

        {
            let mut state = self.state.lock().await;
            if let Some(e) = state.entries.get_mut(&entry.id) {
                e.status = QueueStatus::Connecting;
            }
        }
        self.notify_entry(&entry.id, QueueStatus::Connecting, None, None).await;

        match self.sessions.create_session(&entry.url, &entry.raw_ip).await {
            Ok(CreateSessionOutcome::Started(session)) => {
                let mut state = self.state.lock().await;
                if let Some(e) = state.entries.get_mut(&entry.id) {
                    e.status = QueueStatus::Ready;
                    e.session_id = Some(session.id.clone());
                    e.port = Some(session.port);
                }
                state.ip_index.remove(&entry.raw_ip);
                drop(state);
                info!("queue entry {} ready as session {}", entry.id, session.id);
                self.notify_entry(&entry.id, QueueStatus::Ready, Some(session.id), Some(session.port)).await;
            }
            Ok(CreateSessionOutcome::Queued) => {
                debug!("no warm capacity for queue entry {}, requeuing at front", entry.id);
                let mut state = self.state.lock().await;
                if let Some(e) = state.entries.get_mut(&entry.id) {
                    e.status = QueueStatus::Waiting;
                }
                state.waiting.push_front(entry.id.clone());
            }
            Err(e) => {
                warn!("dropping queue entry {} after hard error: {e}", entry.id);
                let mut state = self.state.lock().await;
                state.entries.remove(&entry.id);
                state.ip_index.remove(&entry.raw_ip);
                state.callbacks.remove(&entry.id);
            }
        }
    }

    /// Runs every ~500ms, and also whenever `enqueue` signals the worker.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let sleep = tokio::time::sleep(WORKER_INTERVAL);
            tokio::select! {
                _ = sleep => {}
                _ = self.notify.notified() => {}
            }
            self.process_next().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, status: QueueStatus) -> Entry {
        Entry {
            id: id.to_string(),
            url: "https://example.com".to_string(),
            raw_ip: "10.0.0.1".to_string(),
            status,
            session_id: None,
            port: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn snapshot_position_only_counts_waiting() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry("a", QueueStatus::Waiting));
        entries.insert("b".to_string(), entry("b", QueueStatus::Ready));
        let state = QueueState {
            waiting: VecDeque::from(vec!["a".to_string()]),
            entries,
            ip_index: HashMap::new(),
            callbacks: HashMap::new(),
        };
        assert_eq!(AdmissionQueue::snapshot_locked(&state, "a").position, 1);
        assert_eq!(AdmissionQueue::snapshot_locked(&state, "b").position, 0);
    }

    #[test]
    fn snapshots_cover_every_tracked_entry_regardless_of_status() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry("a", QueueStatus::Waiting));
        entries.insert("b".to_string(), entry("b", QueueStatus::Preparing));
        entries.insert("c".to_string(), entry("c", QueueStatus::Ready));
        let state = QueueState {
            waiting: VecDeque::from(vec!["a".to_string()]),
            entries,
            ip_index: HashMap::new(),
            callbacks: HashMap::new(),
        };

        let mut snapshots: Vec<_> =
            state.entries.keys().map(|id| AdmissionQueue::snapshot_locked(&state, id)).collect();
        snapshots.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].status, QueueStatus::Waiting);
        assert_eq!(snapshots[1].status, QueueStatus::Preparing);
        assert_eq!(snapshots[2].status, QueueStatus::Ready);
    }
}
