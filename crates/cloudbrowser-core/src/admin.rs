//! C5 — Admin Control: pure aggregation and action dispatch across
//! C1-C4. Owns no state of its own beyond the bounds it enforces on
//! writes.

use crate::pool::{ContainerPool, ContainerSnapshot, ContainerStatus};
use crate::queue::AdmissionQueue;
use crate::realtime::RealtimeChannel;
use crate::session::{SessionManager, SessionSnapshot};
use cloudbrowser_common::Error;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const POOL_SIZE_MIN: usize = 1;
const POOL_SIZE_MAX: usize = 20;
const DURATION_MIN_SECS: u64 = 60;
const DURATION_MAX_SECS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayContainerStatus {
    Booting,
    Warm,
    Active,
    Destroying,
    Reconnecting,
}

impl From<ContainerStatus> for DisplayContainerStatus {
    fn from(s: ContainerStatus) -> Self {
        match s {
            ContainerStatus::Booting => Self::Booting,
            ContainerStatus::Warm => Self::Warm,
            ContainerStatus::Active => Self::Active,
            ContainerStatus::Destroying => Self::Destroying,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminContainerSnapshot {
    pub id: String,
    pub port: u16,
    pub status: DisplayContainerStatus,
    pub session_id: Option<String>,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub active_sessions: usize,
    pub queue_length: usize,
    pub pool: Vec<AdminContainerSnapshot>,
    pub sessions_today: u32,
    pub sessions_this_week: u32,
    pub peak_concurrent: u32,
    pub avg_session_duration: f64,
    pub weekly_avg_duration: f64,
    pub current_duration_secs: u64,
    pub pool_size: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitReport {
    pub used_today: std::collections::HashMap<String, u32>,
    pub blocked: Vec<String>,
    pub whitelisted: Vec<String>,
    pub limit_per_day: u32,
}

/// Aggregates C1-C4 state for the admin surface and validates/dispatches
/// runtime reconfiguration. Reads reach into the other components by
/// method call only — it owns no shared mutable collection itself.
pub struct AdminControl {
    pool: Arc<ContainerPool>,
    sessions: Arc<SessionManager>,
    queue: Arc<AdmissionQueue>,
    realtime: Arc<RealtimeChannel>,
    rate_limit_per_day: u32,
}

impl AdminControl {
    pub fn new(
        pool: Arc<ContainerPool>,
        sessions: Arc<SessionManager>,
        queue: Arc<AdmissionQueue>,
        realtime: Arc<RealtimeChannel>,
        rate_limit_per_day: u32,
    ) -> Arc<Self> {
        Arc::new(Self { pool, sessions, queue, realtime, rate_limit_per_day })
    }

    /// Containers whose bound session is in C4's reconnecting set are
    /// reported as `reconnecting` instead of `active`. Pure aggregation.
    pub async fn pool_snapshot(&self) -> Vec<AdminContainerSnapshot> {
        let reconnecting = self.realtime.reconnecting_session_ids().await;
        self.pool
            .status()
            .await
            .into_iter()
            .map(|c: ContainerSnapshot| {
                let status = if c
                    .session_id
                    .as_ref()
                    .map(|sid| reconnecting.contains(sid))
                    .unwrap_or(false)
                {
                    DisplayContainerStatus::Reconnecting
                } else {
                    DisplayContainerStatus::from(c.status)
                };
                AdminContainerSnapshot {
                    id: c.id,
                    port: c.port,
                    status,
                    session_id: c.session_id,
                    age_secs: c.age_secs,
                }
            })
            .collect()
    }

    pub async fn session_list(&self) -> Vec<SessionSnapshot> {
        self.sessions.list_active().await
    }

    pub async fn stats(&self) -> Stats {
        let pool = self.pool_snapshot().await;
        let avg = self.sessions.avg_session_duration().await;
        Stats {
            active_sessions: self.sessions.active_count().await,
            queue_length: self.queue.length().await,
            pool,
            sessions_today: self.sessions.sessions_today().await,
            sessions_this_week: self.sessions.sessions_this_week().await,
            peak_concurrent: self.sessions.peak_concurrent().await,
            avg_session_duration: avg,
            weekly_avg_duration: avg,
            current_duration_secs: self.sessions.current_duration().await.as_secs(),
            pool_size: self.pool.pool_size().await,
            paused: self.sessions.is_paused().await,
        }
    }

    /// Paginated, newest-first session history with an optional URL/IP
    /// substring search. Pure read-through to C2.
    pub async fn session_history(
        &self,
        page: usize,
        page_size: usize,
        query: Option<&str>,
    ) -> crate::session::SessionHistoryPage {
        self.sessions.history(page, page_size, query).await
    }

    pub async fn rate_limit_stats(&self) -> RateLimitReport {
        let (used_today, blocked, whitelisted) = self.sessions.rate_limit_stats().await;
        RateLimitReport { used_today, blocked, whitelisted, limit_per_day: self.rate_limit_per_day }
    }

    pub async fn block_ip(&self, ip: &str) {
        self.sessions.block(ip).await;
    }

    pub async fn unblock_ip(&self, ip: &str) {
        self.sessions.unblock(ip).await;
    }

    pub async fn whitelist_ip(&self, ip: &str) {
        self.sessions.whitelist(ip).await;
    }

    pub async fn unwhitelist_ip(&self, ip: &str) {
        self.sessions.unwhitelist(ip).await;
    }

    pub async fn clear_limit(&self, ip: &str) {
        self.sessions.clear_limit(ip).await;
    }

    pub async fn kill_session(&self, id: &str) -> bool {
        let ended = self.sessions.end_session(id, "admin_killed").await;
        if ended {
            self.realtime.notify_session_ended(id, "admin_killed").await;
        }
        ended
    }

    pub async fn pause(&self) {
        self.sessions.set_paused(true).await;
    }

    pub async fn resume(&self) {
        self.sessions.set_paused(false).await;
    }

    pub async fn drain_queue(&self) -> usize {
        self.queue.drain().await
    }

    pub async fn restart_pool(&self) {
        self.pool.restart().await;
    }

    pub fn set_pool_size(&self, n: usize) -> Result<(), Error> {
        if !(POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&n) {
            return Err(Error::InputRejected(format!(
                "pool size must be between {POOL_SIZE_MIN} and {POOL_SIZE_MAX}"
            )));
        }
        let pool = self.pool.clone();
        tokio::spawn(async move { pool.set_pool_size(n).await });
        Ok(())
    }

    pub fn set_duration(&self, secs: u64) -> Result<(), Error> {
        if !(DURATION_MIN_SECS..=DURATION_MAX_SECS).contains(&secs) {
            return Err(Error::InputRejected(format!(
                "duration must be between {DURATION_MIN_SECS} and {DURATION_MAX_SECS} seconds"
            )));
        }
        let sessions = self.sessions.clone();
        tokio::spawn(async move { sessions.set_duration(Duration::from_secs(secs)).await });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_bounds_reject_out_of_range() {
        assert!((POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&0) == false);
        assert!((POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&21) == false);
        assert!((POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&5));
    }

    #[test]
    fn duration_bounds_reject_out_of_range() {
        assert!(!(DURATION_MIN_SECS..=DURATION_MAX_SECS).contains(&30));
        assert!(!(DURATION_MIN_SECS..=DURATION_MAX_SECS).contains(&3600));
        assert!((DURATION_MIN_SECS..=DURATION_MAX_SECS).contains(&300));
    }
}
