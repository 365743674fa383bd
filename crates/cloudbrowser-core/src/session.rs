//! C2 — Session Manager: session lifecycle, expiry, and per-IP policy.
//! Sessions, policy sets, and counters all live behind one mutex; the
//! container handle handed out by C1 never escapes this module.

use crate::pool::ContainerPool;
use chrono::{NaiveDate, Utc};
use cloudbrowser_common::log_sink::{LogSink, SessionLogEvent, SessionLogKind};
use cloudbrowser_common::net::anonymize_ip;
use cloudbrowser_common::Error;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const ROLLING_WINDOW_CAP: usize = 20;
const EXPIRY_INTERVAL: Duration = Duration::from_secs(5);
const DISALLOWED_SCHEMES: &[&str] = &["file", "javascript", "data", "chrome", "about"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Expired,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    container_id: String,
    port: u16,
    url: String,
    anon_ip: String,
    started_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
    status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub port: u16,
    pub url: String,
    pub anon_ip: String,
    pub status: SessionStatus,
    pub started_at: chrono::DateTime<Utc>,
    pub expires_at: chrono::DateTime<Utc>,
    pub time_remaining: u64,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            port: s.port,
            url: s.url.clone(),
            anon_ip: s.anon_ip.clone(),
            status: s.status,
            started_at: s.started_at,
            expires_at: s.expires_at,
            time_remaining: remaining_secs(s.expires_at),
        }
    }
}

fn remaining_secs(expires_at: chrono::DateTime<Utc>) -> u64 {
    (expires_at - Utc::now()).num_seconds().max(0) as u64
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
    pub blocked: bool,
}

pub enum CreateSessionOutcome {
    Started(SessionSnapshot),
    Queued,
}

struct PolicyState {
    sessions: HashMap<String, Session>,
    session_order: VecDeque<String>,
    blocked: HashSet<String>,
    whitelist: HashSet<String>,
    ip_count_today: HashMap<String, u32>,
    today: NaiveDate,
    paused: bool,
    current_duration: Duration,
    duration_window: VecDeque<u64>,
    rate_limit_per_day: u32,
    sessions_today: u32,
    peak_concurrent: u32,
    daily_session_counts: HashMap<NaiveDate, u32>,
}

const HISTORY_CAP: usize = 2000;
const WEEK_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryPage {
    pub items: Vec<SessionSnapshot>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct SessionManager {
    pool: Arc<ContainerPool>,
    log_sink: Arc<dyn LogSink>,
    state: Mutex<PolicyState>,
}

impl SessionManager {
    pub fn new(
        pool: Arc<ContainerPool>,
        log_sink: Arc<dyn LogSink>,
        default_duration: Duration,
        rate_limit_per_day: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            log_sink,
            state: Mutex::new(PolicyState {
                sessions: HashMap::new(),
                session_order: VecDeque::new(),
                blocked: HashSet::new(),
                whitelist: HashSet::new(),
                ip_count_today: HashMap::new(),
                today: Utc::now().date_naive(),
                paused: false,
                current_duration: default_duration,
                duration_window: VecDeque::with_capacity(ROLLING_WINDOW_CAP),
                rate_limit_per_day,
                sessions_today: 0,
                peak_concurrent: 0,
                daily_session_counts: HashMap::new(),
            }),
        })
    }

    /// Normalizes a user-submitted URL. Rejects a fixed set of dangerous
    /// schemes; otherwise treats bare input as a domain (if it contains a
    /// dot and no whitespace) or as a search query.
    pub fn normalize_url(input: &str) -> Result<String, Error> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InputRejected("URL is required".to_string()));
        }

        if let Some((scheme, _)) = trimmed.split_once(':') {
            let scheme_lower = scheme.to_ascii_lowercase();
            if DISALLOWED_SCHEMES.contains(&scheme_lower.as_str()) {
                return Err(Error::InputRejected(format!("Blocked protocol: {scheme_lower}:")));
            }
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(trimmed.to_string());
        }

        if trimmed.contains('.') && !trimmed.contains(char::is_whitespace) {
            return Ok(format!("https://{trimmed}"));
        }

        let query = urlencoding_light(trimmed);
        Ok(format!("https://duckduckgo.com/?q={query}"))
    }

    fn roll_day_if_needed(state: &mut PolicyState) {
        let today = Utc::now().date_naive();
        if state.today != today {
            state.today = today;
            state.ip_count_today.clear();
            state.sessions_today = 0;
            state.peak_concurrent = 0;
            let cutoff = today - chrono::Duration::days(WEEK_DAYS);
            state.daily_session_counts.retain(|day, _| *day > cutoff);
        }
    }

    pub async fn check_rate_limit(&self, ip: &str) -> RateLimitStatus {
        let mut state = self.state.lock().await;
        Self::roll_day_if_needed(&mut state);
        Self::rate_limit_status(&state, ip)
    }

    fn rate_limit_status(state: &PolicyState, ip: &str) -> RateLimitStatus {
        let used = state.ip_count_today.get(ip).copied().unwrap_or(0);
        let limit = state.rate_limit_per_day;

        if state.blocked.contains(ip) {
            return RateLimitStatus { allowed: false, used, remaining: 0, limit, blocked: true };
        }
        if state.whitelist.contains(ip) {
            return RateLimitStatus { allowed: true, used, remaining: limit, limit, blocked: false };
        }

        let remaining = limit.saturating_sub(used);
        RateLimitStatus { allowed: remaining > 0, used, remaining, limit, blocked: false }
    }

    /// Acquires a container and starts a session. Callers must have already
    /// verified the rate limit and pause state; this method only records
    /// the daily counters for the IP that is actually consuming a slot.
    #[instrument(skip(self, url))]
    pub async fn create_session(&self, url: &str, raw_ip: &str) -> Result<CreateSessionOutcome, Error> {
        let url = Self::normalize_url(url)?;
        let session_id = Uuid::new_v4().to_string();

        let Some(container) = self.pool.acquire(&session_id).await else {
            return Ok(CreateSessionOutcome::Queued);
        };

        let duration = {
            let mut state = self.state.lock().await;
            Self::roll_day_if_needed(&mut state);
            *state.ip_count_today.entry(raw_ip.to_string()).or_insert(0) += 1;
            state.sessions_today += 1;
            let today = state.today;
            *state.daily_session_counts.entry(today).or_insert(0) += 1;
            state.current_duration
        };

        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(duration).unwrap_or_default();
        let anon_ip = anonymize_ip(raw_ip);

        let session = Session {
            id: session_id.clone(),
            container_id: container.id.clone(),
            port: container.port,
            url: url.clone(),
            anon_ip: anon_ip.clone(),
            started_at: now,
            expires_at,
            status: SessionStatus::Active,
        };
        let snapshot = SessionSnapshot::from(&session);

        {
            let mut state = self.state.lock().await;
            state.sessions.insert(session_id.clone(), session);
            state.session_order.push_back(session_id.clone());
            if state.session_order.len() > HISTORY_CAP {
                if let Some(evicted) = state.session_order.pop_front() {
                    state.sessions.remove(&evicted);
                }
            }
            let concurrent = state.sessions.values().filter(|s| s.status == SessionStatus::Active).count() as u32;
            if concurrent > state.peak_concurrent {
                state.peak_concurrent = concurrent;
            }
        }

        self.pool.launch_app(&container.id, &url).await;

        self.log_sink
            .record(SessionLogEvent {
                session_id: session_id.clone(),
                anon_ip,
                url,
                kind: SessionLogKind::Started,
            })
            .await;

        info!("session {session_id} started on container {}", container.id);
        Ok(CreateSessionOutcome::Started(snapshot))
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionSnapshot> {
        self.state.lock().await.sessions.get(id).map(SessionSnapshot::from)
    }

    pub async fn time_remaining(&self, id: &str) -> Option<u64> {
        self.state.lock().await.sessions.get(id).map(|s| remaining_secs(s.expires_at))
    }

    /// Idempotent: ends an `active` session, releasing its container. A
    /// second call on an already-ended/expired session is a no-op.
    #[instrument(skip(self))]
    pub async fn end_session(&self, id: &str, reason: &str) -> bool {
        let (container_id, anon_ip, url, duration_secs) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.get_mut(id) else {
                return false;
            };
            if session.status != SessionStatus::Active {
                return false;
            }
            session.status = if reason == "expired" { SessionStatus::Expired } else { SessionStatus::Ended };
            let duration_secs = (Utc::now() - session.started_at).num_seconds().max(0) as u64;
            if state.duration_window.len() == ROLLING_WINDOW_CAP {
                state.duration_window.pop_front();
            }
            state.duration_window.push_back(duration_secs);
            let session = state.sessions.get(id).unwrap();
            (session.container_id.clone(), session.anon_ip.clone(), session.url.clone(), duration_secs)
        };

        self.log_sink
            .record(SessionLogEvent {
                session_id: id.to_string(),
                anon_ip,
                url,
                kind: SessionLogKind::Ended { reason: reason.to_string(), duration_secs },
            })
            .await;

        self.pool.release(&container_id).await;
        info!("session {id} ended ({reason})");
        true
    }

    pub async fn set_paused(&self, paused: bool) {
        self.state.lock().await.paused = paused;
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    pub async fn set_duration(&self, duration: Duration) {
        self.state.lock().await.current_duration = duration;
    }

    pub async fn current_duration(&self) -> Duration {
        self.state.lock().await.current_duration
    }

    pub async fn block(&self, ip: &str) {
        let mut state = self.state.lock().await;
        state.whitelist.remove(ip);
        state.blocked.insert(ip.to_string());
    }

    pub async fn unblock(&self, ip: &str) {
        self.state.lock().await.blocked.remove(ip);
    }

    pub async fn whitelist(&self, ip: &str) {
        let mut state = self.state.lock().await;
        state.blocked.remove(ip);
        state.whitelist.insert(ip.to_string());
    }

    pub async fn unwhitelist(&self, ip: &str) {
        self.state.lock().await.whitelist.remove(ip);
    }

    pub async fn clear_limit(&self, ip: &str) {
        self.state.lock().await.ip_count_today.remove(ip);
    }

    /// Mean of the rolling duration window, falling back to the current
    /// configured duration when no session has completed yet.
    pub async fn avg_session_duration(&self) -> f64 {
        let state = self.state.lock().await;
        if state.duration_window.is_empty() {
            return state.current_duration.as_secs() as f64;
        }
        let sum: u64 = state.duration_window.iter().sum();
        sum as f64 / state.duration_window.len() as f64
    }

    pub async fn sessions_today(&self) -> u32 {
        self.state.lock().await.sessions_today
    }

    /// Sum of the daily session-start buckets over the trailing 7 calendar
    /// days (inclusive of today).
    pub async fn sessions_this_week(&self) -> u32 {
        Self::week_total(&self.state.lock().await)
    }

    fn week_total(state: &PolicyState) -> u32 {
        let today = state.today;
        (0..WEEK_DAYS)
            .filter_map(|offset| today.checked_sub_signed(chrono::Duration::days(offset)))
            .map(|day| state.daily_session_counts.get(&day).copied().unwrap_or(0))
            .sum()
    }

    pub async fn peak_concurrent(&self) -> u32 {
        self.state.lock().await.peak_concurrent
    }

    /// Paginated, newest-first session history with an optional substring
    /// filter over URL or anonymized IP. Includes ended/expired sessions —
    /// the in-memory store retains them up to `HISTORY_CAP` for this view
    /// since the persistent log store is out of scope (§1).
    pub async fn history(&self, page: usize, page_size: usize, query: Option<&str>) -> SessionHistoryPage {
        Self::history_page(&self.state.lock().await, page, page_size, query)
    }

    fn history_page(state: &PolicyState, page: usize, page_size: usize, query: Option<&str>) -> SessionHistoryPage {
        let page_size = page_size.clamp(1, 200);
        let page = page.max(1);

        let mut matching: Vec<SessionSnapshot> = state
            .session_order
            .iter()
            .rev()
            .filter_map(|id| state.sessions.get(id))
            .filter(|s| match query {
                Some(q) if !q.is_empty() => {
                    let q = q.to_ascii_lowercase();
                    s.url.to_ascii_lowercase().contains(&q) || s.anon_ip.contains(&q)
                }
                _ => true,
            })
            .map(SessionSnapshot::from)
            .collect();

        let total = matching.len();
        let start = (page - 1) * page_size;
        if start >= matching.len() {
            matching.clear();
        } else {
            let end = (start + page_size).min(matching.len());
            matching = matching[start..end].to_vec();
        }

        SessionHistoryPage { items: matching, total, page, page_size }
    }

    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub async fn list_active(&self) -> Vec<SessionSnapshot> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .map(SessionSnapshot::from)
            .collect()
    }

    pub async fn rate_limit_stats(&self) -> (HashMap<String, u32>, Vec<String>, Vec<String>) {
        let state = self.state.lock().await;
        (
            state.ip_count_today.clone(),
            state.blocked.iter().cloned().collect(),
            state.whitelist.iter().cloned().collect(),
        )
    }

    /// Every 5s, ends any `active` session whose `expiresAt` has passed.
    pub async fn run_expiry_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EXPIRY_INTERVAL);
        loop {
            interval.tick().await;
            let expired: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .sessions
                    .values()
                    .filter(|s| s.status == SessionStatus::Active && s.expires_at <= Utc::now())
                    .map(|s| s.id.clone())
                    .collect()
            };
            for id in expired {
                debug!("expiry loop ending session {id}");
                self.end_session(&id, "expired").await;
            }
        }
    }
}

fn urlencoding_light(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dangerous_schemes() {
        for scheme in DISALLOWED_SCHEMES {
            let input = format!("{scheme}:something");
            assert!(SessionManager::normalize_url(&input).is_err());
        }
    }

    #[test]
    fn treats_bare_domain_as_https() {
        assert_eq!(SessionManager::normalize_url("example.com").unwrap(), "https://example.com");
    }

    #[test]
    fn treats_bare_phrase_as_search() {
        let result = SessionManager::normalize_url("rust async book").unwrap();
        assert!(result.starts_with("https://duckduckgo.com/?q="));
    }

    #[test]
    fn passes_through_explicit_scheme() {
        assert_eq!(
            SessionManager::normalize_url("https://example.com/path").unwrap(),
            "https://example.com/path"
        );
    }

    #[test]
    fn rejects_empty_input() {
        assert!(SessionManager::normalize_url("   ").is_err());
    }

    fn empty_state() -> PolicyState {
        PolicyState {
            sessions: HashMap::new(),
            session_order: VecDeque::new(),
            blocked: HashSet::new(),
            whitelist: HashSet::new(),
            ip_count_today: HashMap::new(),
            today: Utc::now().date_naive(),
            paused: false,
            current_duration: Duration::from_secs(600),
            duration_window: VecDeque::new(),
            rate_limit_per_day: 3,
            sessions_today: 0,
            peak_concurrent: 0,
            daily_session_counts: HashMap::new(),
        }
    }

    fn session(id: &str, url: &str, anon_ip: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            container_id: format!("container-{id}"),
            port: 9000,
            url: url.to_string(),
            anon_ip: anon_ip.to_string(),
            started_at: now,
            expires_at: now + chrono::Duration::seconds(600),
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn rate_limit_allows_under_cap() {
        let state = empty_state();
        let status = SessionManager::rate_limit_status(&state, "1.2.3.4");
        assert!(status.allowed);
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, 3);
    }

    #[test]
    fn rate_limit_blocks_at_cap() {
        let mut state = empty_state();
        state.ip_count_today.insert("1.2.3.4".to_string(), 3);
        let status = SessionManager::rate_limit_status(&state, "1.2.3.4");
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn rate_limit_whitelist_overrides_usage() {
        let mut state = empty_state();
        state.ip_count_today.insert("1.2.3.4".to_string(), 3);
        state.whitelist.insert("1.2.3.4".to_string());
        let status = SessionManager::rate_limit_status(&state, "1.2.3.4");
        assert!(status.allowed);
        assert!(!status.blocked);
    }

    #[test]
    fn rate_limit_blocklist_wins_over_whitelist() {
        let mut state = empty_state();
        state.blocked.insert("1.2.3.4".to_string());
        state.whitelist.insert("1.2.3.4".to_string());
        let status = SessionManager::rate_limit_status(&state, "1.2.3.4");
        assert!(!status.allowed);
        assert!(status.blocked);
    }

    #[test]
    fn week_total_sums_trailing_seven_days() {
        let mut state = empty_state();
        let today = state.today;
        state.daily_session_counts.insert(today, 2);
        state.daily_session_counts.insert(today - chrono::Duration::days(3), 5);
        state.daily_session_counts.insert(today - chrono::Duration::days(10), 99);
        assert_eq!(SessionManager::week_total(&state), 7);
    }

    #[test]
    fn history_paginates_newest_first() {
        let mut state = empty_state();
        for i in 0..5 {
            let id = format!("s{i}");
            state.sessions.insert(id.clone(), session(&id, "https://example.com", "1.2.3.0"));
            state.session_order.push_back(id);
        }

        let page = SessionManager::history_page(&state, 1, 2, None);
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "s4");
        assert_eq!(page.items[1].id, "s3");
    }

    #[test]
    fn history_filters_by_url_substring() {
        let mut state = empty_state();
        state.sessions.insert("a".to_string(), session("a", "https://rust-lang.org", "1.2.3.0"));
        state.sessions.insert("b".to_string(), session("b", "https://example.com", "5.6.7.0"));
        state.session_order.push_back("a".to_string());
        state.session_order.push_back("b".to_string());

        let page = SessionManager::history_page(&state, 1, 25, Some("rust"));
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "a");
    }

    #[test]
    fn history_page_past_the_end_is_empty() {
        let mut state = empty_state();
        state.sessions.insert("a".to_string(), session("a", "https://example.com", "1.2.3.0"));
        state.session_order.push_back("a".to_string());

        let page = SessionManager::history_page(&state, 5, 25, None);
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
    }
}
