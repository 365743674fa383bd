use cloudbrowser_core::{AdminControl, AdmissionQueue, ContainerPool, RealtimeChannel, SessionManager};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ContainerPool>,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<AdmissionQueue>,
    pub realtime: Arc<RealtimeChannel>,
    pub admin: Arc<AdminControl>,
    pub admin_user: String,
    pub admin_password: String,
}
