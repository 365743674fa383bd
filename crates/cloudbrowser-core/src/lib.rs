//! The control-plane core: container pool, session manager, admission
//! queue, realtime channel, and admin aggregation, wired together by
//! explicit constructor injection (no process-wide statics).

pub mod admin;
pub mod pool;
pub mod queue;
pub mod realtime;
pub mod session;

pub use admin::AdminControl;
pub use pool::ContainerPool;
pub use queue::AdmissionQueue;
pub use realtime::RealtimeChannel;
pub use session::SessionManager;
