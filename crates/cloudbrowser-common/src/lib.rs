//! Shared types used across the cloud-browser control plane: the error
//! taxonomy, runtime configuration, and the log-sink seam that lets the
//! core run without a real persistence layer.

pub use serde::{Deserialize, Serialize};
pub use tracing;
pub use uuid;

mod config;
mod error;
mod log_sink;
pub mod net;

pub use config::Config;
pub use error::Error;
pub use log_sink::{LogSink, NullLogSink, RecordingLogSink, SessionLogEvent};

pub type Result<T> = std::result::Result<T, Error>;
