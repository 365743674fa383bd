use thiserror::Error;

/// Error taxonomy for the control plane. Variants are grouped by how a
/// failure propagates (user-facing vs. logged-and-recovered), not by
/// which piece of code happened to notice it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("input rejected: {0}")]
    InputRejected(String),

    #[error("rate limit exceeded, remaining: {remaining}")]
    Throttled { remaining: u32 },

    #[error("service paused")]
    Paused,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no warm container available")]
    CapacityExhausted,

    #[error("container runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
