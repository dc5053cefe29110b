//! Error types for linkbond.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::InterfaceId;

/// Result type alias for linkbond operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for linkbond.
#[derive(Error, Debug)]
pub enum Error {
    // Request validation
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown interface: {0}")]
    UnknownInterface(InterfaceId),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    // Routing
    #[error("policy error: {0}")]
    Policy(String),

    #[error("bond degraded: {healthy} healthy interface(s), {required} required")]
    BondDegraded { healthy: usize, required: usize },

    #[error("bonding is not enabled")]
    NotEnabled,

    // Collaborators
    #[error("interface discovery failed: {0}")]
    Discovery(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Conditions the controller recovers from on its own once health returns.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BondDegraded { .. } | Error::Policy(_))
    }

    /// Errors caused by the caller's request rather than link state.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::UnknownInterface(_) | Error::InvalidPolicy(_)
        )
    }
}

/// Outcome of a failed reachability check.
///
/// Absorbed by the health prober and counted toward the failure threshold;
/// never returned from controller or router operations.
#[derive(Error, Debug)]
pub enum ProbeFailure {
    #[error("probe timed out")]
    Timeout,

    #[error("interface {0} has no assigned address")]
    NoAddress(InterfaceId),

    #[error("no probe targets configured")]
    NoTargets,

    #[error("probe to {target} failed: {source}")]
    Io {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid response from {target}: {reason}")]
    InvalidResponse { target: SocketAddr, reason: String },
}

/// Context attached to probe failures in log output.
#[derive(Debug)]
pub struct ProbeContext<'a> {
    pub interface: &'a InterfaceId,
    pub target: Option<SocketAddr>,
    pub attempt: u32,
}

impl fmt::Display for ProbeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interface={}", self.interface)?;
        if let Some(target) = self.target {
            write!(f, ", target={target}")?;
        }
        write!(f, ", attempt={}", self.attempt)
    }
}
