//! Error types for the handover protocol
//!
//! This module provides error handling using thiserror for structured error
//! definitions and anyhow for propagation at the binary boundary.

use std::fmt;
use thiserror::Error;

/// Phase of a generation handoff, used to tell operators where startup broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Acquiring or joining the coordination directory lock
    Acquire,
    /// Connecting to the predecessor's handoff socket
    Connect,
    /// Reading the descriptor-name manifest
    Manifest,
    /// Receiving the descriptors themselves
    Descriptors,
    /// Writing the readiness byte back to the predecessor
    ReadySignal,
    /// Marking this process as the owner
    Promote,
    /// Releasing the coordination lock
    Release,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquire => "acquire",
            Phase::Connect => "connect",
            Phase::Manifest => "manifest",
            Phase::Descriptors => "descriptors",
            Phase::ReadySignal => "ready-signal",
            Phase::Promote => "promote",
            Phase::Release => "release",
        };
        f.write_str(name)
    }
}

/// Main error type for handover operations
#[derive(Error, Debug)]
pub enum HandoverError {
    /// The byte-level exchange with the other generation broke
    #[error("Protocol error during {phase}: {reason}")]
    Protocol { phase: Phase, reason: String },

    /// The predecessor sent a different number of descriptors than it announced
    #[error("Descriptor count mismatch: manifest named {expected}, received {received}")]
    ResourceMismatch { expected: usize, received: usize },

    /// Coordination lock collaborator failure
    #[error("Lock error during {phase}: {reason}")]
    Lock { phase: Phase, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl HandoverError {
    pub(crate) fn protocol(phase: Phase, reason: impl Into<String>) -> Self {
        HandoverError::Protocol {
            phase,
            reason: reason.into(),
        }
    }

    pub(crate) fn lock(phase: Phase, reason: impl Into<String>) -> Self {
        HandoverError::Lock {
            phase,
            reason: reason.into(),
        }
    }

    /// The handoff phase this error belongs to, if it is tied to one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            HandoverError::Protocol { phase, .. } | HandoverError::Lock { phase, .. } => {
                Some(*phase)
            }
            HandoverError::ResourceMismatch { .. } => Some(Phase::Descriptors),
            _ => None,
        }
    }
}

/// Result type alias for handover operations
pub type Result<T> = std::result::Result<T, HandoverError>;

/// Convert anyhow::Error to HandoverError
impl From<anyhow::Error> for HandoverError {
    fn from(err: anyhow::Error) -> Self {
        HandoverError::Other(err.to_string())
    }
}
