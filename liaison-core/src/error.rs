//! Liaison error types
//!
//! Timeouts, cancellation and end of stream are not errors: protocol objects
//! report them through [`SessionFlags`](crate::session::SessionFlags) and
//! `Option` returns. What remains here are failures the caller must act on.

use crate::endpoint::EndpointError;
use crate::envelope::EnvelopeError;
use crate::identity::IdentityError;
use crate::services::{PortError, RegistryError};
use thiserror::Error;

/// Main error type for Liaison operations
#[derive(Error, Debug)]
pub enum LiaisonError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Registry failure, including naming conflicts
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Port(#[from] PortError),

    /// Error reported by the underlying socket library
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer violated the message exchange
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation called before `init` or after `terminate`
    #[error("Protocol object is not initialized")]
    NotInitialized,
}

/// Result type alias for Liaison operations
pub type Result<T> = std::result::Result<T, LiaisonError>;

impl LiaisonError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// The name is already registered by another instance.
    #[must_use]
    pub const fn is_naming_conflict(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::KeyAlreadyExists(_)))
    }

    /// Bad endpoint or identity string, or an unparsable envelope.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Endpoint(_) | Self::Identity(_) | Self::Envelope(_)
        )
    }

    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
