//! Liaison Core
//!
//! This crate contains the transport-agnostic building blocks shared by every
//! coordination protocol:
//! - Peer addressing (`endpoint`, `identity`)
//! - The tagged JSON envelope codec (`envelope`)
//! - Supervisor application states (`state`)
//! - Multi-frame message builder (`message`)
//! - Protocol tuning (`options`) and per-session flags (`session`)
//! - External collaborators: port leasing and key-value registry (`services`)
//! - Transport strategy traits and the no-op variant (`transport`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod message;
pub mod options;
pub mod services;
pub mod session;
pub mod state;
pub mod transport;

pub use error::{LiaisonError, Result};

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::endpoint::Endpoint;
    pub use crate::envelope::{Ack, Envelope, MessageType, StatusEvent};
    pub use crate::error::{LiaisonError, Result};
    pub use crate::identity::{AppIdentity, Identity, PeerApp};
    pub use crate::message::Frames;
    pub use crate::options::ProtocolOptions;
    pub use crate::services::{
        AppContext, InMemoryRegistry, KeyValueRegistry, LocalPortService, PortService, Services,
    };
    pub use crate::session::SessionFlags;
    pub use crate::state::ApplicationState;
    pub use crate::transport::{
        CancelHandle, Cancel, IncomingRequest, PublisherTransport, RelayTransport,
        RequesterTransport, ResponderTransport, SubscriberTransport,
    };
}
