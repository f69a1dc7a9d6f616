//! # Liaison
//!
//! Coordination protocols for independently started applications that find
//! each other through a shared registry.
//!
//! ## Architecture
//!
//! - **`liaison-core`**: envelope codec, identities, options, session flags,
//!   port and registry services, transport strategy traits
//! - **`liaison-zmq`**: ZeroMQ transports (opt-in via the `zmq` feature)
//! - **`liaison`**: public API surface (this crate)
//!
//! ## Protocols
//!
//! - [`Publisher`] / [`Subscriber`]: broadcast stream with an optional
//!   rendezvous that holds the publisher until N subscribers joined, and a
//!   graceful end of stream
//! - [`Requester`] / [`Responder`]: point-to-point request/response with a
//!   readiness handshake, timeouts and cooperative cancellation
//! - [`ResponderRouter`] / [`PooledResponder`]: one public responder name
//!   served by a pool of worker threads behind a frame relay
//!
//! Timeouts and cancellation are not errors. Operations return `None` or
//! `false` and the outcome is read back through `has_timed_out()`,
//! `is_canceled()` and `has_ended()`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "zmq")]
//! # fn example() -> liaison::Result<()> {
//! use liaison::prelude::*;
//!
//! let app = AppIdentity::new("server", 1, Endpoint::tcp("127.0.0.1", 0)?);
//! let ctx = ZmqContext::new(AppContext::new(app, Services::local(7000..=7999)));
//!
//! let mut responder = Responder::create(&ctx, "echo")?;
//! while let Some(request) = responder.receive()? {
//!     let text = request.get_string();
//!     request.reply_string(&text)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Blocking receives can be interrupted from another thread through the
//! handle returned by `canceler()`.

#![warn(clippy::all)]

pub mod dev_tracing;

mod publisher;
mod requester;
mod responder;
mod router;
mod subscriber;

pub use publisher::{Publisher, SyncPublisher};
pub use requester::Requester;
pub use responder::{Request, Responder};
pub use router::{PooledResponder, ResponderRouter};
pub use subscriber::Subscriber;

// Re-export core types
pub use bytes::Bytes;
pub use liaison_core::endpoint::Endpoint;
pub use liaison_core::envelope::{RequesterInfo, StatusEvent};
pub use liaison_core::identity::{AppIdentity, Identity, PeerApp};
pub use liaison_core::options::ProtocolOptions;
pub use liaison_core::services::{
    AppContext, InMemoryRegistry, KeyValueRegistry, LocalPortService, PortService, Services,
};
pub use liaison_core::state::ApplicationState;
pub use liaison_core::transport::{Cancel, CancelHandle};
pub use liaison_core::{LiaisonError, Result};

#[cfg(feature = "zmq")]
pub use liaison_zmq::ZmqContext;

/// Convenient imports.
pub mod prelude {
    pub use super::{
        AppContext, AppIdentity, ApplicationState, Bytes, CancelHandle, Endpoint, LiaisonError,
        PeerApp, PooledResponder, ProtocolOptions, Publisher, Request, Requester, Responder,
        ResponderRouter, Result, Services, Subscriber,
    };

    #[cfg(feature = "zmq")]
    pub use super::ZmqContext;
}

/// Decode text payloads leniently.
fn to_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}
