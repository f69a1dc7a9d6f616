//! # Liaison ZMQ
//!
//! ZeroMQ-backed variants of the liaison transport traits.
//!
//! ## Socket layout
//!
//! - **Publisher**: PUB on a leased port, plus a REP rendezvous when
//!   subscribers are expected
//! - **Subscriber**: SUB connected to the publisher, to a private `inproc://`
//!   cancel publisher and optionally to the supervisor status publisher
//! - **Requester**: DEALER, recreated after every timeout
//! - **Responder**: ROUTER carrying the responder identity
//! - **Relay**: external ROUTER on a leased port, internal DEALER on `inproc://`
//! - **Pooled responder**: ROUTER connected to a relay's DEALER
//!
//! Every blocking receive is woken by a message on a socket it already
//! polls, or notices a cancel flag within one polling interval.
//!
//! All protocol objects of a process must share one [`ZmqContext`]: the
//! `inproc://` endpoints used for cancellation and relaying only reach
//! sockets of the same context.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod context;
pub mod pooled;
pub mod publisher;
pub mod relay;
pub mod request_socket;
pub mod requester;
pub mod responder;
pub mod socket;
pub mod subscriber;

pub use context::ZmqContext;
pub use pooled::ZmqPooledResponder;
pub use publisher::ZmqPublisher;
pub use relay::ZmqRelay;
pub use request_socket::RequestSocket;
pub use requester::ZmqRequester;
pub use responder::ZmqResponder;
pub use subscriber::ZmqSubscriber;
