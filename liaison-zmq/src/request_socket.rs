//! Short-lived REQ socket for one-shot control requests.
//!
//! Used to deliver CANCEL to a blocked responder or rendezvous, and by
//! subscribers to talk to a publisher rendezvous. A REQ socket that missed
//! its reply cannot send again, so a timed out request destroys the socket
//! and the next request recreates it.

use crate::socket::{new_socket, recv_frames, send_frames, transport_error, wait_readable};
use bytes::Bytes;
use liaison_core::envelope::{Ack, Envelope};
use liaison_core::message::Frames;
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::Cancel;
use liaison_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Reply deadline of the control requests sent by cancel handles.
pub const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RequestSocket {
    ctx: zmq::Context,
    endpoint: String,
    /// Routing identity of the target, for ROUTER peers.
    identity: Option<Bytes>,
    options: ProtocolOptions,
    socket: Option<zmq::Socket>,
}

impl RequestSocket {
    pub fn new(
        ctx: &zmq::Context,
        endpoint: impl Into<String>,
        identity: Option<Bytes>,
        options: &ProtocolOptions,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            endpoint: endpoint.into(),
            identity,
            options: options.clone(),
            socket: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn socket(&mut self) -> Result<&zmq::Socket> {
        if self.socket.is_none() {
            let socket = new_socket(&self.ctx, zmq::REQ, &self.options)?;
            socket.connect(&self.endpoint).map_err(transport_error)?;
            trace!("request socket connected to {}", self.endpoint);
            self.socket = Some(socket);
        }
        self.socket
            .as_ref()
            .ok_or(liaison_core::LiaisonError::NotInitialized)
    }

    /// Send `envelope` and wait for the reply frame.
    ///
    /// Returns `None` when no reply arrived within `timeout`; `None` as the
    /// timeout waits forever.
    pub fn request(&mut self, envelope: &Envelope, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let frames = match &self.identity {
            Some(identity) => Frames::new().push(identity.clone()).push_empty(),
            None => Frames::new(),
        }
        .push_envelope(envelope)
        .into_frames();

        let socket = self.socket()?;
        send_frames(socket, &frames)?;

        let timeout_ms = timeout.map_or(-1, |t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
        if !wait_readable(socket, timeout_ms)? {
            debug!("no reply from {} within {:?}", self.endpoint, timeout);
            self.reset();
            return Ok(None);
        }

        let reply = recv_frames(socket, 0)?;
        Ok(reply.and_then(|mut frames| frames.pop()))
    }

    /// Send `envelope` and decode the acknowledgement.
    pub fn request_ack(&mut self, envelope: &Envelope, timeout: Option<Duration>) -> Result<Option<Ack>> {
        match self.request(envelope, timeout)? {
            Some(reply) => Ok(Some(Ack::decode(&reply)?)),
            None => Ok(None),
        }
    }

    /// Destroy the socket; the next request recreates it.
    pub fn reset(&mut self) {
        self.socket = None;
    }
}

/// Deliver one CANCEL and wait briefly for its acknowledgement.
pub fn send_cancel(
    ctx: &zmq::Context,
    endpoint: &str,
    identity: Option<Bytes>,
    options: &ProtocolOptions,
) -> Result<()> {
    let mut socket = RequestSocket::new(ctx, endpoint, identity, options);
    match socket.request_ack(&Envelope::cancel(), Some(CONTROL_REPLY_TIMEOUT))? {
        Some(ack) if ack.is_ok() => trace!("cancel acknowledged by {}", endpoint),
        Some(ack) => debug!("cancel refused by {}: {}", endpoint, ack.message),
        None => debug!("cancel not acknowledged by {}", endpoint),
    }
    Ok(())
}

/// Cancel handle that wakes a blocked receive by sending it CANCEL.
///
/// The target endpoint is published by the transport once bound and
/// withdrawn when the receiving socket goes away.
pub struct RemoteCancel {
    ctx: zmq::Context,
    target: Arc<Mutex<Option<String>>>,
    identity: Option<Bytes>,
    flags: Arc<SessionFlags>,
    options: ProtocolOptions,
}

impl RemoteCancel {
    pub fn new(
        ctx: &zmq::Context,
        target: Arc<Mutex<Option<String>>>,
        identity: Option<Bytes>,
        flags: Arc<SessionFlags>,
        options: &ProtocolOptions,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            target,
            identity,
            flags,
            options: options.clone(),
        }
    }
}

impl Cancel for RemoteCancel {
    fn cancel(&self) -> Result<()> {
        if self.flags.set_canceled() {
            return Ok(());
        }
        let target = self.target.lock().clone();
        match target {
            Some(endpoint) => send_cancel(&self.ctx, &endpoint, self.identity.clone(), &self.options),
            None => Ok(()),
        }
    }
}
