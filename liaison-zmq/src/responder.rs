//! Serving side of the direct request/response protocol.
//!
//! A ROUTER bound on a leased port. Every message starts with a four-frame
//! addressing header `[peer, "", identity, ""]`; replies and acks re-emit
//! it so the ROUTER routes them back to the requesting peer.

use crate::context::ZmqContext;
use crate::request_socket::RemoteCancel;
use crate::socket::{bind_leased, new_socket, recv_frames, send_frames, transport_error};
use bytes::Bytes;
use liaison_core::envelope::{Ack, Envelope, EnvelopeError, MessageType, RequesterInfo};
use liaison_core::message::{Frames, RoutingHeader};
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::{CancelHandle, IncomingRequest, ResponderTransport};
use liaison_core::{LiaisonError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames of the addressing header in front of the envelope.
pub(crate) const DIRECT_HEADER: usize = 4;

/// What the receive loop does with one decoded control message.
pub(crate) enum Dispatch {
    Request(IncomingRequest),
    /// Acknowledge and return nothing to the caller.
    Canceled,
    /// Acknowledge and keep waiting.
    Continue(Ack),
}

/// Classify the envelope at `frames[header_len]`.
///
/// Malformed envelopes are returned as errors after the caller acked them.
pub(crate) fn dispatch(
    tag: &str,
    frames: &[Bytes],
    header_len: usize,
) -> std::result::Result<Dispatch, EnvelopeError> {
    let envelope = match Envelope::decode(&frames[header_len]) {
        Ok(envelope) => envelope,
        Err(EnvelopeError::UnknownType(code)) => {
            warn!("[{}] unknown message type {}", tag, code);
            return Ok(Dispatch::Continue(Ack::unknown_request()));
        }
        Err(e) => return Err(e),
    };
    match envelope.kind() {
        MessageType::Request => {
            let requester = RequesterInfo::from_envelope(&envelope)?;
            let part1 = frames.get(header_len + 1).cloned().unwrap_or_default();
            let part2 = frames.get(header_len + 2).cloned();
            Ok(Dispatch::Request(IncomingRequest {
                requester,
                part1,
                part2,
            }))
        }
        MessageType::Cancel => Ok(Dispatch::Canceled),
        MessageType::Sync => Ok(Dispatch::Continue(Ack::ok())),
        other => {
            warn!("[{}] unexpected {} message", tag, other);
            Ok(Dispatch::Continue(Ack::unknown_request()))
        }
    }
}

/// Send `ack` back along `header`.
pub(crate) fn send_ack(socket: &zmq::Socket, header: &RoutingHeader, ack: &Ack) -> Result<()> {
    send_frames(socket, &Frames::routed(header).push_ack(ack).into_frames())
}

/// Send a RESPONSE carrying `parts` back along `header`.
pub(crate) fn send_response(
    socket: &zmq::Socket,
    header: &RoutingHeader,
    parts: &[&[u8]],
) -> Result<()> {
    let frames = Frames::routed(header)
        .push_envelope(&Envelope::response())
        .push_parts(parts)
        .into_frames();
    send_frames(socket, &frames)
}

pub struct ZmqResponder {
    ctx: ZmqContext,
    identity: String,
    options: ProtocolOptions,
    socket: Option<zmq::Socket>,
    port: u16,
    /// Header of the request awaiting its reply.
    pending: Option<RoutingHeader>,
    cancel_target: Arc<Mutex<Option<String>>>,
    flags: Arc<SessionFlags>,
}

impl ZmqResponder {
    /// # Errors
    ///
    /// Fails when `name` is not a valid identity name.
    pub fn new(ctx: &ZmqContext, name: &str) -> Result<Self> {
        let identity = ctx.identity_of(name)?.to_string();
        Ok(Self {
            ctx: ctx.clone(),
            identity,
            options: ctx.options().clone(),
            socket: None,
            port: 0,
            pending: None,
            cancel_target: Arc::new(Mutex::new(None)),
            flags: Arc::new(SessionFlags::new()),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ResponderTransport for ZmqResponder {
    fn init(&mut self) -> Result<u16> {
        let socket = new_socket(self.ctx.zmq(), zmq::ROUTER, &self.options)?;
        socket
            .set_identity(self.identity.as_bytes())
            .map_err(transport_error)?;
        let port = bind_leased(&socket, &self.ctx, &self.identity, &self.options)?;
        self.port = port;
        self.socket = Some(socket);
        *self.cancel_target.lock() = Some(self.ctx.local_endpoint(port));
        debug!("[REP {}] serving on port {}", self.identity, port);
        Ok(port)
    }

    fn receive(&mut self) -> Result<Option<IncomingRequest>> {
        let socket = self.socket.as_ref().ok_or(LiaisonError::NotInitialized)?;
        if self.pending.take().is_some() {
            warn!("[REP {}] previous request left without reply", self.identity);
        }

        loop {
            let Some(frames) = recv_frames(socket, 0)? else {
                self.flags.set_ended();
                debug!("[REP {}] socket closed", self.identity);
                return Ok(None);
            };
            if frames.len() <= DIRECT_HEADER {
                warn!("[REP {}] dropped message of {} frames", self.identity, frames.len());
                continue;
            }
            let header: RoutingHeader = frames[..DIRECT_HEADER].iter().cloned().collect();

            match dispatch(&format!("REP {}", self.identity), &frames, DIRECT_HEADER) {
                Ok(Dispatch::Request(request)) => {
                    trace!(
                        "[REP {}] request from {}:{}",
                        self.identity,
                        request.requester.id,
                        request.requester.name
                    );
                    self.pending = Some(header);
                    return Ok(Some(request));
                }
                Ok(Dispatch::Canceled) => {
                    self.flags.set_canceled();
                    send_ack(socket, &header, &Ack::ok())?;
                    debug!("[REP {}] canceled", self.identity);
                    return Ok(None);
                }
                Ok(Dispatch::Continue(ack)) => send_ack(socket, &header, &ack)?,
                Err(e) => {
                    warn!("[REP {}] malformed request: {}", self.identity, e);
                    send_ack(socket, &header, &Ack::error(e.to_string()))?;
                    return Err(e.into());
                }
            }
        }
    }

    fn reply(&mut self, parts: &[&[u8]]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(LiaisonError::NotInitialized)?;
        let header = self
            .pending
            .take()
            .ok_or_else(|| LiaisonError::protocol("no request awaiting a reply"))?;
        send_response(socket, &header, parts)?;
        trace!("[REP {}] replied with {} parts", self.identity, parts.len());
        Ok(())
    }

    fn canceler(&self) -> CancelHandle {
        Arc::new(RemoteCancel::new(
            self.ctx.zmq(),
            Arc::clone(&self.cancel_target),
            Some(Bytes::from(self.identity.clone())),
            Arc::clone(&self.flags),
            &self.options,
        ))
    }

    fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    fn terminate(&mut self) {
        self.cancel_target.lock().take();
        self.pending = None;
        self.socket = None;
        if self.port != 0 {
            self.ctx.ports().release_port(std::mem::take(&mut self.port));
        }
        debug!("[REP {}] terminated", self.identity);
    }
}
