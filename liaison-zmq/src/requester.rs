//! Caller side of the direct request/response protocol.
//!
//! ```text
//! DEALER -> ["", responder identity, "", envelope, part1(, part2)]
//! DEALER <- ["", responder identity, "", {"type":22}, data(, data2)]
//! ```
//!
//! The responder may bind after the requester connected, so `init` runs a
//! readiness handshake: SYNC is sent until some reply arrives, recreating
//! the socket and growing the wait by one step after every miss.

use crate::context::ZmqContext;
use crate::socket::{new_socket, recv_frames, send_frames, transport_error};
use bytes::Bytes;
use liaison_core::envelope::{Envelope, MessageType};
use liaison_core::identity::Identity;
use liaison_core::message::Frames;
use liaison_core::options::{poll_iterations, ProtocolOptions};
use liaison_core::session::SessionFlags;
use liaison_core::transport::null::FlagCancel;
use liaison_core::transport::{CancelHandle, RequesterTransport};
use liaison_core::{LiaisonError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Index of the envelope frame in a reply.
const REPLY_ENVELOPE: usize = 3;

/// Outcome of a polled wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Ready,
    Canceled,
    TimedOut,
}

pub struct ZmqRequester {
    ctx: ZmqContext,
    responder: Identity,
    endpoint: String,
    options: ProtocolOptions,
    socket: Option<zmq::Socket>,
    flags: Arc<SessionFlags>,
}

impl ZmqRequester {
    pub fn new(ctx: &ZmqContext, responder: Identity, endpoint: impl Into<String>) -> Self {
        Self {
            ctx: ctx.clone(),
            responder,
            endpoint: endpoint.into(),
            options: ctx.options().clone(),
            socket: None,
            flags: Arc::new(SessionFlags::new()),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn responder(&self) -> &Identity {
        &self.responder
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) -> Result<zmq::Socket> {
        let socket = new_socket(self.ctx.zmq(), zmq::DEALER, &self.options)?;
        socket.connect(&self.endpoint).map_err(transport_error)?;
        Ok(socket)
    }

    fn frames(&self, envelope: &Envelope, parts: &[&[u8]]) -> Vec<Bytes> {
        Frames::with_capacity(4 + parts.len())
            .push_empty()
            .push(self.responder.to_bytes())
            .push_empty()
            .push_envelope(envelope)
            .push_parts(parts)
            .into_frames()
    }

    /// Poll `socket` in polling-interval slices until a message is pending,
    /// the requester is canceled or `timeout` elapsed.
    fn wait(&self, socket: &zmq::Socket, timeout: Option<Duration>) -> Result<Wait> {
        let iterations = poll_iterations(timeout, self.options.polling_interval);
        let mut i = 0;
        while iterations.map_or(true, |n| i < n) {
            if self.flags.is_canceled() {
                return Ok(Wait::Canceled);
            }
            let mut items = [socket.as_poll_item(zmq::POLLIN)];
            zmq::poll(&mut items, self.options.polling_millis()).map_err(transport_error)?;
            if items[0].is_readable() {
                return Ok(Wait::Ready);
            }
            i += 1;
        }
        Ok(Wait::TimedOut)
    }

    /// Send SYNC on fresh sockets until one gets a reply.
    ///
    /// `deadline` bounds the whole handshake; `None` retries until canceled.
    /// Returns `false` when canceled or out of time.
    fn handshake(&mut self, deadline: Option<Duration>) -> Result<bool> {
        let step = self.options.sync_timeout_step;
        let mut attempt_timeout = step;
        let mut spent = Duration::ZERO;
        let sync = self.frames(&Envelope::sync(), &[]);

        loop {
            let socket = self.connect()?;
            send_frames(&socket, &sync)?;
            match self.wait(&socket, Some(attempt_timeout))? {
                Wait::Ready => {
                    // Drain the acknowledgement.
                    recv_frames(&socket, 0)?;
                    debug!(
                        "[REQ {}] responder ready at {}",
                        self.responder, self.endpoint
                    );
                    self.socket = Some(socket);
                    return Ok(true);
                }
                Wait::Canceled => {
                    debug!("[REQ {}] handshake canceled", self.responder);
                    return Ok(false);
                }
                Wait::TimedOut => {
                    spent += attempt_timeout;
                    if deadline.is_some_and(|d| spent >= d) {
                        self.flags.set_timed_out();
                        debug!("[REQ {}] handshake timed out", self.responder);
                        return Ok(false);
                    }
                    attempt_timeout += step;
                    trace!(
                        "[REQ {}] no reply to SYNC, retrying with {:?}",
                        self.responder,
                        attempt_timeout
                    );
                }
            }
        }
    }
}

impl RequesterTransport for ZmqRequester {
    fn init(&mut self) -> Result<bool> {
        debug!("[REQ {}] connecting to {}", self.responder, self.endpoint);
        self.handshake(None)
    }

    fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        // A timed out socket was destroyed; resynchronize a new one first.
        if self.socket.is_none() && !self.handshake(self.options.timeout)? {
            return Ok(());
        }
        let envelope = Envelope::request(self.ctx.identity());
        let frames = self.frames(&envelope, parts);
        let socket = self.socket.as_ref().ok_or(LiaisonError::NotInitialized)?;
        send_frames(socket, &frames)?;
        trace!("[REQ {}] sent {} request parts", self.responder, parts.len());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<Bytes>>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        match self.wait(socket, self.options.timeout)? {
            Wait::Ready => {}
            Wait::Canceled => return Ok(None),
            Wait::TimedOut => {
                self.flags.set_timed_out();
                // A request socket that missed its reply cannot be reused.
                self.socket = None;
                debug!("[REQ {}] receive timed out", self.responder);
                return Ok(None);
            }
        }

        let Some(mut frames) = recv_frames(socket, 0)? else {
            return Ok(None);
        };
        if frames.len() <= REPLY_ENVELOPE {
            warn!("[REQ {}] truncated reply of {} frames", self.responder, frames.len());
            return Ok(None);
        }
        let envelope = Envelope::decode(&frames[REPLY_ENVELOPE])?;
        if envelope.kind() != MessageType::Response {
            debug!("[REQ {}] reply is {}, not a response", self.responder, envelope.kind());
            return Ok(None);
        }
        Ok(Some(frames.split_off(REPLY_ENVELOPE + 1)))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.options.timeout = timeout.filter(|t| !t.is_zero());
    }

    fn set_polling_interval(&mut self, interval: Duration) {
        self.options.polling_interval = interval;
    }

    fn canceler(&self) -> CancelHandle {
        Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
    }

    fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    fn terminate(&mut self) {
        self.socket = None;
        debug!("[REQ {}] terminated", self.responder);
    }
}
