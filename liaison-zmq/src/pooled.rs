//! Worker behind a [`ZmqRelay`](crate::relay::ZmqRelay).
//!
//! A ROUTER connected to the relay's internal DEALER. Requests arrive with
//! a five-frame addressing header `[relay, peer, "", identity, ""]`, the
//! relay's own routing frame in front of the direct responder header.
//!
//! The same socket binds a private `inproc://` endpoint for local cancel.
//! A plain REQ without identity frame produces `[peer, "", CANCEL]` there,
//! so any message too short to carry the relay header is addressed by all
//! of its frames but the last.

use crate::context::ZmqContext;
use crate::request_socket::RemoteCancel;
use crate::responder::{dispatch, send_ack, send_response, Dispatch};
use crate::socket::{new_socket, recv_frames, transport_error, unique_inproc};
use liaison_core::envelope::Ack;
use liaison_core::message::RoutingHeader;
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::{CancelHandle, IncomingRequest, ResponderTransport};
use liaison_core::{LiaisonError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Frames of the addressing header of a relayed message.
const POOLED_HEADER: usize = 5;

pub struct ZmqPooledResponder {
    ctx: ZmqContext,
    relay_endpoint: String,
    cancel_endpoint: String,
    options: ProtocolOptions,
    socket: Option<zmq::Socket>,
    pending: Option<RoutingHeader>,
    cancel_target: Arc<Mutex<Option<String>>>,
    flags: Arc<SessionFlags>,
}

impl ZmqPooledResponder {
    pub fn new(ctx: &ZmqContext, relay_endpoint: impl Into<String>) -> Self {
        Self {
            ctx: ctx.clone(),
            relay_endpoint: relay_endpoint.into(),
            cancel_endpoint: unique_inproc("worker"),
            options: ctx.options().clone(),
            socket: None,
            pending: None,
            cancel_target: Arc::new(Mutex::new(None)),
            flags: Arc::new(SessionFlags::new()),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn relay_endpoint(&self) -> &str {
        &self.relay_endpoint
    }
}

impl ResponderTransport for ZmqPooledResponder {
    /// Returns 0: a worker owns no leased port.
    fn init(&mut self) -> Result<u16> {
        let socket = new_socket(self.ctx.zmq(), zmq::ROUTER, &self.options)?;
        socket
            .bind(&self.cancel_endpoint)
            .map_err(transport_error)?;
        socket
            .connect(&self.relay_endpoint)
            .map_err(transport_error)?;
        self.socket = Some(socket);
        *self.cancel_target.lock() = Some(self.cancel_endpoint.clone());
        debug!("[WORKER {}] connected to {}", self.cancel_endpoint, self.relay_endpoint);
        Ok(0)
    }

    fn receive(&mut self) -> Result<Option<IncomingRequest>> {
        let socket = self.socket.as_ref().ok_or(LiaisonError::NotInitialized)?;
        if self.pending.take().is_some() {
            warn!("[WORKER {}] previous request left without reply", self.cancel_endpoint);
        }

        loop {
            let Some(frames) = recv_frames(socket, 0)? else {
                self.flags.set_ended();
                return Ok(None);
            };
            if frames.len() < 2 {
                warn!("[WORKER {}] dropped message of {} frames", self.cancel_endpoint, frames.len());
                continue;
            }
            let header_len = if frames.len() > POOLED_HEADER {
                POOLED_HEADER
            } else {
                frames.len() - 1
            };
            let header: RoutingHeader = frames[..header_len].iter().cloned().collect();

            match dispatch("WORKER", &frames, header_len) {
                Ok(Dispatch::Request(request)) => {
                    trace!(
                        "[WORKER {}] request from {}:{}",
                        self.cancel_endpoint,
                        request.requester.id,
                        request.requester.name
                    );
                    self.pending = Some(header);
                    return Ok(Some(request));
                }
                Ok(Dispatch::Canceled) => {
                    self.flags.set_canceled();
                    send_ack(socket, &header, &Ack::ok())?;
                    debug!("[WORKER {}] canceled", self.cancel_endpoint);
                    return Ok(None);
                }
                Ok(Dispatch::Continue(ack)) => send_ack(socket, &header, &ack)?,
                Err(e) => {
                    warn!("[WORKER {}] malformed request: {}", self.cancel_endpoint, e);
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
        send_response(socket, &header, parts)
    }

    fn canceler(&self) -> CancelHandle {
        Arc::new(RemoteCancel::new(
            self.ctx.zmq(),
            Arc::clone(&self.cancel_target),
            None,
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
        debug!("[WORKER {}] terminated", self.cancel_endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ZmqRelay;
    use crate::requester::ZmqRequester;
    use bytes::Bytes;
    use liaison_core::endpoint::Endpoint;
    use liaison_core::identity::{AppIdentity, Identity};
    use liaison_core::services::{AppContext, Services};
    use liaison_core::transport::{RelayTransport, RequesterTransport};
    use std::thread;
    use std::time::Duration;

    fn context() -> ZmqContext {
        let base = portpicker::pick_unused_port().expect("free port");
        let app = AppIdentity::new("pool-app", 6, Endpoint::tcp("127.0.0.1", 0).unwrap());
        let options = ProtocolOptions::new().with_polling_interval(Duration::from_millis(10));
        ZmqContext::new(
            AppContext::new(app, Services::local(base..=base.saturating_add(200))).with_options(options),
        )
    }

    #[test]
    fn test_request_through_relay() {
        let ctx = context();
        let mut relay = ZmqRelay::new(&ctx, "pool").unwrap();
        let port = relay.init().unwrap();
        let mut worker = ZmqPooledResponder::new(&ctx, relay.internal_endpoint());
        worker.init().unwrap();
        let relay_cancel = relay.canceler();
        let relaying = thread::spawn(move || relay.run().unwrap());

        let client_ctx = ctx.clone();
        let client = thread::spawn(move || {
            let mut requester = ZmqRequester::new(
                &client_ctx,
                Identity::new(6, "pool").unwrap(),
                client_ctx.local_endpoint(port),
            );
            assert!(requester.init().unwrap());
            requester.send(&[&b"job"[..]]).unwrap();
            requester.receive().unwrap()
        });

        // The handshake SYNC is answered inside receive.
        let request = worker.receive().unwrap().unwrap();
        assert_eq!(request.requester.name, "pool-app");
        assert_eq!(&request.part1[..], b"job");
        assert_eq!(request.part2, None);
        worker.reply(&[&b"done"[..], &b"!"[..]]).unwrap();

        assert_eq!(
            client.join().unwrap(),
            Some(vec![Bytes::from_static(b"done"), Bytes::from_static(b"!")])
        );
        relay_cancel.cancel().unwrap();
        relaying.join().unwrap();
        worker.terminate();
    }

    #[test]
    fn test_local_cancel() {
        let ctx = context();
        let mut worker = ZmqPooledResponder::new(&ctx, unique_inproc("absent"));
        worker.init().unwrap();
        let canceler = worker.canceler();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceler.cancel().unwrap();
        });
        assert!(worker.receive().unwrap().is_none());
        assert!(worker.flags().is_canceled());
        handle.join().unwrap();
        worker.terminate();
    }
}
