//! Broadcast side of the streaming protocol.
//!
//! ```text
//! PUB  [identity, {"type":34}, data(, data2)]    STREAM
//!      [identity, {"type":2}]                    SYNC_STREAM (rendezvous liveness)
//!      [identity, {"type":35}]                   STREAM_END
//! REP  SYNC / SUBSCRIBE / CANCEL  ->  {"value":0,"message":"OK"}
//! ```
//!
//! When subscribers are expected, a REP rendezvous socket counts their
//! SUBSCRIBE requests before the application starts streaming. Slow-joining
//! subscribers probe it with SYNC until they see the SYNC_STREAM broadcast,
//! which proves their SUB connection is established.

use crate::context::ZmqContext;
use crate::request_socket::RemoteCancel;
use crate::socket::{bind_leased, new_socket, recv_frames, send_frames};
use bytes::Bytes;
use liaison_core::envelope::{Ack, Envelope, MessageType};
use liaison_core::message::Frames;
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::{CancelHandle, PublisherPorts, PublisherTransport};
use liaison_core::{LiaisonError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct ZmqPublisher {
    ctx: ZmqContext,
    identity: String,
    expected_subscribers: i32,
    options: ProtocolOptions,
    publisher: Option<zmq::Socket>,
    synchronizer: Option<zmq::Socket>,
    ports: PublisherPorts,
    /// Outcome of the rendezvous once it ran.
    rendezvous: Option<bool>,
    cancel_target: Arc<Mutex<Option<String>>>,
    flags: Arc<SessionFlags>,
}

impl ZmqPublisher {
    /// # Errors
    ///
    /// Fails when `name` is not a valid identity name.
    pub fn new(ctx: &ZmqContext, name: &str, expected_subscribers: i32) -> Result<Self> {
        let identity = ctx.identity_of(name)?.to_string();
        Ok(Self {
            ctx: ctx.clone(),
            identity,
            expected_subscribers,
            options: ctx.options().clone(),
            publisher: None,
            synchronizer: None,
            ports: PublisherPorts::default(),
            rendezvous: None,
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

    pub fn ports(&self) -> PublisherPorts {
        self.ports
    }

    fn broadcast(&self, kind: MessageType, parts: &[&[u8]]) -> Result<()> {
        let socket = self.publisher.as_ref().ok_or(LiaisonError::NotInitialized)?;
        let frames = Frames::with_capacity(2 + parts.len())
            .push_str(&self.identity)
            .push_envelope(&Envelope::new(kind))
            .push_parts(parts)
            .into_frames();
        send_frames(socket, &frames)
    }

    /// Answer one rendezvous request. Returns the acknowledgement to send.
    fn process_rendezvous(
        &self,
        frames: &[Bytes],
        counter: &mut i32,
        canceled: &mut bool,
    ) -> Result<Ack> {
        let Some(frame) = frames.last() else {
            return Ok(Ack::unknown_request());
        };
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[PUB {}] bad rendezvous request: {}", self.identity, e);
                return Ok(Ack::error(e.to_string()));
            }
        };
        let ack = match envelope.kind() {
            MessageType::Sync => {
                self.broadcast(MessageType::SyncStream, &[])?;
                Ack::ok()
            }
            MessageType::Subscribe => {
                *counter += 1;
                debug!(
                    "[PUB {}] subscriber {}/{} registered",
                    self.identity, counter, self.expected_subscribers
                );
                Ack::ok()
            }
            MessageType::Cancel => {
                *canceled = true;
                *counter = self.expected_subscribers;
                self.flags.set_canceled();
                debug!("[PUB {}] wait for subscribers canceled", self.identity);
                Ack::ok()
            }
            other => {
                warn!("[PUB {}] unexpected rendezvous request {}", self.identity, other);
                Ack::unknown_request()
            }
        };
        Ok(ack)
    }

    fn release_ports(&mut self) {
        let ports = std::mem::take(&mut self.ports);
        for port in [ports.publisher_port, ports.synchronizer_port] {
            if port != 0 {
                self.ctx.ports().release_port(port);
            }
        }
    }
}

impl PublisherTransport for ZmqPublisher {
    fn init(&mut self) -> Result<PublisherPorts> {
        let publisher = new_socket(self.ctx.zmq(), zmq::PUB, &self.options)?;
        let publisher_port = bind_leased(&publisher, &self.ctx, &self.identity, &self.options)?;
        self.ports.publisher_port = publisher_port;
        self.publisher = Some(publisher);
        debug!("[PUB {}] broadcasting on port {}", self.identity, publisher_port);

        if self.expected_subscribers > 0 {
            let rendezvous = new_socket(self.ctx.zmq(), zmq::REP, &self.options)
                .and_then(|socket| {
                    bind_leased(&socket, &self.ctx, &self.identity, &self.options)
                        .map(|port| (socket, port))
                });
            let (synchronizer, port) = match rendezvous {
                Ok(bound) => bound,
                Err(e) => {
                    self.publisher = None;
                    self.release_ports();
                    return Err(e);
                }
            };
            self.ports.synchronizer_port = port;
            self.synchronizer = Some(synchronizer);
            *self.cancel_target.lock() = Some(self.ctx.local_endpoint(port));
            debug!(
                "[PUB {}] rendezvous on port {} for {} subscribers",
                self.identity, port, self.expected_subscribers
            );
        }
        Ok(self.ports)
    }

    fn wait_for_subscribers(&mut self) -> Result<bool> {
        if self.expected_subscribers <= 0 {
            return Ok(true);
        }
        if let Some(done) = self.rendezvous {
            return Ok(done);
        }
        let synchronizer = self.synchronizer.take().ok_or(LiaisonError::NotInitialized)?;

        let mut counter = 0;
        let mut canceled = false;
        while counter < self.expected_subscribers {
            let Some(frames) = recv_frames(&synchronizer, 0)? else {
                break;
            };
            let ack = self.process_rendezvous(&frames, &mut counter, &mut canceled)?;
            send_frames(&synchronizer, &[ack.encode()])?;
        }

        // The rendezvous socket is not needed anymore.
        self.cancel_target.lock().take();
        drop(synchronizer);

        let done = !canceled && counter >= self.expected_subscribers;
        self.rendezvous = Some(done);
        Ok(done)
    }

    fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        self.broadcast(MessageType::Stream, parts)?;
        trace!("[PUB {}] sent {} data frames", self.identity, parts.len());
        Ok(())
    }

    fn send_end(&mut self) -> Result<()> {
        if self.publisher.is_none() {
            return Err(LiaisonError::NotInitialized);
        }
        if self.flags.set_ended() {
            return Ok(());
        }
        self.broadcast(MessageType::StreamEnd, &[])?;
        debug!("[PUB {}] end of stream", self.identity);
        Ok(())
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
        if self.publisher.is_some() && !self.flags.has_ended() {
            if let Err(e) = self.send_end() {
                warn!("[PUB {}] cannot send end of stream: {}", self.identity, e);
            }
        }
        self.cancel_target.lock().take();
        self.synchronizer = None;
        self.publisher = None;
        self.release_ports();
        debug!("[PUB {}] terminated", self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::endpoint::Endpoint;
    use liaison_core::identity::AppIdentity;
    use liaison_core::services::{AppContext, Services};

    fn context() -> ZmqContext {
        let base = portpicker::pick_unused_port().expect("free port");
        let app = AppIdentity::new("pub-app", 1, Endpoint::tcp("127.0.0.1", 0).unwrap());
        ZmqContext::new(AppContext::new(app, Services::local(base..=base.saturating_add(200))))
    }

    #[test]
    fn test_no_rendezvous_without_subscribers() {
        let ctx = context();
        let mut publisher = ZmqPublisher::new(&ctx, "positions", 0).unwrap();
        let ports = publisher.init().unwrap();
        assert_ne!(ports.publisher_port, 0);
        assert_eq!(ports.synchronizer_port, 0);
        assert!(publisher.wait_for_subscribers().unwrap());
        publisher.terminate();
        assert!(publisher.flags().has_ended());
    }

    #[test]
    fn test_send_before_init() {
        let ctx = context();
        let mut publisher = ZmqPublisher::new(&ctx, "positions", 0).unwrap();
        assert!(matches!(
            publisher.send(&[&b"x"[..]]),
            Err(LiaisonError::NotInitialized)
        ));
        assert!(matches!(publisher.send_end(), Err(LiaisonError::NotInitialized)));
        assert!(!publisher.flags().has_ended());
    }

    #[test]
    fn test_cancel_before_wait() {
        let ctx = context();
        let mut publisher = ZmqPublisher::new(&ctx, "positions", 2).unwrap();
        let ports = publisher.init().unwrap();
        assert_ne!(ports.synchronizer_port, 0);

        // A CANCEL sent before the wait starts stays queued on the rendezvous.
        let canceler = publisher.canceler();
        let handle = std::thread::spawn(move || canceler.cancel().unwrap());
        assert!(!publisher.wait_for_subscribers().unwrap());
        handle.join().unwrap();
        assert!(publisher.flags().is_canceled());
        publisher.terminate();
    }
}
