//! Frame relay between external requesters and pooled responders.
//!
//! ```text
//! Requesters -> ROUTER (leased port) <-> DEALER (inproc) -> pooled responders
//! ```
//!
//! The relay never looks inside a message. Each multipart message is moved
//! as a unit, so frames of one request or reply are never interleaved with
//! another. The ROUTER prepends the peer routing frame on the way in and
//! consumes it on the way out, which is what lets a worker's reply find its
//! way back to the original requester.

use crate::context::ZmqContext;
use crate::socket::{bind_leased, new_socket, recv_frames, send_frames, transport_error, unique_inproc};
use bytes::Bytes;
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::null::FlagCancel;
use liaison_core::transport::{CancelHandle, RelayTransport};
use liaison_core::{LiaisonError, Result};
use std::sync::Arc;
use tracing::{debug, trace};

/// One side of the relay.
pub trait RelaySocket {
    /// Take the next pending message without blocking.
    ///
    /// Returns `None` when nothing is pending.
    fn recv_multipart(&mut self) -> Result<Option<Vec<Bytes>>>;

    /// Send a multipart message as one unit.
    fn send_multipart(&mut self, msg: Vec<Bytes>) -> Result<()>;

    /// Get a description of the socket for logging.
    fn socket_desc(&self) -> &'static str;
}

/// Move every pending message from `from` to `to`, frames untouched.
///
/// Returns the number of messages moved.
pub fn forward<F, T>(from: &mut F, to: &mut T) -> Result<usize>
where
    F: RelaySocket + ?Sized,
    T: RelaySocket + ?Sized,
{
    let mut moved = 0;
    while let Some(msg) = from.recv_multipart()? {
        trace!(
            "[RELAY] {} -> {}: {} frames",
            from.socket_desc(),
            to.socket_desc(),
            msg.len()
        );
        to.send_multipart(msg)?;
        moved += 1;
    }
    Ok(moved)
}

struct RelayEnd {
    socket: zmq::Socket,
    desc: &'static str,
}

impl RelaySocket for RelayEnd {
    fn recv_multipart(&mut self) -> Result<Option<Vec<Bytes>>> {
        recv_frames(&self.socket, zmq::DONTWAIT)
    }

    fn send_multipart(&mut self, msg: Vec<Bytes>) -> Result<()> {
        send_frames(&self.socket, &msg)
    }

    fn socket_desc(&self) -> &'static str {
        self.desc
    }
}

pub struct ZmqRelay {
    ctx: ZmqContext,
    identity: String,
    options: ProtocolOptions,
    internal_endpoint: String,
    frontend: Option<RelayEnd>,
    backend: Option<RelayEnd>,
    port: u16,
    flags: Arc<SessionFlags>,
}

impl ZmqRelay {
    /// # Errors
    ///
    /// Fails when `name` is not a valid identity name.
    pub fn new(ctx: &ZmqContext, name: &str) -> Result<Self> {
        let identity = ctx.identity_of(name)?.to_string();
        Ok(Self {
            ctx: ctx.clone(),
            identity,
            options: ctx.options().clone(),
            internal_endpoint: unique_inproc("relay"),
            frontend: None,
            backend: None,
            port: 0,
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

impl RelayTransport for ZmqRelay {
    fn init(&mut self) -> Result<u16> {
        let backend = new_socket(self.ctx.zmq(), zmq::DEALER, &self.options)?;
        backend
            .bind(&self.internal_endpoint)
            .map_err(transport_error)?;

        let frontend = new_socket(self.ctx.zmq(), zmq::ROUTER, &self.options)?;
        frontend
            .set_identity(self.identity.as_bytes())
            .map_err(transport_error)?;
        let port = bind_leased(&frontend, &self.ctx, &self.identity, &self.options)?;

        self.port = port;
        self.frontend = Some(RelayEnd {
            socket: frontend,
            desc: "ROUTER",
        });
        self.backend = Some(RelayEnd {
            socket: backend,
            desc: "DEALER",
        });
        debug!(
            "[RELAY {}] port {} relays to {}",
            self.identity, port, self.internal_endpoint
        );
        Ok(port)
    }

    fn run(&mut self) -> Result<()> {
        let (Some(frontend), Some(backend)) = (self.frontend.as_mut(), self.backend.as_mut()) else {
            return Err(LiaisonError::NotInitialized);
        };
        debug!("[RELAY {}] running", self.identity);

        while !self.flags.is_canceled() {
            let (inbound, outbound) = {
                let mut items = [
                    frontend.socket.as_poll_item(zmq::POLLIN),
                    backend.socket.as_poll_item(zmq::POLLIN),
                ];
                match zmq::poll(&mut items, self.options.polling_millis()) {
                    Ok(_) => {}
                    Err(zmq::Error::ETERM) => {
                        self.flags.set_ended();
                        break;
                    }
                    Err(e) => return Err(transport_error(e)),
                }
                (items[0].is_readable(), items[1].is_readable())
            };

            if inbound {
                forward(frontend, backend)?;
            }
            if outbound {
                forward(backend, frontend)?;
            }
        }

        debug!("[RELAY {}] stopped", self.identity);
        Ok(())
    }

    fn internal_endpoint(&self) -> &str {
        &self.internal_endpoint
    }

    fn canceler(&self) -> CancelHandle {
        Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
    }

    fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    fn terminate(&mut self) {
        self.frontend = None;
        self.backend = None;
        if self.port != 0 {
            self.ctx.ports().release_port(std::mem::take(&mut self.port));
        }
        debug!("[RELAY {}] terminated", self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::endpoint::Endpoint;
    use liaison_core::identity::AppIdentity;
    use liaison_core::services::{AppContext, Services};
    use std::collections::VecDeque;
    use std::thread;
    use std::time::Duration;

    /// Mock socket for testing relay logic
    struct MockSocket {
        name: &'static str,
        recv_queue: VecDeque<Vec<Bytes>>,
        send_queue: Vec<Vec<Bytes>>,
    }

    impl MockSocket {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                recv_queue: VecDeque::new(),
                send_queue: Vec::new(),
            }
        }

        fn enqueue(&mut self, msg: Vec<Bytes>) {
            self.recv_queue.push_back(msg);
        }
    }

    impl RelaySocket for MockSocket {
        fn recv_multipart(&mut self) -> Result<Option<Vec<Bytes>>> {
            Ok(self.recv_queue.pop_front())
        }

        fn send_multipart(&mut self, msg: Vec<Bytes>) -> Result<()> {
            self.send_queue.push(msg);
            Ok(())
        }

        fn socket_desc(&self) -> &'static str {
            self.name
        }
    }

    #[test]
    fn test_forward_preserves_messages() {
        let mut front = MockSocket::new("front");
        let mut back = MockSocket::new("back");
        let first = vec![Bytes::from_static(b"peer"), Bytes::new(), Bytes::from_static(b"\x00\x01")];
        let second = vec![Bytes::new()];
        front.enqueue(first.clone());
        front.enqueue(second.clone());

        assert_eq!(forward(&mut front, &mut back).unwrap(), 2);
        assert_eq!(back.send_queue, vec![first, second]);
        assert!(front.recv_queue.is_empty());
        assert_eq!(forward(&mut back, &mut front).unwrap(), 0);
    }

    fn context() -> ZmqContext {
        let base = portpicker::pick_unused_port().expect("free port");
        let app = AppIdentity::new("relay-app", 5, Endpoint::tcp("127.0.0.1", 0).unwrap());
        ZmqContext::new(AppContext::new(app, Services::local(base..=base.saturating_add(200))))
    }

    #[test]
    fn test_relay_round_trip_is_byte_exact() {
        let ctx = context();
        let mut relay = ZmqRelay::new(&ctx, "pool")
            .unwrap()
            .with_options(ProtocolOptions::new().with_polling_interval(Duration::from_millis(10)));
        let port = relay.init().unwrap();
        let internal = relay.internal_endpoint().to_string();
        let canceler = relay.canceler();
        let running = thread::spawn(move || {
            relay.run().unwrap();
            relay.terminate();
        });

        let options = ProtocolOptions::default();
        let worker = new_socket(ctx.zmq(), zmq::ROUTER, &options).unwrap();
        worker.connect(&internal).unwrap();
        let client = new_socket(ctx.zmq(), zmq::DEALER, &options).unwrap();
        client.connect(&ctx.local_endpoint(port)).unwrap();

        let request = vec![
            Bytes::new(),
            Bytes::from_static(b"5:pool"),
            Bytes::new(),
            Bytes::from_static(b"\xff\x00binary"),
            Bytes::new(),
        ];
        send_frames(&client, &request).unwrap();

        // [relay dealer, client peer] prepended by the two ROUTERs.
        let seen = recv_frames(&worker, 0).unwrap().unwrap();
        assert_eq!(seen.len(), request.len() + 2);
        assert_eq!(&seen[2..], &request[..]);

        let mut reply = seen[..2].to_vec();
        reply.extend([Bytes::new(), Bytes::from_static(b"answer"), Bytes::new()]);
        send_frames(&worker, &reply).unwrap();

        let back = recv_frames(&client, 0).unwrap().unwrap();
        assert_eq!(back, vec![Bytes::new(), Bytes::from_static(b"answer"), Bytes::new()]);

        canceler.cancel().unwrap();
        running.join().unwrap();
    }

    #[test]
    fn test_run_before_init() {
        let ctx = context();
        let mut relay = ZmqRelay::new(&ctx, "pool").unwrap();
        assert!(matches!(relay.run(), Err(LiaisonError::NotInitialized)));
    }
}
