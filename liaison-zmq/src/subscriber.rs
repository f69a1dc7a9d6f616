//! Receiving side of the streaming protocol.
//!
//! One SUB socket multiplexes three subscriptions so that a single poll loop
//! sees whichever comes first:
//!
//! ```text
//! <identity>  [identity, envelope, data...]   publisher stream
//! "cancel"    ["cancel", "cancel"]            private inproc PUB, local cancel
//! "status"    ["status", StatusEvent]         supervisor, peer termination
//! ```

use crate::context::ZmqContext;
use crate::request_socket::RequestSocket;
use crate::socket::{new_socket, recv_frames, send_frames, transport_error, unique_inproc, wait_readable};
use bytes::Bytes;
use liaison_core::envelope::{Envelope, MessageType, StatusEvent};
use liaison_core::identity::Identity;
use liaison_core::options::ProtocolOptions;
use liaison_core::session::SessionFlags;
use liaison_core::transport::{Cancel, CancelHandle, SubscriberTransport};
use liaison_core::{LiaisonError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Topic of the private cancel publisher.
pub const CANCEL_TOPIC: &str = "cancel";
/// Topic of supervisor status events.
pub const STATUS_TOPIC: &str = "status";

/// What one received message means to the subscriber.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Data(Vec<Bytes>),
    SyncStream,
    End,
    Cancel,
    PeerTerminated,
    Ignore,
}

pub struct ZmqSubscriber {
    ctx: ZmqContext,
    publisher: Identity,
    topic: Bytes,
    publisher_endpoint: String,
    synchronizer_endpoint: Option<String>,
    status_endpoint: Option<String>,
    options: ProtocolOptions,
    subscriber: Option<zmq::Socket>,
    cancel_endpoint: String,
    cancel_publisher: Arc<Mutex<Option<zmq::Socket>>>,
    flags: Arc<SessionFlags>,
}

impl ZmqSubscriber {
    pub fn new(ctx: &ZmqContext, publisher: Identity, publisher_endpoint: impl Into<String>) -> Self {
        let topic = Bytes::from(publisher.to_bytes());
        Self {
            ctx: ctx.clone(),
            publisher,
            topic,
            publisher_endpoint: publisher_endpoint.into(),
            synchronizer_endpoint: None,
            status_endpoint: None,
            options: ctx.options().clone(),
            subscriber: None,
            cancel_endpoint: unique_inproc("liaison-cancel"),
            cancel_publisher: Arc::new(Mutex::new(None)),
            flags: Arc::new(SessionFlags::new()),
        }
    }

    /// Run the rendezvous against the publisher's synchronizer at `init`.
    #[must_use]
    pub fn with_rendezvous(mut self, endpoint: impl Into<String>) -> Self {
        self.synchronizer_endpoint = Some(endpoint.into());
        self
    }

    /// Follow the status events of the publishing application.
    #[must_use]
    pub fn with_status(mut self, endpoint: impl Into<String>) -> Self {
        self.status_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn publisher(&self) -> &Identity {
        &self.publisher
    }

    fn classify(&self, frames: &[Bytes]) -> Result<Event> {
        let (Some(topic), Some(body)) = (frames.first(), frames.get(1)) else {
            return Ok(Event::Ignore);
        };

        if *topic == self.topic {
            let envelope = Envelope::decode(body)?;
            return Ok(match envelope.kind() {
                MessageType::Stream => Event::Data(frames[2..].to_vec()),
                MessageType::SyncStream => Event::SyncStream,
                MessageType::StreamEnd => Event::End,
                other => {
                    warn!("[SUB {}] unexpected broadcast {}", self.publisher, other);
                    Event::Ignore
                }
            });
        }

        if topic[..] == *CANCEL_TOPIC.as_bytes() {
            return Ok(Event::Cancel);
        }

        if topic[..] == *STATUS_TOPIC.as_bytes() {
            return Ok(match StatusEvent::decode(body) {
                Ok(event) if event.id == self.publisher.owner_id() && event.state().is_terminal() => {
                    debug!(
                        "[SUB {}] publishing application is {}",
                        self.publisher,
                        event.state()
                    );
                    Event::PeerTerminated
                }
                Ok(_) => Event::Ignore,
                Err(e) => {
                    warn!("[SUB {}] bad status event: {}", self.publisher, e);
                    Event::Ignore
                }
            });
        }

        Ok(Event::Ignore)
    }

    /// Probe the synchronizer with SYNC until our SUB connection sees the
    /// SYNC_STREAM broadcast, then register with SUBSCRIBE.
    fn rendezvous(&self, subscriber: &zmq::Socket, endpoint: &str) -> Result<bool> {
        let mut requester = RequestSocket::new(self.ctx.zmq(), endpoint, None, &self.options);
        let step = self.options.sync_timeout_step;

        'probe: loop {
            if self.flags.is_canceled() {
                return Ok(false);
            }
            if requester.request(&Envelope::sync(), Some(step))?.is_none() {
                trace!("[SUB {}] no rendezvous reply yet", self.publisher);
            }
            if !wait_readable(subscriber, self.options.polling_millis())? {
                continue;
            }
            while let Some(frames) = recv_frames(subscriber, zmq::DONTWAIT)? {
                match self.classify(&frames)? {
                    Event::SyncStream => break 'probe,
                    Event::Cancel => {
                        self.flags.set_canceled();
                        return Ok(false);
                    }
                    Event::End => {
                        self.flags.set_ended();
                        return Ok(false);
                    }
                    Event::PeerTerminated => return Ok(false),
                    Event::Data(_) | Event::Ignore => {}
                }
            }
        }

        match requester.request_ack(&Envelope::subscribe(), self.options.timeout)? {
            Some(ack) if ack.is_ok() => {
                debug!("[SUB {}] subscribed", self.publisher);
                Ok(true)
            }
            Some(ack) => Err(LiaisonError::protocol(format!(
                "SUBSCRIBE refused by {}: {}",
                endpoint, ack.message
            ))),
            None => {
                self.flags.set_timed_out();
                Ok(false)
            }
        }
    }
}

impl SubscriberTransport for ZmqSubscriber {
    fn init(&mut self) -> Result<bool> {
        let subscriber = new_socket(self.ctx.zmq(), zmq::SUB, &self.options)?;
        subscriber
            .connect(&self.publisher_endpoint)
            .map_err(transport_error)?;
        subscriber.set_subscribe(&self.topic).map_err(transport_error)?;

        let cancel_publisher = new_socket(self.ctx.zmq(), zmq::PUB, &self.options)?;
        cancel_publisher
            .bind(&self.cancel_endpoint)
            .map_err(transport_error)?;
        subscriber
            .connect(&self.cancel_endpoint)
            .map_err(transport_error)?;
        subscriber
            .set_subscribe(CANCEL_TOPIC.as_bytes())
            .map_err(transport_error)?;
        *self.cancel_publisher.lock() = Some(cancel_publisher);

        if self.options.check_app {
            if let Some(endpoint) = &self.status_endpoint {
                subscriber.connect(endpoint).map_err(transport_error)?;
                subscriber
                    .set_subscribe(STATUS_TOPIC.as_bytes())
                    .map_err(transport_error)?;
            }
        }
        debug!(
            "[SUB {}] connected to {}",
            self.publisher, self.publisher_endpoint
        );

        let ready = match &self.synchronizer_endpoint {
            Some(endpoint) => self.rendezvous(&subscriber, endpoint)?,
            None => !self.flags.is_canceled(),
        };
        self.subscriber = Some(subscriber);
        Ok(ready)
    }

    fn receive(&mut self) -> Result<Option<Vec<Bytes>>> {
        let subscriber = self.subscriber.as_ref().ok_or(LiaisonError::NotInitialized)?;
        // Ignored traffic must not shorten the deadline.
        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let wait_ms = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        self.flags.set_timed_out();
                        debug!("[SUB {}] receive timed out", self.publisher);
                        return Ok(None);
                    }
                    self.options
                        .polling_millis()
                        .min(i64::try_from(left.as_millis()).unwrap_or(i64::MAX))
                        .max(1)
                }
                None => self.options.polling_millis(),
            };
            if !wait_readable(subscriber, wait_ms)? {
                continue;
            }
            let Some(frames) = recv_frames(subscriber, zmq::DONTWAIT)? else {
                continue;
            };
            match self.classify(&frames)? {
                Event::Data(parts) => return Ok(Some(parts)),
                Event::SyncStream | Event::Ignore => {}
                Event::End => {
                    self.flags.set_ended();
                    debug!("[SUB {}] end of stream", self.publisher);
                    return Ok(None);
                }
                Event::Cancel => {
                    self.flags.set_canceled();
                    return Ok(None);
                }
                Event::PeerTerminated => return Ok(None),
            }
        }
    }

    fn canceler(&self) -> CancelHandle {
        Arc::new(SubscriberCancel {
            publisher: Arc::clone(&self.cancel_publisher),
            flags: Arc::clone(&self.flags),
        })
    }

    fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    fn terminate(&mut self) {
        self.subscriber = None;
        self.cancel_publisher.lock().take();
        debug!("[SUB {}] terminated", self.publisher);
    }
}

/// Publishes `["cancel", "cancel"]` on the subscriber's private endpoint.
struct SubscriberCancel {
    publisher: Arc<Mutex<Option<zmq::Socket>>>,
    flags: Arc<SessionFlags>,
}

impl Cancel for SubscriberCancel {
    fn cancel(&self) -> Result<()> {
        if self.flags.set_canceled() {
            return Ok(());
        }
        let publisher = self.publisher.lock();
        if let Some(socket) = publisher.as_ref() {
            let topic = Bytes::from_static(CANCEL_TOPIC.as_bytes());
            send_frames(socket, &[topic.clone(), topic])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::endpoint::Endpoint;
    use liaison_core::identity::AppIdentity;
    use liaison_core::services::{AppContext, Services};
    use liaison_core::state::ApplicationState;
    use std::thread;
    use std::time::Duration;

    fn context(options: ProtocolOptions) -> ZmqContext {
        let app = AppIdentity::new("sub-app", 2, Endpoint::tcp("127.0.0.1", 0).unwrap());
        ZmqContext::new(AppContext::new(app, Services::local(20000..=20010)).with_options(options))
    }

    fn stream(identity: &Identity, kind: MessageType, parts: &[&[u8]]) -> Vec<Bytes> {
        let mut frames = vec![
            Bytes::from(identity.to_bytes()),
            Envelope::new(kind).encode(),
        ];
        frames.extend(parts.iter().map(|p| Bytes::copy_from_slice(p)));
        frames
    }

    fn status(id: i32, state: ApplicationState) -> Vec<Bytes> {
        vec![
            Bytes::from_static(STATUS_TOPIC.as_bytes()),
            StatusEvent::new(id, state).encode(),
        ]
    }

    struct Fixture {
        publisher: zmq::Socket,
        supervisor: zmq::Socket,
        subscriber: ZmqSubscriber,
    }

    /// Raw PUB sockets standing in for the publisher and the supervisor.
    fn connected(options: ProtocolOptions) -> Fixture {
        let ctx = context(options);
        let publisher_endpoint = unique_inproc("pub");
        let publisher = new_socket(ctx.zmq(), zmq::PUB, ctx.options()).unwrap();
        publisher.bind(&publisher_endpoint).unwrap();
        let status_endpoint = unique_inproc("status");
        let supervisor = new_socket(ctx.zmq(), zmq::PUB, ctx.options()).unwrap();
        supervisor.bind(&status_endpoint).unwrap();

        let identity = Identity::new(7, "positions").unwrap();
        let mut subscriber =
            ZmqSubscriber::new(&ctx, identity, publisher_endpoint).with_status(status_endpoint);
        assert!(subscriber.init().unwrap());
        // Let the subscriptions reach the publishers.
        thread::sleep(Duration::from_millis(100));
        Fixture {
            publisher,
            supervisor,
            subscriber,
        }
    }

    #[test]
    fn test_stream_then_end() {
        let Fixture {
            publisher,
            mut subscriber,
            ..
        } = connected(ProtocolOptions::default());
        let identity = subscriber.publisher().clone();

        send_frames(&publisher, &stream(&identity, MessageType::SyncStream, &[])).unwrap();
        send_frames(
            &publisher,
            &stream(&identity, MessageType::Stream, &[&b"a"[..], &b""[..]]),
        )
        .unwrap();
        send_frames(&publisher, &stream(&identity, MessageType::StreamEnd, &[])).unwrap();

        let parts = subscriber.receive().unwrap().unwrap();
        assert_eq!(parts, vec![Bytes::from_static(b"a"), Bytes::new()]);
        assert!(!subscriber.flags().has_ended());

        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(subscriber.flags().has_ended());
        assert!(!subscriber.flags().is_canceled());
    }

    #[test]
    fn test_status_of_tracked_application() {
        let Fixture {
            publisher,
            supervisor,
            mut subscriber,
        } = connected(ProtocolOptions::default());
        let identity = subscriber.publisher().clone();

        send_frames(&supervisor, &status(8, ApplicationState::Killed)).unwrap();
        send_frames(&supervisor, &status(7, ApplicationState::Running)).unwrap();
        send_frames(&publisher, &stream(&identity, MessageType::Stream, &[&b"x"[..]])).unwrap();
        assert_eq!(
            subscriber.receive().unwrap(),
            Some(vec![Bytes::from_static(b"x")])
        );

        send_frames(&supervisor, &status(7, ApplicationState::Killed)).unwrap();
        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(!subscriber.flags().has_ended());
        assert!(!subscriber.flags().is_canceled());
    }

    #[test]
    fn test_cancel_wakes_receive() {
        let Fixture { mut subscriber, .. } = connected(ProtocolOptions::default());
        let canceler = subscriber.canceler();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceler.cancel().unwrap();
            canceler.cancel().unwrap();
        });
        assert_eq!(subscriber.receive().unwrap(), None);
        handle.join().unwrap();

        assert!(subscriber.flags().is_canceled());
        assert!(!subscriber.flags().has_ended());
    }

    #[test]
    fn test_receive_timeout() {
        let options = ProtocolOptions::default()
            .with_timeout(Duration::from_millis(50))
            .with_polling_interval(Duration::from_millis(10));
        let Fixture { mut subscriber, .. } = connected(options);

        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(subscriber.flags().has_timed_out());
        assert!(!subscriber.flags().has_ended());
    }

    #[test]
    fn test_ignored_traffic_keeps_the_deadline() {
        let options = ProtocolOptions::default()
            .with_timeout(Duration::from_millis(1000))
            .with_polling_interval(Duration::from_millis(200));
        let Fixture {
            publisher,
            supervisor,
            mut subscriber,
        } = connected(options);
        let identity = subscriber.publisher().clone();

        // More ignored messages than there are polling intervals in the timeout.
        for _ in 0..10 {
            send_frames(&supervisor, &status(99, ApplicationState::Running)).unwrap();
        }
        send_frames(&publisher, &stream(&identity, MessageType::SyncStream, &[])).unwrap();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            send_frames(&publisher, &stream(&identity, MessageType::Stream, &[&b"late"[..]]))
                .unwrap();
            publisher
        });

        let started = Instant::now();
        assert_eq!(
            subscriber.receive().unwrap(),
            Some(vec![Bytes::from_static(b"late")])
        );
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(!subscriber.flags().has_timed_out());
        assert!(!subscriber.flags().has_ended());
        drop(sender.join().unwrap());
    }
}
