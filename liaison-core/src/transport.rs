//! Transport strategy traits.
//!
//! Each protocol role is one trait with an `init`, send/receive operations,
//! a cancel handle and `terminate`. The socket-backed variants live in
//! `liaison-zmq`; the [`null`] variants here do nothing and are used where
//! a protocol object must exist without a network behind it.
//!
//! Protocol objects are driven by a single thread. The only cross-thread
//! entry point is the [`CancelHandle`] returned by `canceler()`, which wakes
//! a blocked receive by delivering it a message or by setting a flag the
//! receive loop polls.

use crate::envelope::RequesterInfo;
use crate::error::Result;
use crate::session::SessionFlags;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation of a blocked protocol object.
///
/// Implementations are idempotent: once the target is canceled, further
/// calls produce no message traffic and no error.
pub trait Cancel: Send + Sync {
    fn cancel(&self) -> Result<()>;
}

/// Cloneable cancel handle, safe to move to another thread.
pub type CancelHandle = Arc<dyn Cancel>;

/// Ports bound by a publisher transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublisherPorts {
    pub publisher_port: u16,
    /// Rendezvous port, 0 when no subscriber is expected.
    pub synchronizer_port: u16,
}

/// A decoded REQUEST, handed to the application until it replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub requester: RequesterInfo,
    pub part1: Bytes,
    pub part2: Option<Bytes>,
}

/// Broadcast side of the streaming protocol.
pub trait PublisherTransport: Send {
    /// Bind the broadcast socket, and the rendezvous socket when subscribers
    /// are expected.
    fn init(&mut self) -> Result<PublisherPorts>;

    /// Block until the expected subscribers registered.
    ///
    /// Returns `false` when the wait was canceled instead.
    fn wait_for_subscribers(&mut self) -> Result<bool>;

    /// Broadcast one `STREAM` message carrying `parts` as data frames.
    fn send(&mut self, parts: &[&[u8]]) -> Result<()>;

    /// Broadcast `STREAM_END` once; later calls do nothing.
    fn send_end(&mut self) -> Result<()>;

    /// Cancels a pending [`wait_for_subscribers`](Self::wait_for_subscribers).
    fn canceler(&self) -> CancelHandle;

    fn flags(&self) -> &SessionFlags;

    /// Ends the stream if needed, then releases sockets and ports.
    fn terminate(&mut self);
}

/// Receiving side of the streaming protocol.
pub trait SubscriberTransport: Send {
    /// Connect, and run the rendezvous when the publisher expects it.
    ///
    /// Returns `false` when canceled before the rendezvous completed.
    fn init(&mut self) -> Result<bool>;

    /// Data frames of the next `STREAM` message.
    ///
    /// `None` when the stream ended, the subscriber was canceled, the
    /// publishing application terminated, or the receive timed out; the
    /// flags tell which.
    fn receive(&mut self) -> Result<Option<Vec<Bytes>>>;

    fn canceler(&self) -> CancelHandle;

    fn flags(&self) -> &SessionFlags;

    fn terminate(&mut self);
}

/// Calling side of the RPC protocol.
pub trait RequesterTransport: Send {
    /// Run the readiness handshake.
    ///
    /// Returns `false` when canceled before the responder answered.
    fn init(&mut self) -> Result<bool>;

    /// Send one REQUEST carrying `parts`.
    fn send(&mut self, parts: &[&[u8]]) -> Result<()>;

    /// Data frames of the RESPONSE, or `None` on cancel or timeout.
    fn receive(&mut self) -> Result<Option<Vec<Bytes>>>;

    /// `None` waits forever.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn set_polling_interval(&mut self, interval: Duration);

    fn canceler(&self) -> CancelHandle;

    fn flags(&self) -> &SessionFlags;

    fn terminate(&mut self);
}

/// Serving side of the RPC protocol.
///
/// Strictly one request in flight: every `Some` returned by
/// [`receive`](Self::receive) must be answered with [`reply`](Self::reply)
/// before the next receive.
pub trait ResponderTransport: Send {
    /// Bind or connect; returns the bound port, 0 when nothing was bound.
    fn init(&mut self) -> Result<u16>;

    /// Next REQUEST, or `None` once canceled or the transport closed.
    fn receive(&mut self) -> Result<Option<IncomingRequest>>;

    /// Answer the pending request with a RESPONSE carrying `parts`.
    fn reply(&mut self, parts: &[&[u8]]) -> Result<()>;

    fn canceler(&self) -> CancelHandle;

    fn flags(&self) -> &SessionFlags;

    fn terminate(&mut self);
}

/// Frame relay between one external address and in-process workers.
pub trait RelayTransport: Send {
    /// Bind both sides; returns the external port.
    fn init(&mut self) -> Result<u16>;

    /// Forward messages in both directions until canceled.
    fn run(&mut self) -> Result<()>;

    /// Address workers connect to.
    fn internal_endpoint(&self) -> &str;

    fn canceler(&self) -> CancelHandle;

    fn flags(&self) -> &SessionFlags;

    fn terminate(&mut self);
}

/// Transports that never touch a network.
///
/// Sends are discarded and receives report an ended stream. Cancellation
/// only sets the flag.
pub mod null {
    use super::*;

    /// Cancel handle that only sets the canceled flag.
    #[derive(Debug, Clone, Default)]
    pub struct FlagCancel {
        flags: Arc<SessionFlags>,
    }

    impl FlagCancel {
        pub fn new(flags: Arc<SessionFlags>) -> Self {
            Self { flags }
        }
    }

    impl Cancel for FlagCancel {
        fn cancel(&self) -> Result<()> {
            self.flags.set_canceled();
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct NullPublisher {
        flags: Arc<SessionFlags>,
    }

    impl PublisherTransport for NullPublisher {
        fn init(&mut self) -> Result<PublisherPorts> {
            Ok(PublisherPorts::default())
        }

        fn wait_for_subscribers(&mut self) -> Result<bool> {
            Ok(!self.flags.is_canceled())
        }

        fn send(&mut self, _parts: &[&[u8]]) -> Result<()> {
            Ok(())
        }

        fn send_end(&mut self) -> Result<()> {
            self.flags.set_ended();
            Ok(())
        }

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {
            self.flags.set_ended();
        }
    }

    #[derive(Debug, Default)]
    pub struct NullSubscriber {
        flags: Arc<SessionFlags>,
    }

    impl SubscriberTransport for NullSubscriber {
        fn init(&mut self) -> Result<bool> {
            Ok(!self.flags.is_canceled())
        }

        fn receive(&mut self) -> Result<Option<Vec<Bytes>>> {
            if !self.flags.is_canceled() {
                self.flags.set_ended();
            }
            Ok(None)
        }

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {}
    }

    #[derive(Debug, Default)]
    pub struct NullRequester {
        flags: Arc<SessionFlags>,
    }

    impl RequesterTransport for NullRequester {
        fn init(&mut self) -> Result<bool> {
            Ok(!self.flags.is_canceled())
        }

        fn send(&mut self, _parts: &[&[u8]]) -> Result<()> {
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<Vec<Bytes>>> {
            Ok(None)
        }

        fn set_timeout(&mut self, _timeout: Option<Duration>) {}

        fn set_polling_interval(&mut self, _interval: Duration) {}

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {}
    }

    #[derive(Debug, Default)]
    pub struct NullResponder {
        flags: Arc<SessionFlags>,
    }

    impl ResponderTransport for NullResponder {
        fn init(&mut self) -> Result<u16> {
            Ok(0)
        }

        fn receive(&mut self) -> Result<Option<IncomingRequest>> {
            if !self.flags.is_canceled() {
                self.flags.set_ended();
            }
            Ok(None)
        }

        fn reply(&mut self, _parts: &[&[u8]]) -> Result<()> {
            Ok(())
        }

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {}
    }

    #[derive(Debug, Default)]
    pub struct NullRelay {
        flags: Arc<SessionFlags>,
    }

    impl RelayTransport for NullRelay {
        fn init(&mut self) -> Result<u16> {
            Ok(0)
        }

        fn run(&mut self) -> Result<()> {
            Ok(())
        }

        fn internal_endpoint(&self) -> &str {
            ""
        }

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::null::*;
    use super::*;
    use std::thread;

    #[test]
    fn test_null_subscriber_reports_end() {
        let mut subscriber = NullSubscriber::default();
        assert!(subscriber.init().unwrap());
        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(subscriber.flags().has_ended());
        assert!(!subscriber.flags().is_canceled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let mut responder = NullResponder::default();
        let canceler = responder.canceler();
        thread::spawn(move || {
            canceler.cancel().unwrap();
            canceler.cancel().unwrap();
        })
        .join()
        .unwrap();

        assert!(responder.flags().is_canceled());
        assert_eq!(responder.receive().unwrap(), None);
        assert!(!responder.flags().has_ended());
    }

    #[test]
    fn test_null_publisher_wait() {
        let mut publisher = NullPublisher::default();
        publisher.init().unwrap();
        assert!(publisher.wait_for_subscribers().unwrap());
        publisher.canceler().cancel().unwrap();
        assert!(!publisher.wait_for_subscribers().unwrap());
        publisher.send_end().unwrap();
        assert!(publisher.flags().has_ended());
    }

    #[test]
    fn test_transports_are_object_safe() {
        let transports: Vec<Box<dyn RequesterTransport>> = vec![Box::new(NullRequester::default())];
        for mut transport in transports {
            assert!(transport.init().unwrap());
            transport.send(&[&b"ping"[..]]).unwrap();
            assert_eq!(transport.receive().unwrap(), None);
        }
    }
}
