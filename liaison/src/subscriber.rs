//! Subscriber side of a registered publisher.

use bytes::Bytes;
use liaison_core::transport::{CancelHandle, SubscriberTransport};
use liaison_core::Result;
use tracing::debug;

#[cfg(feature = "zmq")]
use liaison_core::identity::{Identity, PeerApp};
#[cfg(feature = "zmq")]
use liaison_core::services::{load_record, publisher_key, PublisherRecord};
#[cfg(feature = "zmq")]
use liaison_zmq::{ZmqContext, ZmqSubscriber};

/// Receives the stream of a publisher owned by another application.
///
/// [`receive`](Self::receive) returns `None` once the stream is over. Tell
/// apart why with [`has_ended`](Self::has_ended),
/// [`is_canceled`](Self::is_canceled) and
/// [`has_timed_out`](Self::has_timed_out). When none of them is set, the
/// supervisor reported the publishing application terminated.
///
/// ## Example
///
/// ```rust,no_run
/// # #[cfg(feature = "zmq")]
/// # fn example(ctx: &liaison::ZmqContext, peer: &liaison::PeerApp) -> liaison::Result<()> {
/// use liaison::Subscriber;
///
/// let mut subscriber = Subscriber::create(ctx, peer, "positions")?;
/// while let Some(position) = subscriber.receive_string()? {
///     println!("{}", position);
/// }
/// assert!(subscriber.has_ended() || subscriber.is_canceled());
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    publisher_name: String,
    inner: Box<dyn SubscriberTransport>,
    terminated: bool,
}

impl Subscriber {
    /// Look up the publisher `publisher_name` of `peer` without connecting.
    ///
    /// Call [`init`](Self::init) before receiving, after handing out a
    /// [`canceler`](Self::canceler) if the rendezvous may need interrupting.
    ///
    /// # Errors
    ///
    /// [`LiaisonError::Registry`](crate::LiaisonError::Registry) with
    /// `UndefinedKey` when no such publisher is registered.
    #[cfg(feature = "zmq")]
    pub fn new(ctx: &ZmqContext, peer: &PeerApp, publisher_name: &str) -> Result<Self> {
        let record: PublisherRecord = load_record(ctx.registry(), &publisher_key(publisher_name))?;
        let identity = Identity::new(peer.id, publisher_name)?;

        let mut transport = ZmqSubscriber::new(
            ctx,
            identity,
            peer.endpoint.with_port(record.publisher_port).to_string(),
        );
        if record.n_subscribers > 0 {
            transport = transport
                .with_rendezvous(peer.endpoint.with_port(record.synchronizer_port).to_string());
        }
        if let Some(status) = &peer.status_endpoint {
            transport = transport.with_status(status.to_string());
        }
        Ok(Self::with_transport(publisher_name, Box::new(transport)))
    }

    /// [`new`](Self::new) followed by [`init`](Self::init).
    ///
    /// A subscriber whose rendezvous was canceled or timed out is still
    /// returned; check [`is_canceled`](Self::is_canceled) and
    /// [`has_timed_out`](Self::has_timed_out).
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, peer: &PeerApp, publisher_name: &str) -> Result<Self> {
        let mut subscriber = Self::new(ctx, peer, publisher_name)?;
        subscriber.init()?;
        Ok(subscriber)
    }

    pub fn with_transport(publisher_name: &str, transport: Box<dyn SubscriberTransport>) -> Self {
        Self {
            publisher_name: publisher_name.to_string(),
            inner: transport,
            terminated: false,
        }
    }

    pub fn publisher_name(&self) -> &str {
        &self.publisher_name
    }

    /// Connect, and register with the publisher when it expects subscribers.
    ///
    /// Returns `false` when the registration was canceled or timed out.
    pub fn init(&mut self) -> Result<bool> {
        let ready = self.inner.init()?;
        debug!("[SUB {}] initialized: {}", self.publisher_name, ready);
        Ok(ready)
    }

    /// Next data message of the stream, first part only.
    pub fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self
            .inner
            .receive()?
            .map(|parts| parts.into_iter().next().unwrap_or_default()))
    }

    /// Next data message sent with `send_two_parts`.
    ///
    /// A message with a single part yields an empty second part.
    pub fn receive_two_parts(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.inner.receive()?.map(|parts| {
            let mut parts = parts.into_iter();
            let first = parts.next().unwrap_or_default();
            let second = parts.next().unwrap_or_default();
            (first, second)
        }))
    }

    pub fn receive_string(&mut self) -> Result<Option<String>> {
        Ok(self.receive()?.map(|data| crate::to_string(&data)))
    }

    pub fn has_ended(&self) -> bool {
        self.inner.flags().has_ended()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flags().is_canceled()
    }

    pub fn has_timed_out(&self) -> bool {
        self.inner.flags().has_timed_out()
    }

    pub fn cancel(&self) -> Result<()> {
        self.inner.canceler().cancel()
    }

    pub fn canceler(&self) -> CancelHandle {
        self.inner.canceler()
    }

    pub fn terminate(&mut self) {
        if std::mem::replace(&mut self.terminated, true) {
            return;
        }
        self.inner.terminate();
        debug!("[SUB {}] terminated", self.publisher_name);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("publisher_name", &self.publisher_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::session::SessionFlags;
    use liaison_core::transport::null::{FlagCancel, NullSubscriber};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays queued messages, then reports the end of stream.
    #[derive(Default)]
    struct Replay {
        messages: VecDeque<Vec<Bytes>>,
        flags: Arc<SessionFlags>,
    }

    impl SubscriberTransport for Replay {
        fn init(&mut self) -> Result<bool> {
            Ok(true)
        }

        fn receive(&mut self) -> Result<Option<Vec<Bytes>>> {
            let next = self.messages.pop_front();
            if next.is_none() {
                self.flags.set_ended();
            }
            Ok(next)
        }

        fn canceler(&self) -> CancelHandle {
            Arc::new(FlagCancel::new(Arc::clone(&self.flags)))
        }

        fn flags(&self) -> &SessionFlags {
            &self.flags
        }

        fn terminate(&mut self) {}
    }

    #[test]
    fn test_receive_variants() {
        let replay = Replay {
            messages: VecDeque::from(vec![
                vec![Bytes::from_static(b"one")],
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                vec![Bytes::from_static(b"single")],
            ]),
            ..Replay::default()
        };
        let mut subscriber = Subscriber::with_transport("positions", Box::new(replay));
        assert!(subscriber.init().unwrap());

        assert_eq!(subscriber.receive_string().unwrap().as_deref(), Some("one"));
        assert_eq!(
            subscriber.receive_two_parts().unwrap(),
            Some((Bytes::from_static(b"a"), Bytes::from_static(b"b")))
        );
        assert_eq!(
            subscriber.receive_two_parts().unwrap(),
            Some((Bytes::from_static(b"single"), Bytes::new()))
        );
        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(subscriber.has_ended());
        assert!(!subscriber.is_canceled());
    }

    #[test]
    fn test_cancel_is_not_end() {
        let mut subscriber =
            Subscriber::with_transport("positions", Box::new(NullSubscriber::default()));
        subscriber.cancel().unwrap();
        subscriber.cancel().unwrap();
        assert_eq!(subscriber.receive().unwrap(), None);
        assert!(subscriber.is_canceled());
        assert!(!subscriber.has_ended());
    }
}
