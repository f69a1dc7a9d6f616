//! Requester side of the direct request/response protocol.

use bytes::Bytes;
use liaison_core::transport::{CancelHandle, RequesterTransport};
use liaison_core::Result;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "zmq")]
use liaison_core::identity::{Identity, PeerApp};
#[cfg(feature = "zmq")]
use liaison_core::services::{load_record, responder_key, ResponderRecord};
#[cfg(feature = "zmq")]
use liaison_zmq::{ZmqContext, ZmqRequester};

/// Sends requests to a responder of another application.
///
/// The responder may still be starting when the requester connects:
/// [`init`](Self::init) retries a readiness handshake with a growing wait
/// until the responder answers or the requester is canceled.
///
/// ## Example
///
/// ```rust,no_run
/// # #[cfg(feature = "zmq")]
/// # fn example(ctx: &liaison::ZmqContext, peer: &liaison::PeerApp) -> liaison::Result<()> {
/// use liaison::Requester;
/// use std::time::Duration;
///
/// let mut requester = Requester::create(ctx, peer, "echo")?;
/// requester.set_timeout(Some(Duration::from_secs(1)));
/// requester.send_string("ping")?;
/// match requester.receive_string()? {
///     Some(reply) => println!("{}", reply),
///     None if requester.has_timed_out() => println!("no answer"),
///     None => println!("canceled"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Requester {
    responder_name: String,
    inner: Box<dyn RequesterTransport>,
    terminated: bool,
}

impl Requester {
    /// Look up the responder `responder_name` of `peer` without connecting.
    ///
    /// # Errors
    ///
    /// [`LiaisonError::Registry`](crate::LiaisonError::Registry) with
    /// `UndefinedKey` when no such responder is registered.
    #[cfg(feature = "zmq")]
    pub fn new(ctx: &ZmqContext, peer: &PeerApp, responder_name: &str) -> Result<Self> {
        let record: ResponderRecord = load_record(ctx.registry(), &responder_key(responder_name))?;
        let identity = Identity::new(peer.id, responder_name)?;
        let transport =
            ZmqRequester::new(ctx, identity, peer.endpoint.with_port(record.port).to_string());
        Ok(Self::with_transport(responder_name, Box::new(transport)))
    }

    /// [`new`](Self::new) followed by [`init`](Self::init).
    ///
    /// The handshake has no deadline; cancel it from another thread through
    /// a handle obtained with [`new`](Self::new) and [`canceler`](Self::canceler).
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, peer: &PeerApp, responder_name: &str) -> Result<Self> {
        let mut requester = Self::new(ctx, peer, responder_name)?;
        requester.init()?;
        Ok(requester)
    }

    pub fn with_transport(responder_name: &str, transport: Box<dyn RequesterTransport>) -> Self {
        Self {
            responder_name: responder_name.to_string(),
            inner: transport,
            terminated: false,
        }
    }

    pub fn responder_name(&self) -> &str {
        &self.responder_name
    }

    /// Run the readiness handshake. Returns `false` when canceled.
    pub fn init(&mut self) -> Result<bool> {
        let ready = self.inner.init()?;
        debug!("[REQ {}] ready: {}", self.responder_name, ready);
        Ok(ready)
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.inner.send(&[data])
    }

    pub fn send_two_parts(&mut self, data1: &[u8], data2: &[u8]) -> Result<()> {
        self.inner.send(&[data1, data2])
    }

    pub fn send_string(&mut self, data: &str) -> Result<()> {
        self.send(data.as_bytes())
    }

    /// Wait for the response. `None` on timeout, cancellation or a reply
    /// that is not a response.
    pub fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self
            .inner
            .receive()?
            .map(|parts| parts.into_iter().next().unwrap_or_default()))
    }

    /// Response sent with `reply_two_parts`.
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

    /// `None` or a zero duration waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }

    pub fn set_polling_interval(&mut self, interval: Duration) {
        self.inner.set_polling_interval(interval);
    }

    pub fn has_timed_out(&self) -> bool {
        self.inner.flags().has_timed_out()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flags().is_canceled()
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
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("responder_name", &self.responder_name)
            .finish_non_exhaustive()
    }
}
