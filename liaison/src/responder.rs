//! Responder side of the direct request/response protocol.

use bytes::Bytes;
use liaison_core::endpoint::Endpoint;
use liaison_core::envelope::RequesterInfo;
use liaison_core::identity::PeerApp;
use liaison_core::services::{responder_key, store_record, KeyValueRegistry, ResponderRecord};
use liaison_core::transport::{CancelHandle, IncomingRequest, ResponderTransport};
use liaison_core::Result;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "zmq")]
use liaison_zmq::{ZmqContext, ZmqResponder};

/// Serves requests under a registered name, one at a time.
///
/// Each [`receive`](Self::receive) hands out a [`Request`] that borrows the
/// responder until it is answered, so the next request can only be received
/// once the previous one was replied to or dropped.
///
/// The responder is registered as `"responder-<name>"` for its lifetime.
///
/// ## Example
///
/// ```rust,no_run
/// # #[cfg(feature = "zmq")]
/// # fn example(ctx: &liaison::ZmqContext) -> liaison::Result<()> {
/// use liaison::Responder;
///
/// let mut responder = Responder::create(ctx, "echo")?;
/// let canceler = responder.canceler();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     let _ = canceler.cancel();
/// });
///
/// while let Some(request) = responder.receive()? {
///     let data = request.get().clone();
///     request.reply(&data)?;
/// }
/// assert!(responder.is_canceled() || responder.has_ended());
/// # Ok(())
/// # }
/// ```
pub struct Responder {
    name: String,
    port: u16,
    registry: Arc<dyn KeyValueRegistry>,
    inner: Box<dyn ResponderTransport>,
    terminated: bool,
}

impl Responder {
    /// Bind a ZeroMQ responder and register it under `name`.
    ///
    /// # Errors
    ///
    /// - [`LiaisonError::Registry`](crate::LiaisonError::Registry) with
    ///   `KeyAlreadyExists` when another responder owns `name`
    /// - Port or transport errors when binding fails
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, name: &str) -> Result<Self> {
        let transport = ZmqResponder::new(ctx, name)?;
        Self::with_transport(
            name,
            Box::new(transport),
            Arc::clone(&ctx.app().services.registry),
        )
    }

    /// Initialize `transport` and register its port under `name`.
    pub fn with_transport(
        name: &str,
        mut transport: Box<dyn ResponderTransport>,
        registry: Arc<dyn KeyValueRegistry>,
    ) -> Result<Self> {
        let port = transport.init()?;
        if let Err(e) = store_record(registry.as_ref(), &responder_key(name), &ResponderRecord { port }) {
            debug!("[REP {}] registration failed: {}", name, e);
            transport.terminate();
            return Err(e.into());
        }
        debug!("[REP {}] registered on port {}", name, port);
        Ok(Self {
            name: name.to_string(),
            port,
            registry,
            inner: transport,
            terminated: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until a request arrives.
    ///
    /// Returns `None` when the responder was canceled or its socket closed.
    pub fn receive(&mut self) -> Result<Option<Request<'_>>> {
        Ok(self
            .inner
            .receive()?
            .map(|incoming| Request::new(&mut *self.inner, incoming)))
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flags().is_canceled()
    }

    pub fn has_ended(&self) -> bool {
        self.inner.flags().has_ended()
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
        if let Err(e) = self.registry.remove_key(&responder_key(&self.name)) {
            warn!("[REP {}] cannot deregister: {}", self.name, e);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// A request waiting for its reply.
///
/// Replying consumes the request. Dropping it unanswered leaves the
/// requester to its timeout.
pub struct Request<'a> {
    responder: &'a mut dyn ResponderTransport,
    incoming: IncomingRequest,
}

impl<'a> Request<'a> {
    pub(crate) fn new(responder: &'a mut dyn ResponderTransport, incoming: IncomingRequest) -> Self {
        Self {
            responder,
            incoming,
        }
    }

    /// Who sent the request.
    pub fn requester(&self) -> &RequesterInfo {
        &self.incoming.requester
    }

    pub fn requester_application_name(&self) -> &str {
        &self.incoming.requester.name
    }

    pub fn requester_application_id(&self) -> i32 {
        self.incoming.requester.id
    }

    pub fn requester_server_endpoint(&self) -> &Endpoint {
        &self.incoming.requester.server_endpoint
    }

    pub fn requester_proxy_port(&self) -> u16 {
        self.incoming.requester.proxy_port
    }

    /// The requesting application, to connect back to its own publishers
    /// or responders.
    pub fn requester_app(&self) -> PeerApp {
        PeerApp::new(
            self.incoming.requester.id,
            self.incoming.requester.server_endpoint.clone(),
        )
    }

    /// First part of the request.
    pub fn get(&self) -> &Bytes {
        &self.incoming.part1
    }

    pub fn get_string(&self) -> String {
        crate::to_string(&self.incoming.part1)
    }

    /// Both parts of a request sent with `send_two_parts`.
    pub fn get_two_parts(&self) -> (&Bytes, Option<&Bytes>) {
        (&self.incoming.part1, self.incoming.part2.as_ref())
    }

    pub fn reply(self, data: &[u8]) -> Result<()> {
        self.responder.reply(&[data])
    }

    pub fn reply_two_parts(self, data1: &[u8], data2: &[u8]) -> Result<()> {
        self.responder.reply(&[data1, data2])
    }

    pub fn reply_string(self, data: &str) -> Result<()> {
        self.reply(data.as_bytes())
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("incoming", &self.incoming)
            .finish_non_exhaustive()
    }
}
