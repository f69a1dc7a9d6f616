//! One responder name served by a pool of workers.

use crate::responder::Request;
use liaison_core::services::{responder_key, store_record, KeyValueRegistry, ResponderRecord};
use liaison_core::transport::{CancelHandle, RelayTransport, ResponderTransport};
use liaison_core::Result;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "zmq")]
use liaison_zmq::{ZmqContext, ZmqPooledResponder, ZmqRelay};

/// Public face of a worker pool.
///
/// Registered like a [`Responder`](crate::Responder), so requesters cannot
/// tell the difference. [`run`](Self::run) relays every message to the
/// [`PooledResponder`]s connected to
/// [`internal_endpoint`](Self::internal_endpoint) and back, until canceled.
///
/// ## Example
///
/// ```rust,no_run
/// # #[cfg(feature = "zmq")]
/// # fn example(ctx: &liaison::ZmqContext) -> liaison::Result<()> {
/// use liaison::{PooledResponder, ResponderRouter};
///
/// let mut router = ResponderRouter::create(ctx, "compute")?;
/// for _ in 0..4 {
///     let mut worker = PooledResponder::create(ctx, router.internal_endpoint())?;
///     std::thread::spawn(move || -> liaison::Result<()> {
///         while let Some(request) = worker.receive()? {
///             let answer = request.get_string().to_uppercase();
///             request.reply_string(&answer)?;
///         }
///         Ok(())
///     });
/// }
/// router.run()?;
/// # Ok(())
/// # }
/// ```
pub struct ResponderRouter {
    name: String,
    port: u16,
    registry: Arc<dyn KeyValueRegistry>,
    inner: Box<dyn RelayTransport>,
    terminated: bool,
}

impl ResponderRouter {
    /// Bind the relay and register it under `name`.
    ///
    /// # Errors
    ///
    /// - [`LiaisonError::Registry`](crate::LiaisonError::Registry) with
    ///   `KeyAlreadyExists` when a responder already owns `name`
    /// - Port or transport errors when binding fails
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, name: &str) -> Result<Self> {
        let transport = ZmqRelay::new(ctx, name)?;
        Self::with_transport(
            name,
            Box::new(transport),
            Arc::clone(&ctx.app().services.registry),
        )
    }

    pub fn with_transport(
        name: &str,
        mut transport: Box<dyn RelayTransport>,
        registry: Arc<dyn KeyValueRegistry>,
    ) -> Result<Self> {
        let port = transport.init()?;
        if let Err(e) = store_record(registry.as_ref(), &responder_key(name), &ResponderRecord { port }) {
            debug!("[RELAY {}] registration failed: {}", name, e);
            transport.terminate();
            return Err(e.into());
        }
        debug!("[RELAY {}] registered on port {}", name, port);
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

    /// Where [`PooledResponder`]s connect.
    pub fn internal_endpoint(&self) -> &str {
        self.inner.internal_endpoint()
    }

    /// Relay messages until canceled.
    pub fn run(&mut self) -> Result<()> {
        self.inner.run()
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
        if let Err(e) = self.registry.remove_key(&responder_key(&self.name)) {
            warn!("[RELAY {}] cannot deregister: {}", self.name, e);
        }
    }
}

impl Drop for ResponderRouter {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for ResponderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderRouter")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// A worker of a [`ResponderRouter`].
///
/// Same receive/reply cycle as a [`Responder`](crate::Responder). Run one
/// per thread; the router hands each request to one of them.
pub struct PooledResponder {
    inner: Box<dyn ResponderTransport>,
    terminated: bool,
}

impl PooledResponder {
    /// Connect a worker to the router's internal endpoint.
    ///
    /// `ctx` must be the context the router was created with.
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, router_endpoint: &str) -> Result<Self> {
        Self::with_transport(Box::new(ZmqPooledResponder::new(ctx, router_endpoint)))
    }

    pub fn with_transport(mut transport: Box<dyn ResponderTransport>) -> Result<Self> {
        transport.init()?;
        Ok(Self {
            inner: transport,
            terminated: false,
        })
    }

    /// Block until a request arrives. `None` once canceled.
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
        if !std::mem::replace(&mut self.terminated, true) {
            self.inner.terminate();
        }
    }
}

impl Drop for PooledResponder {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for PooledResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResponder").finish_non_exhaustive()
    }
}
