//! Publisher with subscriber rendezvous and graceful end of stream.

use liaison_core::services::{publisher_key, store_record, KeyValueRegistry, PublisherRecord};
use liaison_core::transport::{CancelHandle, PublisherPorts, PublisherTransport};
use liaison_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "zmq")]
use liaison_zmq::{ZmqContext, ZmqPublisher};

/// Broadcasts a stream of messages under a registered name.
///
/// A publisher created with `n_subscribers > 0` can hold the stream back
/// with [`wait_for_subscribers`](Self::wait_for_subscribers) until that many
/// subscribers joined, so none of them misses the first message.
///
/// The publisher is registered as `"publisher-<name>"` for its lifetime and
/// deregistered by [`terminate`](Self::terminate) or on drop. Terminating
/// sends the end of stream if the application did not.
///
/// ## Example
///
/// ```rust,no_run
/// # #[cfg(feature = "zmq")]
/// # fn example(ctx: &liaison::ZmqContext) -> liaison::Result<()> {
/// use liaison::Publisher;
///
/// let mut publisher = Publisher::create(ctx, "positions", 2)?;
/// if publisher.wait_for_subscribers()? {
///     for i in 0..10 {
///         publisher.send_string(&format!("position {}", i))?;
///     }
/// }
/// publisher.send_end()?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher {
    name: String,
    n_subscribers: i32,
    ports: PublisherPorts,
    registry: Arc<dyn KeyValueRegistry>,
    inner: Box<dyn PublisherTransport>,
    terminated: bool,
}

impl Publisher {
    /// Bind a ZeroMQ publisher and register it under `name`.
    ///
    /// # Errors
    ///
    /// - [`LiaisonError::Registry`](crate::LiaisonError::Registry) with
    ///   `KeyAlreadyExists` when another publisher owns `name`
    /// - Port or transport errors when binding fails
    #[cfg(feature = "zmq")]
    pub fn create(ctx: &ZmqContext, name: &str, n_subscribers: i32) -> Result<Self> {
        let transport = ZmqPublisher::new(ctx, name, n_subscribers)?;
        Self::with_transport(
            name,
            n_subscribers,
            Box::new(transport),
            Arc::clone(&ctx.app().services.registry),
        )
    }

    /// Initialize `transport` and register it under `name`.
    ///
    /// On a registration failure the transport is terminated before the
    /// error is returned.
    pub fn with_transport(
        name: &str,
        n_subscribers: i32,
        mut transport: Box<dyn PublisherTransport>,
        registry: Arc<dyn KeyValueRegistry>,
    ) -> Result<Self> {
        let ports = transport.init()?;
        let record = PublisherRecord {
            publisher_port: ports.publisher_port,
            synchronizer_port: ports.synchronizer_port,
            n_subscribers,
        };
        if let Err(e) = store_record(registry.as_ref(), &publisher_key(name), &record) {
            debug!("[PUB {}] registration failed: {}", name, e);
            transport.terminate();
            return Err(e.into());
        }
        debug!(
            "[PUB {}] registered on port {} ({} subscribers expected)",
            name, ports.publisher_port, n_subscribers
        );

        Ok(Self {
            name: name.to_string(),
            n_subscribers,
            ports,
            registry,
            inner: transport,
            terminated: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_subscribers(&self) -> i32 {
        self.n_subscribers
    }

    pub fn ports(&self) -> PublisherPorts {
        self.ports
    }

    /// Block until the expected subscribers registered.
    ///
    /// Returns `true` immediately when no subscriber is expected, and
    /// `false` when the wait was canceled.
    pub fn wait_for_subscribers(&mut self) -> Result<bool> {
        self.inner.wait_for_subscribers()
    }

    /// Interrupt a [`wait_for_subscribers`](Self::wait_for_subscribers)
    /// blocked in another thread. Prefer [`canceler`](Self::canceler) to get
    /// a handle that can be moved there.
    pub fn cancel_wait_for_subscribers(&self) -> Result<()> {
        self.inner.canceler().cancel()
    }

    pub fn canceler(&self) -> CancelHandle {
        self.inner.canceler()
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

    /// Signal the end of the stream. Only the first call sends anything.
    pub fn send_end(&mut self) -> Result<()> {
        self.inner.send_end()
    }

    pub fn has_ended(&self) -> bool {
        self.inner.flags().has_ended()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flags().is_canceled()
    }

    /// Send the end of stream if needed, close the sockets and deregister.
    pub fn terminate(&mut self) {
        if std::mem::replace(&mut self.terminated, true) {
            return;
        }
        self.inner.terminate();
        if let Err(e) = self.registry.remove_key(&publisher_key(&self.name)) {
            warn!("[PUB {}] cannot deregister: {}", self.name, e);
        }
    }

    /// Wrap the publisher so that several threads can send through it.
    pub fn thread_safe(self) -> SyncPublisher {
        SyncPublisher {
            inner: Mutex::new(self),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.name)
            .field("n_subscribers", &self.n_subscribers)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

/// A [`Publisher`] whose sends are serialized behind a mutex.
///
/// Share it through an `Arc`. Waiting for subscribers holds the lock, so
/// do it before other threads start sending.
pub struct SyncPublisher {
    inner: Mutex<Publisher>,
}

impl SyncPublisher {
    pub fn wait_for_subscribers(&self) -> Result<bool> {
        self.inner.lock().wait_for_subscribers()
    }

    pub fn canceler(&self) -> CancelHandle {
        self.inner.lock().canceler()
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.lock().send(data)
    }

    pub fn send_two_parts(&self, data1: &[u8], data2: &[u8]) -> Result<()> {
        self.inner.lock().send_two_parts(data1, data2)
    }

    pub fn send_string(&self, data: &str) -> Result<()> {
        self.inner.lock().send_string(data)
    }

    pub fn send_end(&self) -> Result<()> {
        self.inner.lock().send_end()
    }

    pub fn has_ended(&self) -> bool {
        self.inner.lock().has_ended()
    }

    pub fn terminate(&self) {
        self.inner.lock().terminate();
    }

    pub fn into_inner(self) -> Publisher {
        self.inner.into_inner()
    }
}
