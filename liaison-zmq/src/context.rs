//! Process-wide ZeroMQ context bound to the owning application.

use liaison_core::identity::{AppIdentity, Identity};
use liaison_core::options::ProtocolOptions;
use liaison_core::services::{AppContext, KeyValueRegistry, PortService};
use liaison_core::Result;

/// A `zmq::Context` together with the application it serves.
///
/// Cheap to clone; clones share the underlying context.
#[derive(Clone)]
pub struct ZmqContext {
    zmq: zmq::Context,
    app: AppContext,
}

impl ZmqContext {
    pub fn new(app: AppContext) -> Self {
        Self {
            zmq: zmq::Context::new(),
            app,
        }
    }

    pub fn zmq(&self) -> &zmq::Context {
        &self.zmq
    }

    pub fn app(&self) -> &AppContext {
        &self.app
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.app.identity
    }

    /// Defaults applied to protocol objects created from this context.
    pub fn options(&self) -> &ProtocolOptions {
        &self.app.options
    }

    pub fn ports(&self) -> &dyn PortService {
        self.app.ports()
    }

    pub fn registry(&self) -> &dyn KeyValueRegistry {
        self.app.registry()
    }

    /// Identity of a publisher or responder owned by this application.
    pub fn identity_of(&self, name: &str) -> Result<Identity> {
        Ok(self.app.identity.identity(name)?)
    }

    /// Endpoint peers use to reach `port` on this host.
    pub fn local_endpoint(&self, port: u16) -> String {
        self.app.identity.endpoint.with_port(port).to_string()
    }
}

impl std::fmt::Debug for ZmqContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqContext")
            .field("app", &self.app.identity.name)
            .field("id", &self.app.identity.id)
            .finish_non_exhaustive()
    }
}
