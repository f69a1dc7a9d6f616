//! External collaborators: port leasing and the key-value registry.
//!
//! Both are process-wide services owned outside the protocol objects. They
//! are bundled in [`Services`] and handed to every protocol object through
//! an [`AppContext`], so tests and single-process deployments can use the
//! in-process implementations provided here.

use crate::identity::AppIdentity;
use crate::options::ProtocolOptions;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, trace};

/// Leases TCP ports to the protocol objects that bind them.
pub trait PortService: Send + Sync {
    /// Lease a free port on behalf of `owner`.
    fn request_port(&self, owner: &str) -> Result<u16, PortError>;

    /// The port could not be bound; never hand it out again.
    fn set_port_unavailable(&self, port: u16);

    fn release_port(&self, port: u16);
}

/// Registry where publishers and responders advertise their ports.
pub trait KeyValueRegistry: Send + Sync {
    /// # Errors
    ///
    /// [`RegistryError::KeyAlreadyExists`] when `key` is taken.
    fn store_key_value(&self, key: &str, value: Value) -> Result<(), RegistryError>;

    /// # Errors
    ///
    /// [`RegistryError::UndefinedKey`] when nothing is stored under `key`.
    fn get_key_value(&self, key: &str) -> Result<Value, RegistryError>;

    /// # Errors
    ///
    /// [`RegistryError::UndefinedKey`] when nothing is stored under `key`.
    fn remove_key(&self, key: &str) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("Undefined key: {0}")]
    UndefinedKey(String),

    #[error("Invalid registry value under {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("No port available in {first}..={last}")]
    Exhausted { first: u16, last: u16 },

    #[error("Port service unavailable: {0}")]
    Unavailable(String),
}

/// Registry key of a publisher: `"publisher-<name>"`.
pub fn publisher_key(name: &str) -> String {
    format!("publisher-{}", name)
}

/// Registry key of a responder or responder router: `"responder-<name>"`.
pub fn responder_key(name: &str) -> String {
    format!("responder-{}", name)
}

/// What a publisher advertises under its registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRecord {
    pub publisher_port: u16,
    /// Rendezvous port, 0 when no subscriber is expected.
    pub synchronizer_port: u16,
    pub n_subscribers: i32,
}

/// What a responder advertises under its registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderRecord {
    pub port: u16,
}

/// Serialize `record` and store it under `key`.
///
/// # Errors
///
/// Propagates [`RegistryError::KeyAlreadyExists`] from the registry.
pub fn store_record<T: Serialize>(
    registry: &dyn KeyValueRegistry,
    key: &str,
    record: &T,
) -> Result<(), RegistryError> {
    let value = serde_json::to_value(record).map_err(|e| RegistryError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    registry.store_key_value(key, value)
}

/// Fetch and deserialize the record stored under `key`.
///
/// # Errors
///
/// [`RegistryError::UndefinedKey`] when absent, [`RegistryError::InvalidValue`]
/// when the stored value has another shape.
pub fn load_record<T: DeserializeOwned>(
    registry: &dyn KeyValueRegistry,
    key: &str,
) -> Result<T, RegistryError> {
    let value = registry.get_key_value(key)?;
    serde_json::from_value(value).map_err(|e| RegistryError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// A port currently leased to an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub owner: String,
}

/// Lease ports until `bind` succeeds on one of them.
///
/// Every port `bind` rejects is reported unavailable before the next one is
/// requested. Returns the bound port together with what `bind` produced.
///
/// # Errors
///
/// Fails only when the port service cannot lease any more ports.
pub fn bind_leased_port<T, E: fmt::Display>(
    ports: &dyn PortService,
    owner: &str,
    mut bind: impl FnMut(u16) -> Result<T, E>,
) -> Result<(u16, T), PortError> {
    loop {
        let port = ports.request_port(owner)?;
        match bind(port) {
            Ok(bound) => {
                debug!("[{}] bound leased port {}", owner, port);
                return Ok((port, bound));
            }
            Err(e) => {
                debug!("[{}] cannot bind port {}: {}", owner, port, e);
                ports.set_port_unavailable(port);
            }
        }
    }
}

#[derive(Debug, Default)]
struct PortTable {
    leases: BTreeMap<u16, String>,
    unavailable: BTreeSet<u16>,
}

/// In-process port service handing out ports from a fixed range.
#[derive(Debug)]
pub struct LocalPortService {
    range: RangeInclusive<u16>,
    table: Mutex<PortTable>,
}

impl LocalPortService {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            table: Mutex::new(PortTable::default()),
        }
    }

    /// Ports currently leased, in ascending order.
    pub fn leases(&self) -> Vec<PortLease> {
        self.table
            .lock()
            .leases
            .iter()
            .map(|(port, owner)| PortLease {
                port: *port,
                owner: owner.clone(),
            })
            .collect()
    }

    pub fn is_unavailable(&self, port: u16) -> bool {
        self.table.lock().unavailable.contains(&port)
    }
}

impl Default for LocalPortService {
    fn default() -> Self {
        Self::new(7000..=7999)
    }
}

impl PortService for LocalPortService {
    fn request_port(&self, owner: &str) -> Result<u16, PortError> {
        let mut table = self.table.lock();
        let port = self
            .range
            .clone()
            .find(|port| !table.leases.contains_key(port) && !table.unavailable.contains(port))
            .ok_or(PortError::Exhausted {
                first: *self.range.start(),
                last: *self.range.end(),
            })?;
        table.leases.insert(port, owner.to_string());
        trace!("leased port {} to {}", port, owner);
        Ok(port)
    }

    fn set_port_unavailable(&self, port: u16) {
        let mut table = self.table.lock();
        table.leases.remove(&port);
        table.unavailable.insert(port);
    }

    fn release_port(&self, port: u16) {
        if self.table.lock().leases.remove(&port).is_some() {
            trace!("released port {}", port);
        }
    }
}

/// In-process registry backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, Value>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueRegistry for InMemoryRegistry {
    fn store_key_value(&self, key: &str, value: Value) -> Result<(), RegistryError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::KeyAlreadyExists(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    fn get_key_value(&self, key: &str) -> Result<Value, RegistryError> {
        self.entries
            .get(key)
            .map(|value| value.value().clone())
            .ok_or_else(|| RegistryError::UndefinedKey(key.to_string()))
    }

    fn remove_key(&self, key: &str) -> Result<(), RegistryError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UndefinedKey(key.to_string()))
    }
}

/// Process-wide collaborators, created once and shared by reference.
#[derive(Clone)]
pub struct Services {
    pub ports: Arc<dyn PortService>,
    pub registry: Arc<dyn KeyValueRegistry>,
}

impl Services {
    pub fn new(ports: Arc<dyn PortService>, registry: Arc<dyn KeyValueRegistry>) -> Self {
        Self { ports, registry }
    }

    /// In-process services leasing ports from `range`.
    pub fn local(range: RangeInclusive<u16>) -> Self {
        Self::new(
            Arc::new(LocalPortService::new(range)),
            Arc::new(InMemoryRegistry::new()),
        )
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Everything a protocol object needs from its owning application.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub identity: AppIdentity,
    pub services: Services,
    /// Defaults for every protocol object created from this context.
    pub options: ProtocolOptions,
}

impl AppContext {
    pub fn new(identity: AppIdentity, services: Services) -> Self {
        Self {
            identity,
            services,
            options: ProtocolOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn ports(&self) -> &dyn PortService {
        self.services.ports.as_ref()
    }

    pub fn registry(&self) -> &dyn KeyValueRegistry {
        self.services.registry.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ports_are_leased_in_order() {
        let ports = LocalPortService::new(9000..=9002);
        assert_eq!(ports.request_port("a").unwrap(), 9000);
        assert_eq!(ports.request_port("b").unwrap(), 9001);
        assert_eq!(
            ports.leases(),
            vec![
                PortLease { port: 9000, owner: "a".into() },
                PortLease { port: 9001, owner: "b".into() },
            ]
        );

        ports.release_port(9000);
        assert_eq!(ports.request_port("c").unwrap(), 9000);
    }

    #[test]
    fn test_unavailable_ports_are_skipped() {
        let ports = LocalPortService::new(9000..=9001);
        let first = ports.request_port("a").unwrap();
        ports.set_port_unavailable(first);
        assert!(ports.is_unavailable(first));
        assert!(ports.leases().is_empty());

        assert_eq!(ports.request_port("a").unwrap(), 9001);
        assert_eq!(
            ports.request_port("a"),
            Err(PortError::Exhausted { first: 9000, last: 9001 })
        );
    }

    #[test]
    fn test_bind_leased_port_retries() {
        let ports = LocalPortService::new(9000..=9005);
        let (port, attempt) = bind_leased_port(&ports, "rpc", |port| {
            if port < 9002 {
                Err("address in use")
            } else {
                Ok(port - 9000)
            }
        })
        .unwrap();

        assert_eq!(port, 9002);
        assert_eq!(attempt, 2);
        assert!(ports.is_unavailable(9000));
        assert!(ports.is_unavailable(9001));
        assert_eq!(ports.leases().len(), 1);
    }

    #[test]
    fn test_bind_leased_port_exhausted() {
        let ports = LocalPortService::new(9000..=9001);
        let result: Result<(u16, ()), _> = bind_leased_port(&ports, "rpc", |_| Err("nope"));
        assert!(matches!(result, Err(PortError::Exhausted { .. })));
    }

    #[test]
    fn test_records() {
        let registry = InMemoryRegistry::new();
        let record = PublisherRecord {
            publisher_port: 7000,
            synchronizer_port: 7001,
            n_subscribers: 2,
        };
        store_record(&registry, &publisher_key("positions"), &record).unwrap();
        assert_eq!(
            registry.get_key_value("publisher-positions").unwrap(),
            json!({"publisher_port": 7000, "synchronizer_port": 7001, "n_subscribers": 2})
        );
        assert_eq!(
            load_record::<PublisherRecord>(&registry, "publisher-positions").unwrap(),
            record
        );
        assert!(matches!(
            load_record::<ResponderRecord>(&registry, "publisher-positions"),
            Err(RegistryError::InvalidValue { .. })
        ));
        assert!(matches!(
            load_record::<ResponderRecord>(&registry, &responder_key("rpc")),
            Err(RegistryError::UndefinedKey(_))
        ));
    }

    #[test]
    fn test_registry() {
        let registry = InMemoryRegistry::new();
        registry.store_key_value("responder-x", json!({"port": 7000})).unwrap();
        assert_eq!(
            registry.store_key_value("responder-x", json!({"port": 7001})),
            Err(RegistryError::KeyAlreadyExists("responder-x".into()))
        );
        assert_eq!(registry.get_key_value("responder-x").unwrap()["port"], 7000);

        registry.remove_key("responder-x").unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove_key("responder-x"),
            Err(RegistryError::UndefinedKey("responder-x".into()))
        );
    }
}
