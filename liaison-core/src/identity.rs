//! Identities of protocol instances and of the applications that own them.

use crate::endpoint::Endpoint;
use std::fmt;
use std::str::FromStr;

/// Key naming one publisher or responder instance: `"<ownerId>:<name>"`.
///
/// The same string is used as the subscribe topic of a publisher, the
/// routing identity of a responder and the suffix of its registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    owner_id: i32,
    name: String,
}

impl Identity {
    /// # Errors
    ///
    /// Fails when `name` is empty.
    pub fn new(owner_id: i32, name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        Ok(Self { owner_id, name })
    }

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        s.parse()
    }

    pub fn owner_id(&self) -> i32 {
        self.owner_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire form, as sent in topic and identity frames.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, name) = s
            .split_once(':')
            .ok_or_else(|| IdentityError::MissingSeparator(s.to_string()))?;
        let owner_id = owner
            .parse::<i32>()
            .map_err(|_| IdentityError::InvalidOwner(owner.to_string()))?;
        Self::new(owner_id, name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.name)
    }
}

/// Errors that can occur when parsing or building identities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Missing ':' separator in identity: {0}")]
    MissingSeparator(String),

    #[error("Invalid owner id in identity: {0}")]
    InvalidOwner(String),

    #[error("Identity name cannot be empty")]
    EmptyName,
}

/// The local application, as advertised to peers in every REQUEST envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub id: i32,
    /// Base endpoint of the host; leased ports are derived with `with_port`.
    pub endpoint: Endpoint,
    /// Port of the responder proxy a peer can use to call back.
    pub proxy_port: u16,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, id: i32, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            id,
            endpoint,
            proxy_port: 0,
        }
    }

    #[must_use]
    pub fn with_proxy_port(mut self, proxy_port: u16) -> Self {
        self.proxy_port = proxy_port;
        self
    }

    /// Identity of a protocol object owned by this application.
    ///
    /// # Errors
    ///
    /// Fails when `name` is empty.
    pub fn identity(&self, name: &str) -> Result<Identity, IdentityError> {
        Identity::new(self.id, name)
    }
}

/// A remote application whose publishers or responders we talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerApp {
    pub id: i32,
    pub endpoint: Endpoint,
    /// Where the supervisor broadcasts this application's status events.
    pub status_endpoint: Option<Endpoint>,
}

impl PeerApp {
    pub fn new(id: i32, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            status_endpoint: None,
        }
    }

    #[must_use]
    pub fn with_status_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.status_endpoint = Some(endpoint);
        self
    }
}

impl From<&AppIdentity> for PeerApp {
    fn from(app: &AppIdentity) -> Self {
        Self::new(app.id, app.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_format() {
        let identity = Identity::new(12, "positions").unwrap();
        assert_eq!(identity.to_string(), "12:positions");
        assert_eq!(identity.to_bytes(), b"12:positions".to_vec());
    }

    #[test]
    fn test_identity_round_trip_keeps_colons_in_name() {
        let identity = Identity::parse("3:publisher:stream").unwrap();
        assert_eq!(identity.owner_id(), 3);
        assert_eq!(identity.name(), "publisher:stream");
        assert_eq!(Identity::parse(&identity.to_string()).unwrap(), identity);
    }

    #[test]
    fn test_identity_rejects_malformed() {
        assert!(matches!(
            Identity::parse("positions"),
            Err(IdentityError::MissingSeparator(_))
        ));
        assert!(matches!(
            Identity::parse("x:positions"),
            Err(IdentityError::InvalidOwner(_))
        ));
        assert_eq!(Identity::parse("4:"), Err(IdentityError::EmptyName));
    }

    #[test]
    fn test_peer_from_app() {
        let app = AppIdentity::new("app", 9, Endpoint::tcp("localhost", 7000).unwrap())
            .with_proxy_port(10000);
        let peer = PeerApp::from(&app);
        assert_eq!(peer.id, 9);
        assert_eq!(peer.status_endpoint, None);
        assert_eq!(app.identity("rpc").unwrap().to_string(), "9:rpc");
    }
}
