//! Endpoint abstraction for peer addressing.
//!
//! An endpoint is the `protocol://address:port` triple under which a
//! publisher, responder or relay can be reached. Endpoints are immutable;
//! [`Endpoint::with_port`] derives a copy aimed at another leased port on
//! the same host.

use std::fmt;
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    protocol: String,
    address: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint from its parts.
    ///
    /// # Errors
    ///
    /// Fails when the protocol or the address is empty.
    pub fn new(
        protocol: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Result<Self, EndpointError> {
        let protocol = protocol.into();
        let address = address.into();
        if protocol.is_empty() {
            return Err(EndpointError::EmptyProtocol);
        }
        if address.is_empty() {
            return Err(EndpointError::EmptyAddress);
        }
        Ok(Self {
            protocol,
            address,
            port,
        })
    }

    /// Shorthand for a `tcp://` endpoint.
    ///
    /// # Errors
    ///
    /// Fails when the address is empty.
    pub fn tcp(address: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        Self::new("tcp", address, port)
    }

    /// Parse an endpoint from a string.
    ///
    /// The string must hold exactly three `:`-delimited fields:
    /// `protocol`, `//address` and a numeric port.
    ///
    /// # Examples
    ///
    /// ```
    /// use liaison_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://localhost:7000").unwrap();
    /// assert_eq!(endpoint.protocol(), "tcp");
    /// assert_eq!(endpoint.address(), "localhost");
    /// assert_eq!(endpoint.port(), 7000);
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a copy of this endpoint pointing at another port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split(':').collect();
        if tokens.len() != 3 {
            return Err(EndpointError::BadFormat(s.to_string()));
        }

        let address = tokens[1]
            .strip_prefix("//")
            .ok_or_else(|| EndpointError::MissingSchemeSeparator(s.to_string()))?;

        let port = tokens[2]
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(tokens[2].to_string()))?;

        Self::new(tokens[0], address, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// Errors that can occur when parsing or building endpoints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("Bad endpoint format: {0} (expected protocol://address:port)")]
    BadFormat(String),

    #[error("Missing scheme separator in endpoint: {0}")]
    MissingSchemeSeparator(String),

    #[error("Invalid port in endpoint: {0}")]
    InvalidPort(String),

    #[error("Endpoint protocol cannot be empty")]
    EmptyProtocol,

    #[error("Endpoint address cannot be empty")]
    EmptyAddress,
}
