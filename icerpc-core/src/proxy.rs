//! [`Proxy`]: a target descriptor for an invocation (spec §3).

use std::fmt;
use std::str::FromStr;

use crate::endpoint::Endpoint;
use crate::error::IceRpcError;

/// The wire protocol an invocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    /// The legacy single-stream framed protocol.
    Ice,
    /// The modern multiplexed-stream protocol.
    IceRpc,
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ice => "ice",
            Self::IceRpc => "icerpc",
        })
    }
}

impl FromStr for ProtocolTag {
    type Err = IceRpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ice" => Ok(Self::Ice),
            "icerpc" => Ok(Self::IceRpc),
            other => Err(IceRpcError::InvalidArgument(format!("unknown protocol tag: {other}"))),
        }
    }
}

/// A target descriptor: protocol tag, path, optional primary endpoint,
/// ordered alternates, payload encoding. Immutable after construction.
///
/// A proxy with no endpoints at all is only usable bound to an existing
/// connection (`bound_connection_id`); the core itself never dials, it only
/// carries the address a transport layer outside this crate will use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    protocol: ProtocolTag,
    path: String,
    encoding: String,
    primary_endpoint: Option<Endpoint>,
    alt_endpoints: Vec<Endpoint>,
    bound_connection_id: Option<String>,
}

impl Proxy {
    /// Builds a proxy for `path` on `protocol`, with no endpoints bound yet.
    ///
    /// `path` must be absolute (`/`-prefixed spec §3); returns
    /// [`IceRpcError::InvalidArgument`] otherwise.
    pub fn new(protocol: ProtocolTag, path: impl Into<String>) -> Result<Self, IceRpcError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(IceRpcError::InvalidArgument(format!("proxy path must be absolute: {path}")));
        }
        Ok(Self {
            protocol,
            path,
            encoding: default_encoding(protocol),
            primary_endpoint: None,
            alt_endpoints: Vec::new(),
            bound_connection_id: None,
        })
    }

    /// Returns a copy of this proxy with `endpoint` set as the primary.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.primary_endpoint = Some(endpoint);
        self
    }

    /// Returns a copy of this proxy with `endpoint` appended to its ordered
    /// alternate-endpoint list.
    pub fn with_alt_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.alt_endpoints.push(endpoint);
        self
    }

    /// Returns a copy of this proxy with its payload encoding tag overridden.
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Returns a copy of this proxy pinned to an already-established
    /// connection, bypassing endpoint resolution entirely.
    pub fn with_bound_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.bound_connection_id = Some(connection_id.into());
        self
    }

    /// The target protocol.
    pub fn protocol(&self) -> ProtocolTag {
        self.protocol
    }

    /// The absolute target path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The payload encoding tag.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// The primary endpoint, if one was bound.
    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.primary_endpoint.as_ref()
    }

    /// The ordered alternate endpoints.
    pub fn alt_endpoints(&self) -> &[Endpoint] {
        &self.alt_endpoints
    }

    /// The pinned connection id, if this proxy bypasses endpoint resolution.
    pub fn bound_connection_id(&self) -> Option<&str> {
        self.bound_connection_id.as_deref()
    }
}

fn default_encoding(protocol: ProtocolTag) -> String {
    match protocol {
        ProtocolTag::Ice => "1.1".to_string(),
        ProtocolTag::IceRpc => "slice2".to_string(),
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.path)?;
        if let Some(endpoint) = &self.primary_endpoint {
            write!(f, "@{endpoint}")?;
        }
        for endpoint in &self.alt_endpoints {
            write!(f, ",{endpoint}")?;
        }
        Ok(())
    }
}

impl FromStr for Proxy {
    type Err = IceRpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = s
            .split_once(':')
            .ok_or_else(|| IceRpcError::InvalidArgument(format!("proxy missing protocol tag: {s}")))?;
        let protocol: ProtocolTag = protocol.parse()?;

        let (path, endpoints) = rest.split_once('@').unwrap_or((rest, ""));
        let mut proxy = Proxy::new(protocol, path)?;

        if !endpoints.is_empty() {
            let mut parts = endpoints.split(',');
            if let Some(primary) = parts.next() {
                proxy = proxy.with_endpoint(primary.parse()?);
            }
            for alt in parts {
                proxy = proxy.with_alt_endpoint(alt.parse()?);
            }
        }
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_path() {
        assert!(Proxy::new(ProtocolTag::IceRpc, "greeter").is_err());
    }

    #[test]
    fn round_trips_with_endpoints() {
        let p = Proxy::new(ProtocolTag::IceRpc, "/greeter")
            .unwrap()
            .with_endpoint(Endpoint::new("tcp", "localhost", 4062))
            .with_alt_endpoint(Endpoint::new("tcp", "backup", 4062));
        let parsed: Proxy = p.to_string().parse().unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn bare_proxy_round_trips() {
        let p = Proxy::new(ProtocolTag::Ice, "/hello").unwrap();
        let parsed: Proxy = p.to_string().parse().unwrap();
        assert_eq!(parsed, p);
    }
}
