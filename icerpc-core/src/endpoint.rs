//! [`Endpoint`]: a transport-agnostic network address (spec §3).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::IceRpcError;

/// Transport name + host + port + ordered parameter map. Immutable.
///
/// Displays and parses as `transport://host:port?key=value&...`, mirroring
/// the `Url` parsing the teacher leans on for its HTTP/WS transport configs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    transport: String,
    host: String,
    port: u16,
    params: BTreeMap<String, String>,
}

impl Endpoint {
    /// Builds an endpoint with no transport parameters.
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { transport: transport.into(), host: host.into(), port, params: BTreeMap::new() }
    }

    /// Returns a copy of this endpoint with `key=value` added to its
    /// parameter map, overwriting any existing value for `key`.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The transport name, e.g. `"tcp"` or `"quic"`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Looks up a transport parameter by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Iterates the ordered transport parameters.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = IceRpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| IceRpcError::InvalidArgument(format!("endpoint missing scheme: {s}")))?;
        let (authority, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| IceRpcError::InvalidArgument(format!("endpoint missing port: {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| IceRpcError::InvalidArgument(format!("invalid port in endpoint: {s}")))?;

        let mut endpoint = Endpoint::new(scheme, host, port);
        if !query.is_empty() {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    IceRpcError::InvalidArgument(format!("malformed endpoint parameter: {pair}"))
                })?;
                endpoint = endpoint.with_param(key, value);
            }
        }
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_without_params() {
        let e = Endpoint::new("tcp", "localhost", 4062);
        assert_eq!(e.to_string(), "tcp://localhost:4062");
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let e = Endpoint::new("quic", "10.0.0.1", 10000).with_param("timeout", "5000");
        let parsed: Endpoint = e.to_string().parse().unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn rejects_missing_port() {
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
    }
}
