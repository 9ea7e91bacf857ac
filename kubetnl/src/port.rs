//! Port mappings between a cluster-side service port and an operator-side
//! target endpoint.
//!
//! A mapping is written as `[TARGET_ADDR:]TARGET_PORT:SERVICE_PORT[/PROTOCOL]`,
//! e.g. `8080:80`, `10.0.0.5:3306:3306` or `1.2.3.4:5:6/udp`. The target
//! address defaults to `127.0.0.1`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Protocol declared on the cluster Service and Pod ports.
///
/// Only TCP traffic is carried by the tunnel itself; UDP and SCTP merely
/// shape the declared port protocol of the created objects.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// The protocol name in the form the Kubernetes API expects.
    #[must_use]
    pub const fn as_kubernetes(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            _ => UnknownProtocolSnafu { value: input }.fail(),
        }
    }
}

/// A single tunnel port mapping.
///
/// Connections accepted on `container_port` inside the cluster are delivered
/// to `target_host:target_port`, an endpoint reachable from the operator's
/// machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Address the operator-side dialer connects to. A dotted-quad or a
    /// hostname.
    pub target_host: String,

    /// Port the operator-side dialer connects to.
    pub target_port: u16,

    /// Port exposed by the cluster Service and the tunnel pod.
    pub container_port: u16,

    /// Declared protocol of the Service/Pod port.
    pub protocol: Protocol,
}

impl Mapping {
    /// The `host:port` string the tunnel dials for each accepted connection.
    #[must_use]
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { target_host, target_port, container_port, protocol } = self;
        write!(f, "{target_host}:{target_port}:{container_port}/{protocol}")
    }
}

impl FromStr for Mapping {
    type Err = Error;

    /// Parses a mapping from `[TARGET_ADDR:]TARGET_PORT:SERVICE_PORT[/PROTOCOL]`.
    ///
    /// Whitespace anywhere in the input is rejected rather than trimmed, so
    /// that shell quoting mistakes surface as errors instead of producing a
    /// mapping that silently targets the wrong host.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.contains(char::is_whitespace) {
            return WhitespaceSnafu { input }.fail();
        }

        let (ports, protocol) = match input.rsplit_once('/') {
            Some((ports, protocol)) => (ports, protocol.parse::<Protocol>()?),
            None => (input, Protocol::default()),
        };

        // Split from the right: the last two tokens are always ports, an
        // optional leading token is the target address.
        let parts = ports.rsplitn(3, ':').collect::<Vec<_>>();
        let (target_host, target_port, container_port) = match parts.as_slice() {
            [container_port, target_port] => {
                (DEFAULT_TARGET_HOST, *target_port, *container_port)
            }
            [container_port, target_port, target_host] if !target_host.is_empty() => {
                (*target_host, *target_port, *container_port)
            }
            _ => return InvalidFormatSnafu { input }.fail(),
        };

        Ok(Self {
            target_host: target_host.to_string(),
            target_port: parse_port(target_port)?,
            container_port: parse_port(container_port)?,
            protocol,
        })
    }
}

fn parse_port(value: &str) -> Result<u16, Error> {
    let port = value
        .parse::<u16>()
        .map_err(|source| Error::InvalidPort { value: value.to_string(), source })?;
    snafu::ensure!(port != 0, PortOutOfRangeSnafu { value });
    Ok(port)
}

/// Parses a list of raw mapping strings, rejecting duplicate service ports.
///
/// Two mappings with the same `container_port` would race for the same
/// reverse listener inside the pod, so the whole list is refused.
pub fn parse_mappings<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Mapping>, Error> {
    let mut mappings = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mapping = input.as_ref().parse::<Mapping>()?;
        if mappings.iter().any(|m: &Mapping| m.container_port == mapping.container_port) {
            return DuplicateContainerPortSnafu { port: mapping.container_port }.fail();
        }
        mappings.push(mapping);
    }
    Ok(mappings)
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "Invalid port mapping: expected '[TARGET_ADDR:]TARGET_PORT:SERVICE_PORT[/PROTOCOL]', \
         got '{input}'"
    ))]
    InvalidFormat { input: String },

    #[snafu(display("Port mapping '{input}' contains whitespace"))]
    Whitespace { input: String },

    #[snafu(display("Invalid port value '{value}', error: {source}"))]
    InvalidPort { value: String, source: std::num::ParseIntError },

    #[snafu(display("Port '{value}' is outside the range 1..=65535"))]
    PortOutOfRange { value: String },

    #[snafu(display("Unknown protocol '{value}', expected one of: tcp, udp, sctp"))]
    UnknownProtocol { value: String },

    #[snafu(display("Service port {port} is used by more than one mapping"))]
    DuplicateContainerPort { port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_part_mapping() {
        let mapping = "8080:80".parse::<Mapping>().expect("Should parse valid mapping");

        assert_eq!(mapping.target_host, "127.0.0.1");
        assert_eq!(mapping.target_port, 8080);
        assert_eq!(mapping.container_port, 80);
        assert_eq!(mapping.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_parse_three_part_mapping_with_protocol() {
        let mapping = "1.2.3.4:5:6/udp".parse::<Mapping>().expect("Should parse valid mapping");

        assert_eq!(mapping.target_host, "1.2.3.4");
        assert_eq!(mapping.target_port, 5);
        assert_eq!(mapping.container_port, 6);
        assert_eq!(mapping.protocol, Protocol::Udp);
    }

    #[test]
    fn test_parse_hostname_target() {
        let mapping =
            "db.internal:5432:5432".parse::<Mapping>().expect("Should parse hostname target");

        assert_eq!(mapping.target_host, "db.internal");
        assert_eq!(mapping.target_address(), "db.internal:5432");
    }

    #[test]
    fn test_protocol_case_insensitive() {
        let mapping = "8080:80/TCP".parse::<Mapping>().expect("Should parse uppercase protocol");
        assert_eq!(mapping.protocol, Protocol::Tcp);

        let mapping = "8080:80/Sctp".parse::<Mapping>().expect("Should parse mixed case");
        assert_eq!(mapping.protocol, Protocol::Sctp);
    }

    #[test]
    fn test_error_zero_port() {
        let err = "0:80".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::PortOutOfRange { .. }));
    }

    #[test]
    fn test_error_non_numeric_ports() {
        let err = "a:b:c".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::InvalidPort { .. }));
    }

    #[test]
    fn test_error_port_too_large() {
        let err = "8080:90000".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::InvalidPort { .. }));
    }

    #[test]
    fn test_error_single_token() {
        let err = "8080".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_error_empty_host() {
        let err = ":8080:80".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_error_whitespace() {
        let err = " 8080:80".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::Whitespace { .. }));

        let err = "8080: 80".parse::<Mapping>().unwrap_err();
        assert!(matches!(err, Error::Whitespace { .. }));
    }

    #[test]
    fn test_error_unknown_protocol() {
        let err = "8080:80/icmp".parse::<Mapping>().unwrap_err();
        assert_eq!(err, Error::UnknownProtocol { value: "icmp".to_string() });
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["8080:80", "1.2.3.4:5:6/udp", "db.internal:5432:5433/sctp"] {
            let mapping = input.parse::<Mapping>().expect("Should parse valid mapping");
            let reparsed =
                mapping.to_string().parse::<Mapping>().expect("Canonical form should parse");
            assert_eq!(mapping, reparsed);
        }
    }

    #[test]
    fn test_parse_mappings_rejects_duplicate_container_port() {
        let err = parse_mappings(&["8080:80", "9090:80"]).unwrap_err();
        assert_eq!(err, Error::DuplicateContainerPort { port: 80 });
    }

    #[test]
    fn test_parse_mappings_keeps_order() {
        let mappings =
            parse_mappings(&["8080:80", "9090:90/udp"]).expect("Should parse valid list");

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].container_port, 80);
        assert_eq!(mappings[1].container_port, 90);
        assert_eq!(mappings[1].protocol, Protocol::Udp);
    }
}
