use std::{fmt::Display, str::FromStr};

use vxi11_protocol::PORTMAPPER_PORT;

use crate::error::Error;

pub const DEFAULT_DEVICE: &str = "inst0";

/// Address of one instrument: host, portmapper port and device name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    device: String,
}

impl Endpoint {
    /// An endpoint using the standard portmapper port and the `inst0` device.
    pub fn new(host: impl Into<String>) -> Endpoint {
        Endpoint {
            host: host.into(),
            port: PORTMAPPER_PORT,
            device: DEFAULT_DEVICE.to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Endpoint {
        self.port = port;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Endpoint {
        self.device = device.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.device)
    }
}

/// Accepts `host`, `host:port` and VISA resource strings such as
/// `TCPIP::192.168.1.10::INSTR` or `TCPIP0::192.168.1.10::gpib0,5::INSTR`.
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::InvalidAddress(s.to_string());
        if s.is_empty() {
            return Err(invalid());
        }

        if s.get(..5).is_some_and(|prefix| prefix.eq_ignore_ascii_case("TCPIP")) {
            let mut parts: Vec<&str> = s.split("::").collect();
            if !parts[0][5..].chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            if parts
                .last()
                .is_some_and(|last| last.eq_ignore_ascii_case("INSTR"))
            {
                parts.pop();
            }
            return match parts.as_slice() {
                [_, host] if !host.is_empty() => Ok(Endpoint::new(*host)),
                [_, host, device] if !host.is_empty() && !device.is_empty() => {
                    Ok(Endpoint::new(*host).with_device(*device))
                }
                _ => Err(invalid()),
            };
        }

        // a single colon separates a port; more than one is an IPv6 literal
        match s.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Endpoint::new(host).with_port(port))
            }
            _ => Ok(Endpoint::new(s)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let endpoint = Endpoint::new("10.0.0.5");
        assert_eq!(endpoint.port(), 111);
        assert_eq!(endpoint.device(), "inst0");
        assert_eq!(endpoint.to_string(), "10.0.0.5:111/inst0");
    }

    #[test]
    fn parse_plain_addresses() {
        let endpoint: Endpoint = "192.168.254.100".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("192.168.254.100"));

        let endpoint: Endpoint = "scope.lab:1111".parse().unwrap();
        assert_eq!(endpoint.host(), "scope.lab");
        assert_eq!(endpoint.port(), 1111);

        let endpoint: Endpoint = "fe80::1".parse().unwrap();
        assert_eq!(endpoint.host(), "fe80::1");
    }

    #[test]
    fn parse_visa_resources() {
        let endpoint: Endpoint = "TCPIP::10.0.0.5::INSTR".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.5"));

        let endpoint: Endpoint = "tcpip0::10.0.0.6::gpib0,5::INSTR".parse().unwrap();
        assert_eq!(endpoint.host(), "10.0.0.6");
        assert_eq!(endpoint.device(), "gpib0,5");

        let endpoint: Endpoint = "TCPIP::10.0.0.7::inst1".parse().unwrap();
        assert_eq!(endpoint.device(), "inst1");
    }

    #[test]
    fn reject_invalid() {
        for address in ["", "host:notaport", ":111", "TCPIP::", "TCPIPx::host::INSTR"] {
            assert!(
                matches!(address.parse::<Endpoint>(), Err(Error::InvalidAddress(_))),
                "{:?} should be rejected",
                address
            );
        }
    }
}
