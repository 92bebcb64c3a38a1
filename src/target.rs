use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;

/// Identity of one hardware target: its IPv4 address plus the *control* port `P`.
///
/// The target listens on three consecutive UDP ports: `P` for IPbus
/// request/response traffic, `P+1` for status queries and `P+2` for resend
/// requests. A `TargetAddr` can therefore only be constructed for control
/// ports up to `0xFFFD` - anything above would push the out-of-band ports
/// past the valid port range.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TargetAddr {
    ip: Ipv4Addr,
    port: u16,
}

impl Debug for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.ip, self.port)
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl TargetAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> anyhow::Result<TargetAddr> {
        if port > 0xFFFD {
            bail!(
                "control port {} leaves no room for the status and resend ports",
                port
            );
        }
        Ok(TargetAddr { ip, port })
    }

    /// Convenience constructor for callers that carry the address as a raw
    ///  big-endian u32 (the form used on the upstream wire).
    pub fn from_raw(ip: u32, port: u16) -> anyhow::Result<TargetAddr> {
        Self::new(Ipv4Addr::from_bits(ip), port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// IPbus request/response endpoint (`P`).
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Status query endpoint (`P+1`).
    pub fn status_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port + 1))
    }

    /// Resend request endpoint (`P+2`).
    pub fn resend_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port + 2))
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> TargetAddr {
        TargetAddr::new(Ipv4Addr::LOCALHOST, port).unwrap()
    }
}
