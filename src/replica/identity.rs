use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{DispatchError, Result};

/// Address used to discover the outbound interface. Nothing is sent to it.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Scheduler identity of a replica: `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(ip: &str, port: u16) -> Self {
        Self(format!("{ip}:{port}"))
    }

    /// Identity from a configured IP, or the autodetected outbound one.
    pub fn resolve(ip: Option<&str>, port: u16) -> Result<Self> {
        match ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(ip) => {
                let parsed: IpAddr = ip
                    .parse()
                    .map_err(|_| DispatchError::validation(format!("invalid ip {ip}")))?;
                Ok(Self::new(&parsed.to_string(), port))
            }
            None => Ok(Self::new(&outbound_ip()?.to_string(), port)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local IP of the interface that routes to the outside world.
pub fn outbound_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(PROBE_ADDR)?;
    let local: SocketAddr = socket.local_addr()?;
    if local.ip().is_unspecified() {
        return Err(DispatchError::Internal(
            "cannot detect outbound ip".to_string(),
        ));
    }
    Ok(local.ip())
}
