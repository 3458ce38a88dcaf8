use crate::protocol::AddressType;
use anyhow::{Result, anyhow, bail};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is a destination as requested by the client: either a
/// literal socket address or a domain name that still has to be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// read_from parses DST.ADDR and DST.PORT for an already consumed
    /// ATYP byte
    pub async fn read_from<S>(stream: &mut S, addr_type: AddressType) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let target = match addr_type {
            AddressType::IPv4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(stream).await?;

                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
            }
            AddressType::DomainName => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = stream.read_u8().await?;
                if len == 0 {
                    bail!("domain length cannot be 0");
                }

                let mut domain = vec![0u8; len as usize];
                stream.read_exact(&mut domain).await?;
                let domain =
                    String::from_utf8(domain).map_err(|e| anyhow!("invalid domain: {e}"))?;
                let port = read_port(stream).await?;

                TargetAddr::Domain(domain, port)
            }
            AddressType::IPv6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(stream).await?;

                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
            }
        };

        Ok(target)
    }

    /// host is the destination exactly as the client named it: the domain
    /// for names, the textual address for IP literals
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// resolve turns the target into candidate socket addresses, using the
    /// system resolver for domain names
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        match self {
            TargetAddr::Ip(addr) => Ok(vec![*addr]),
            TargetAddr::Domain(domain, port) => {
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .map_err(|e| anyhow!("failed to resolve host '{domain}': {e}"))?
                    .collect();

                if addrs.is_empty() {
                    bail!("no IP address found for '{domain}'");
                }
                Ok(addrs)
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// encode_socket_addr appends ATYP, BND.ADDR and BND.PORT for a reply
pub fn encode_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
}

// Port is always network order
async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    Ok(stream.read_u16().await?)
}
