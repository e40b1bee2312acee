use crate::error::{Result, Socks5Error};
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// AddressSpec is a SOCKS5 address as it travels on the wire: an IPv4 or
/// IPv6 address, or a domain name still waiting to be resolved, each with
/// a port.
///
/// Wire format (port is always big-endian):
/// ```text
/// +------+----------+----------+
/// | ATYP | DST.ADDR | DST.PORT |
/// +------+----------+----------+
/// |  1   | Variable |    2     |
/// +------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressSpec {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    DomainName(String, u16),
}

impl AddressSpec {
    /// unspecified is `0.0.0.0:0`, used in replies that carry no address
    pub fn unspecified() -> Self {
        AddressSpec::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn port(&self) -> u16 {
        match self {
            AddressSpec::Ipv4(_, port)
            | AddressSpec::Ipv6(_, port)
            | AddressSpec::DomainName(_, port) => *port,
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            AddressSpec::Ipv4(..) => AddressType::IPv4,
            AddressSpec::Ipv6(..) => AddressType::IPv6,
            AddressSpec::DomainName(..) => AddressType::DomainName,
        }
    }

    /// ip returns the literal IP for address variants, `None` for domains
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            AddressSpec::Ipv4(ip, _) => Some(IpAddr::V4(*ip)),
            AddressSpec::Ipv6(ip, _) => Some(IpAddr::V6(*ip)),
            AddressSpec::DomainName(..) => None,
        }
    }

    /// decode parses an address from the start of `buf` and returns it
    /// together with the number of bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let Some(&atyp) = buf.first() else {
            return Err(Socks5Error::MalformedAddress("empty buffer".into()));
        };

        match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                // ATYP + 4 address bytes + 2 port bytes
                let body = take(buf, 1, 6, "IPv4 address and port")?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok((AddressSpec::Ipv4(ip, port), 7))
            }
            Some(AddressType::IPv6) => {
                let body = take(buf, 1, 18, "IPv6 address and port")?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok((AddressSpec::Ipv6(Ipv6Addr::from(octets), port), 19))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = take(buf, 1, 1, "domain length")?[0] as usize;
                let body = take(buf, 2, len + 2, "domain and port")?;
                let domain = std::str::from_utf8(&body[..len])
                    .map_err(|e| Socks5Error::MalformedAddress(format!("invalid domain: {e}")))?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                Ok((AddressSpec::DomainName(domain.to_owned(), port), 2 + len + 2))
            }
            None => Err(Socks5Error::MalformedAddress(format!(
                "unknown address type: {atyp:#04x}"
            ))),
        }
    }

    /// encode writes the wire form of the address. Domain names longer than
    /// 255 bytes cannot be represented and are cut at 255 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.address_type() as u8);
        match self {
            AddressSpec::Ipv4(ip, _) => out.extend_from_slice(&ip.octets()),
            AddressSpec::Ipv6(ip, _) => out.extend_from_slice(&ip.octets()),
            AddressSpec::DomainName(domain, _) => {
                let bytes = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
        }
        out.extend_from_slice(&self.port().to_be_bytes());
    }

    fn encoded_len(&self) -> usize {
        match self {
            AddressSpec::Ipv4(..) => 7,
            AddressSpec::Ipv6(..) => 19,
            AddressSpec::DomainName(domain, _) => 4 + domain.len().min(u8::MAX as usize),
        }
    }

    /// read_from reads an address straight off a stream. Unlike [`decode`],
    /// an unknown type tag is reported as [`Socks5Error::AddressTypeNotSupported`]
    /// so the caller can answer it with the matching reply code.
    ///
    /// [`decode`]: AddressSpec::decode
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;

        let addr = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                AddressSpec::Ipv4(Ipv4Addr::from(octets), port)
            }
            Some(AddressType::IPv6) => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                AddressSpec::Ipv6(Ipv6Addr::from(octets), port)
            }
            Some(AddressType::DomainName) => {
                let len = reader.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|e| Socks5Error::MalformedAddress(format!("invalid domain: {e}")))?;
                let port = reader.read_u16().await?;
                AddressSpec::DomainName(domain, port)
            }
            None => return Err(Socks5Error::AddressTypeNotSupported(atyp)),
        };

        Ok(addr)
    }

    /// resolve turns the address into a concrete socket address, looking up
    /// domain names. Lookup failure is an [`Socks5Error::AddressResolution`].
    pub async fn resolve(&self) -> Result<SocketAddr> {
        self.resolve_all()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Socks5Error::AddressResolution {
                host: self.to_string(),
                reason: "no addresses returned".into(),
            })
    }

    /// resolve_all returns every candidate address in resolver order
    pub async fn resolve_all(&self) -> Result<Vec<SocketAddr>> {
        match self {
            AddressSpec::Ipv4(ip, port) => Ok(vec![SocketAddr::new(IpAddr::V4(*ip), *port)]),
            AddressSpec::Ipv6(ip, port) => Ok(vec![SocketAddr::new(IpAddr::V6(*ip), *port)]),
            AddressSpec::DomainName(host, port) => {
                let resolution_error = |reason: String| Socks5Error::AddressResolution {
                    host: host.clone(),
                    reason,
                };

                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| resolution_error(e.to_string()))?
                    .collect();

                if addrs.is_empty() {
                    return Err(resolution_error("no addresses returned".into()));
                }
                Ok(addrs)
            }
        }
    }
}

/// take borrows `len` bytes starting at `offset`, or fails as a short buffer
fn take<'a>(buf: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    buf.get(offset..offset + len)
        .ok_or_else(|| Socks5Error::MalformedAddress(format!("not enough data for {what}")))
}

impl From<SocketAddr> for AddressSpec {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => AddressSpec::Ipv4(*v4.ip(), v4.port()),
            // Keep mapped IPv4 peers as IPv4 so replies match what the client dialed
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => AddressSpec::Ipv4(v4, v6.port()),
                None => AddressSpec::Ipv6(*v6.ip(), v6.port()),
            },
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpec::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            AddressSpec::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            AddressSpec::DomainName(host, port) => write!(f, "{host}:{port}"),
        }
    }
}
