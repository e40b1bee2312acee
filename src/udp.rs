use crate::address::AddressSpec;
use crate::error::{Result, Socks5Error};
use crate::protocol::{MAX_DGRAM, ReplyCode};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Replies from targets waiting to be wrapped and sent to the client
const RESPONSE_QUEUE: usize = 64;

/// UdpPacket is a client datagram with its SOCKS5 header taken apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket<'a> {
    pub frag: u8,
    pub target: AddressSpec,
    pub payload: &'a [u8],
}

impl<'a> UdpPacket<'a> {
    /// decode splits a datagram into header fields and payload
    pub fn decode(packet: &'a [u8]) -> Result<Self> {
        // SOCKS5 UDP Request Header
        // +----+------+------+----------+----------+----------+
        // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
        // +----+------+------+----------+----------+----------+
        // | 2  |  1   |  1   | Variable |    2     | Variable |
        // +----+------+------+----------+----------+----------+
        if packet.len() < 4 {
            return Err(Socks5Error::protocol("UDP packet too short"));
        }

        let frag = packet[2];
        let (target, used) = AddressSpec::decode(&packet[3..])?;

        Ok(Self {
            frag,
            target,
            payload: &packet[3 + used..],
        })
    }
}

/// encode_datagram wraps a payload from `source` for delivery to the client
pub fn encode_datagram(source: &AddressSpec, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 22);

    // RSV -> 2 bytes, FRAG -> single byte
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    source.encode_into(&mut packet);
    packet.extend_from_slice(payload);

    packet
}

/// bind_relay opens the client-facing relay socket on an ephemeral port
pub async fn bind_relay(local_ip: IpAddr) -> Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(|e| Socks5Error::UpstreamConnect {
            target: format!("{local_ip}:0"),
            reply: ReplyCode::ServerFailure,
            reason: format!("failed to open UDP relay: {e}"),
        })
}

/// UdpStats counts datagrams relayed in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpStats {
    pub forwarded: u64,
    pub returned: u64,
    pub dropped: u64,
}

/// UdpAssociation relays datagrams for one client for as long as the
/// controlling TCP connection stays open
pub struct UdpAssociation {
    relay_socket: UdpSocket,
    client_ip: IpAddr,
    /// Source port the client announced, if any
    client_port: Option<u16>,
    idle: Duration,
    /// Budget for resolving a datagram's target
    resolve_timeout: Duration,
}

/// Outbound holds at most one socket per address family, created on first use
#[derive(Default)]
struct Outbound {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl Outbound {
    async fn socket_for(
        &mut self,
        target: SocketAddr,
        monitors: &mut JoinSet<()>,
        response_tx: &mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) -> Result<Arc<UdpSocket>> {
        let slot = if target.is_ipv4() {
            &mut self.v4
        } else {
            &mut self.v6
        };

        if let Some(socket) = slot.as_ref() {
            return Ok(Arc::clone(socket));
        }

        let unspecified = if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let bind_addr = SocketAddr::new(unspecified, 0);

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        debug!("created outbound UDP socket {}", socket.local_addr()?);

        monitors.spawn(monitor_outbound_socket(Arc::clone(&socket), response_tx.clone()));
        *slot = Some(Arc::clone(&socket));

        Ok(socket)
    }
}

impl UdpAssociation {
    pub fn new(
        relay_socket: UdpSocket,
        client_ip: IpAddr,
        requested: &AddressSpec,
        idle: Duration,
        resolve_timeout: Duration,
    ) -> Self {
        let client_port = Some(requested.port()).filter(|port| *port != 0);
        Self {
            relay_socket,
            client_ip,
            client_port,
            idle,
            resolve_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.relay_socket.local_addr()?)
    }

    /// run relays until the control stream closes or the association idles
    pub async fn run<S>(self, control: &mut S) -> Result<UdpStats>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; MAX_DGRAM];
        let mut control_buf = [0u8; 64];
        let mut stats = UdpStats::default();
        let mut client_addr: Option<SocketAddr> = None;
        let mut outbound = Outbound::default();
        let mut monitors = JoinSet::new();
        let (response_tx, mut response_rx) = mpsc::channel(RESPONSE_QUEUE);
        let mut deadline = Instant::now() + self.idle;

        info!("UDP relay listening on {}", self.relay_socket.local_addr()?);

        loop {
            select! {
                // The association lives exactly as long as the TCP connection
                read = control.read(&mut control_buf) => match read {
                    Ok(0) => {
                        debug!("control connection closed, ending UDP association");
                        break;
                    }
                    Ok(n) => debug!("ignoring {n} unexpected bytes on control connection"),
                    Err(e) => {
                        debug!("control connection error: {e}");
                        break;
                    }
                },

                // Client -> target
                incoming = self.relay_socket.recv_from(&mut buffer) => {
                    let (len, src) = incoming?;

                    if !self.is_client(src, client_addr) {
                        warn!("rejected UDP datagram from unexpected source {src}");
                        stats.dropped += 1;
                        continue;
                    }
                    client_addr.get_or_insert(src);
                    deadline = Instant::now() + self.idle;

                    // A datagram that cannot be delivered is dropped, the association stays up
                    match self.forward(&buffer[..len], &mut outbound, &mut monitors, &response_tx).await {
                        Ok(()) => stats.forwarded += 1,
                        Err(e) => {
                            debug!("dropping datagram from {src}: {e}");
                            stats.dropped += 1;
                        }
                    }
                }

                // Target -> client
                Some((data, from)) = response_rx.recv() => {
                    let Some(client) = client_addr else {
                        continue;
                    };
                    deadline = Instant::now() + self.idle;

                    // Wrap with the sender's address and return to the client
                    let packet = encode_datagram(&AddressSpec::from(from), &data);
                    match self.relay_socket.send_to(&packet, client).await {
                        Ok(_) => {
                            stats.returned += 1;
                            debug!("returned {} bytes: {from} -> {client}", data.len());
                        }
                        Err(e) => {
                            debug!("failed to return datagram from {from} to {client}: {e}");
                            stats.dropped += 1;
                        }
                    }
                }

                _ = sleep_until(deadline) => {
                    debug!("UDP association idle for {:?}", self.idle);
                    break;
                }
            }
        }

        monitors.shutdown().await;
        Ok(stats)
    }

    /// forward unwraps one client datagram and sends its payload to the
    /// target. Errors concern this datagram only.
    async fn forward(
        &self,
        datagram: &[u8],
        outbound: &mut Outbound,
        monitors: &mut JoinSet<()>,
        response_tx: &mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) -> Result<()> {
        let packet = UdpPacket::decode(datagram)?;

        // Fragmentation is not supported
        if packet.frag != 0 {
            return Err(Socks5Error::protocol(format!(
                "fragmented datagram (frag {})",
                packet.frag
            )));
        }

        let target = timeout(self.resolve_timeout, packet.target.resolve())
            .await
            .map_err(|_| Socks5Error::Timeout("resolving UDP target"))??;

        // Forward to target
        let socket = outbound.socket_for(target, monitors, response_tx).await?;
        socket.send_to(packet.payload, target).await?;

        // DEBUG
        debug!("forwarded {} bytes to {target}", packet.payload.len());
        Ok(())
    }

    /// is_client checks a datagram source against the TCP client. The IP must
    /// match; the port must match the announced port, then the first sender.
    fn is_client(&self, src: SocketAddr, known: Option<SocketAddr>) -> bool {
        if src.ip().to_canonical() != self.client_ip.to_canonical() {
            return false;
        }

        match (known, self.client_port) {
            (Some(known), _) => known == src,
            (None, Some(port)) => src.port() == port,
            (None, None) => true,
        }
    }
}

/// monitor_outbound_socket forwards every reply an outbound socket receives
async fn monitor_outbound_socket(socket: Arc<UdpSocket>, response_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => {
                if response_tx.send((buffer[..len].to_vec(), from)).await.is_err() {
                    // Association ended
                    break;
                }
            }
            Err(e) => {
                debug!("outbound UDP socket error: {e}");
                break;
            }
        }
    }
}
