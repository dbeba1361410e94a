//! The server link: TCP or UDP, plus the rotation policy that decides which
//! server to try next.
//!
//! A [`Link`] moves whole envelopes. On TCP it reassembles the length-framed
//! stream through the shared extraction routine; on UDP every datagram is one
//! envelope. The caller never sees partial packets.
//!
//! [`ServerRotation`] implements the retry ladder: a random server from the
//! configured list, a bounded number of attempts against it, then the next
//! random server, and a hard failure once the list is exhausted. The caller
//! owns the pause between attempts.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::codec::PacketCodec;
use crate::core::consts::MAX_PACKET_SIZE;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::transport::proxy::{self, ProxySettings};

/// Connect attempts against one server before moving to the next.
pub const ATTEMPTS_PER_SERVER: u32 = 4;

/// One established server connection.
pub enum Link {
    Tcp(Framed<TcpStream, PacketCodec>),
    Udp(UdpSocket),
}

impl Link {
    /// Open a link to `addr`. A configured proxy forces TCP; the wire
    /// format differs per transport so the link remembers which it is.
    pub async fn connect(
        addr: SocketAddr,
        use_tcp: bool,
        proxy: Option<&ProxySettings>,
    ) -> Result<Link> {
        if let Some(settings) = proxy {
            let stream = proxy::connect_via(settings, &addr.ip().to_string(), addr.port()).await?;
            return Ok(Link::Tcp(Framed::new(stream, PacketCodec)));
        }
        if use_tcp {
            let stream = TcpStream::connect(addr).await?;
            info!(%addr, "tcp link up");
            Ok(Link::Tcp(Framed::new(stream, PacketCodec)))
        } else {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            info!(%addr, "udp link up");
            Ok(Link::Udp(socket))
        }
    }

    /// Encode `packet` in this link's framing. The bytes are also what the
    /// transaction tracker stores for resends.
    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        match self {
            Link::Tcp(_) => packet.encode_stream().to_vec(),
            Link::Udp(_) => packet.encode_datagram().to_vec(),
        }
    }

    pub async fn send_bytes(&mut self, wire: &[u8]) -> Result<()> {
        match self {
            Link::Tcp(framed) => framed.send(Bytes::copy_from_slice(wire)).await,
            Link::Udp(socket) => {
                let n = socket.send(wire).await?;
                if n != wire.len() {
                    warn!(sent = n, len = wire.len(), "short datagram send");
                }
                Ok(())
            }
        }
    }

    /// Next whole envelope from the wire. On TCP a clean EOF maps to
    /// [`ProtocolError::ConnectionClosed`]. On UDP a malformed datagram is
    /// dropped and the read continues; the stream path resynchronizes inside
    /// the codec instead.
    pub async fn recv(&mut self) -> Result<Packet> {
        match self {
            Link::Tcp(framed) => match framed.next().await {
                Some(packet) => packet,
                None => Err(ProtocolError::ConnectionClosed),
            },
            Link::Udp(socket) => {
                let mut buf = vec![0u8; MAX_PACKET_SIZE];
                loop {
                    let n = socket.recv(&mut buf).await?;
                    match Packet::decode_datagram(Bytes::copy_from_slice(&buf[..n])) {
                        Ok(packet) => return Ok(packet),
                        Err(e) => {
                            debug!(len = n, error = %e, "dropping bad datagram");
                        }
                    }
                }
            }
        }
    }
}

/// Walks the configured server list: random order, a fixed number of
/// attempts per server, [`ProtocolError::ServersExhausted`] at the end.
pub struct ServerRotation {
    remaining: Vec<String>,
    current: Option<String>,
    attempts_left: u32,
    attempts_per_server: u32,
}

impl ServerRotation {
    pub fn new(servers: Vec<String>, attempts_per_server: u32) -> Self {
        Self {
            remaining: servers,
            current: None,
            attempts_left: 0,
            attempts_per_server: attempts_per_server.max(1),
        }
    }

    /// Host for the next connect attempt, or an error once every server has
    /// used up its budget.
    pub fn next_attempt(&mut self) -> Result<&str> {
        if self.attempts_left == 0 {
            if self.remaining.is_empty() {
                warn!("every configured server exhausted");
                return Err(ProtocolError::ServersExhausted);
            }
            let idx = rand::rng().random_range(0..self.remaining.len());
            let server = self.remaining.swap_remove(idx);
            debug!(server = %server, "rotating to server");
            self.current = Some(server);
            self.attempts_left = self.attempts_per_server;
        }
        self.attempts_left -= 1;
        Ok(self.current.as_deref().unwrap_or_default())
    }
}
