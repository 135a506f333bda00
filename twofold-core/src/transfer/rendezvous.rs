//! Direct TCP transport with identifiers resolved through the relay.
//!
//! The listening peer registers `{peer_id, addr}` with the relay; the
//! connecting peer resolves the id once (the relay consumes the entry) and
//! dials the address directly. Payloads never pass through the relay.
//!
//! Frames are a u32 big-endian length followed by UTF-8 text. The first
//! frame on a new connection is a [`Hello`] naming the target id and the
//! one-time ticket the relay handed out with the address. Connections
//! without a matching hello are dropped before anything is sent.

use super::{PeerChannel, PeerListener, PeerNetwork};
use crate::{Result, TwofoldError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Largest accepted frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub peer_id: String,
    pub addr: String,
    /// Random per-listen secret; only the peer that resolves the id sees it.
    pub ticket: String,
}

/// First frame sent by the connecting peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: String,
    pub target: String,
    pub ticket: String,
}

/// What an inbound hello must match.
#[derive(Debug, Clone)]
struct Expected {
    peer_id: String,
    ticket: String,
}

fn new_ticket() -> String {
    data_encoding::HEXLOWER.encode(&rand::random::<[u8; 16]>())
}

pub struct RendezvousNetwork {
    client: reqwest::Client,
    relay_url: String,
    bind_addr: SocketAddr,
    advertise_ip: Option<IpAddr>,
    connect_timeout: Duration,
}

impl RendezvousNetwork {
    pub fn new(relay_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TwofoldError::Network(e.to_string()))?;

        Ok(Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            advertise_ip: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Local address to listen on. Port 0 picks a free port.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Address announced to peers instead of the detected LAN address.
    pub fn with_advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn advertised_addr(&self, port: u16) -> SocketAddr {
        let ip = self
            .advertise_ip
            .or_else(|| (!self.bind_addr.ip().is_unspecified()).then(|| self.bind_addr.ip()))
            .or_else(detect_lan_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, port)
    }

    async fn register(&self, registration: &Registration) -> Result<()> {
        let url = format!("{}/api/v1/rendezvous", self.relay_url);
        let resp = self
            .client
            .post(&url)
            .json(registration)
            .send()
            .await
            .map_err(|e| TwofoldError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(TwofoldError::Network(format!(
                "Relay error {}: {}",
                status, body
            )));
        }
        Ok(())
    }

    async fn resolve(&self, peer_id: &str) -> Result<Registration> {
        let url = format!("{}/api/v1/rendezvous/{}", self.relay_url, peer_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TwofoldError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TwofoldError::Network(format!("Peer {} not found", peer_id)));
        }
        if !resp.status().is_success() {
            return Err(TwofoldError::Network(format!(
                "Rendezvous lookup failed: {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| TwofoldError::Network(format!("Invalid rendezvous response: {}", e)))
    }
}

/// Best guess at the address other devices on the LAN can reach. No packet
/// is sent; connecting a UDP socket only selects a route.
fn detect_lan_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[async_trait]
impl PeerNetwork for RendezvousNetwork {
    async fn listen(&self, local_id: &str) -> Result<Box<dyn PeerListener>> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let port = listener.local_addr()?.port();
        let addr = self.advertised_addr(port);
        let ticket = new_ticket();

        self.register(&Registration {
            peer_id: local_id.to_string(),
            addr: addr.to_string(),
            ticket: ticket.clone(),
        })
        .await?;
        info!("Registered peer {} at {}", local_id, addr);

        Ok(Box::new(RendezvousListener {
            listener: Some(listener),
            expected: Expected {
                peer_id: local_id.to_string(),
                ticket,
            },
            client: self.client.clone(),
            relay_url: self.relay_url.clone(),
        }))
    }

    async fn connect(&self, local_id: &str, remote_id: &str) -> Result<Box<dyn PeerChannel>> {
        let registration = self.resolve(remote_id).await?;
        let addr: SocketAddr = registration.addr.parse().map_err(|_| {
            TwofoldError::Network(format!("Invalid peer address {}", registration.addr))
        })?;

        debug!("Dialing peer {} at {}", remote_id, addr);
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TwofoldError::Network(format!(
                    "Connection to {} timed out after {}s",
                    addr,
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| TwofoldError::Network(e.to_string()))?;

        let hello = Hello {
            peer_id: local_id.to_string(),
            target: remote_id.to_string(),
            ticket: registration.ticket,
        };
        let channel = TcpChannel::open(stream, &hello).await?;
        Ok(Box::new(channel))
    }
}

pub struct RendezvousListener {
    listener: Option<TcpListener>,
    expected: Expected,
    client: reqwest::Client,
    relay_url: String,
}

impl RendezvousListener {
    fn withdraw_url(&self) -> String {
        format!("{}/api/v1/rendezvous/{}", self.relay_url, self.expected.peer_id)
    }
}

#[async_trait]
impl PeerListener for RendezvousListener {
    /// Wait for a peer that presents the right hello. Handshakes run side by
    /// side, so a silent or wrong connection never blocks the real peer.
    async fn accept(&mut self) -> Result<Box<dyn PeerChannel>> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TwofoldError::Protocol("Listener closed".to_string()))?;

        let mut handshakes = JoinSet::new();
        loop {
            tokio::select! {
                incoming = listener.accept() => {
                    let (stream, addr) = incoming?;
                    debug!("Inbound connection from {}", addr);
                    let expected = self.expected.clone();
                    handshakes.spawn(async move {
                        (addr, TcpChannel::accept(stream, &expected).await)
                    });
                }
                Some(joined) = handshakes.join_next() => match joined {
                    Ok((_, Ok(channel))) => return Ok(Box::new(channel)),
                    Ok((addr, Err(e))) => warn!("Dropped connection from {}: {}", addr, e),
                    Err(e) => warn!("Handshake task failed: {}", e),
                },
            }
        }
    }

    async fn close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }

        // The entry is gone already when a peer resolved it.
        let url = self.withdraw_url();
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Withdrew peer {} from relay", self.expected.peer_id)
            }
            Ok(resp) => debug!(
                "Withdraw of {} returned {}",
                self.expected.peer_id,
                resp.status()
            ),
            Err(e) => warn!("Failed to withdraw peer {}: {}", self.expected.peer_id, e),
        }
    }
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        if self.listener.take().is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let url = self.withdraw_url();
        runtime.spawn(async move {
            if let Err(e) = client.delete(&url).send().await {
                debug!("Withdraw on drop failed: {}", e);
            }
        });
    }
}

/// Framed channel over one TCP connection.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    remote_id: String,
}

impl TcpChannel {
    /// Outbound side: send the hello as the first frame.
    pub async fn open(mut stream: TcpStream, hello: &Hello) -> Result<Self> {
        let frame = serde_json::to_string(hello)
            .map_err(|e| TwofoldError::Protocol(format!("Invalid hello: {}", e)))?;
        write_frame(&mut stream, &frame).await?;
        Ok(Self {
            stream: Some(stream),
            remote_id: hello.target.clone(),
        })
    }

    /// Inbound side: read the hello and check it against `expected`.
    async fn accept(mut stream: TcpStream, expected: &Expected) -> Result<Self> {
        let frame = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| TwofoldError::Protocol("Peer handshake timed out".to_string()))??
            .ok_or_else(|| TwofoldError::Protocol("Peer closed during handshake".to_string()))?;

        let hello: Hello = serde_json::from_str(&frame)
            .map_err(|_| TwofoldError::Protocol("Malformed hello".to_string()))?;
        if hello.target != expected.peer_id || hello.ticket != expected.ticket {
            return Err(TwofoldError::Protocol(format!(
                "Hello from {} does not match this session",
                hello.peer_id
            )));
        }

        Ok(Self {
            stream: Some(stream),
            remote_id: hello.peer_id,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TwofoldError::Protocol("Channel closed".to_string()))
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        write_frame(self.stream()?, text).await
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        read_frame(self.stream()?).await
    }

    async fn drain(&mut self) -> Vec<String> {
        let mut extra = Vec::new();
        let Some(stream) = self.stream.as_mut() else {
            return extra;
        };
        while let Ok(Ok(Some(message))) = timeout(DRAIN_WINDOW, read_frame(stream)).await {
            extra.push(message);
        }
        extra
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of channel to {} failed: {}", self.remote_id, e);
            }
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(TwofoldError::Protocol(format!(
            "Message of {} bytes exceeds frame limit",
            bytes.len()
        )));
    }

    let write = async {
        writer.write_u32(bytes.len() as u32).await?;
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    write
        .await
        .map_err(|e| TwofoldError::Protocol(format!("Send failed: {}", e)))
}

/// Read one frame. `None` means the stream ended cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TwofoldError::Protocol(format!("Receive failed: {}", e))),
    };
    if len > MAX_FRAME_BYTES {
        return Err(TwofoldError::Protocol(format!(
            "Frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TwofoldError::Protocol(format!("Truncated frame: {}", e)))?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| TwofoldError::Protocol("Frame is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, "hello").await.unwrap();
            write_frame(&mut a, &"x".repeat(200)).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().len(), 200);
        writer.await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_BYTES + 1) as u32).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());

        let big = "x".repeat(MAX_FRAME_BYTES + 1);
        assert!(write_frame(&mut a, &big).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    fn hello(ticket: &str) -> Hello {
        Hello {
            peer_id: "initiator".to_string(),
            target: "responder".to_string(),
            ticket: ticket.to_string(),
        }
    }

    async fn bound_listener() -> (RendezvousListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let rendezvous = RendezvousListener {
            listener: Some(listener),
            expected: Expected {
                peer_id: "responder".to_string(),
                ticket: "right-ticket".to_string(),
            },
            client: reqwest::Client::new(),
            relay_url: "http://127.0.0.1:9".to_string(),
        };
        (rendezvous, addr)
    }

    #[tokio::test]
    async fn test_tcp_channel_handshake_and_drain() {
        let (mut listener, addr) = bound_listener().await;

        let server = tokio::spawn(async move {
            let mut channel = listener.accept().await.unwrap();
            assert_eq!(channel.remote_id(), "initiator");
            channel.send("payload").await.unwrap();
            channel.send("extra").await.unwrap();
            channel.close().await;
            // Keep the listener out of Drop's withdraw path
            listener.listener.take();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = TcpChannel::open(stream, &hello("right-ticket")).await.unwrap();
        assert_eq!(client.remote_id(), "responder");
        assert_eq!(client.recv().await.unwrap().as_deref(), Some("payload"));
        server.await.unwrap();
        assert_eq!(client.drain().await, vec!["extra".to_string()]);
        assert_eq!(client.recv().await.unwrap(), None);

        client.close().await;
        assert!(client.send("late").await.is_err());
    }

    #[tokio::test]
    async fn test_listener_ignores_peers_without_ticket() {
        let (mut listener, addr) = bound_listener().await;
        let server = tokio::spawn(async move {
            let mut channel = listener.accept().await.unwrap();
            let remote = channel.remote_id().to_string();
            channel.send("secret payload").await.unwrap();
            channel.close().await;
            listener.listener.take();
            remote
        });

        // Connects and never speaks; must not hold up the real peer
        let _silent = TcpStream::connect(addr).await.unwrap();

        let mut stranger = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stranger, "scanner").await.unwrap();
        assert!(!matches!(read_frame(&mut stranger).await, Ok(Some(_))));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut wrong = TcpChannel::open(stream, &hello("guessed")).await.unwrap();
        assert!(!matches!(wrong.recv().await, Ok(Some(_))));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut peer = TcpChannel::open(stream, &hello("right-ticket")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_deref(), Some("secret payload"));
        assert_eq!(server.await.unwrap(), "initiator");
    }

    #[test]
    fn test_tickets_are_unique() {
        let a = new_ticket();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_ticket());
    }

    #[test]
    fn test_advertised_addr_prefers_explicit_ip() {
        let network = RendezvousNetwork::new("http://relay.example")
            .unwrap()
            .with_advertise_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(network.advertised_addr(4000).to_string(), "10.0.0.7:4000");

        let bound = RendezvousNetwork::new("http://relay.example/")
            .unwrap()
            .with_bind_addr("127.0.0.1:0".parse().unwrap());
        assert_eq!(bound.relay_url, "http://relay.example");
        assert_eq!(bound.advertised_addr(5000).to_string(), "127.0.0.1:5000");
    }
}
