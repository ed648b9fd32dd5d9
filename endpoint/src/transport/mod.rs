//! Contracts for the services the core consumes: address discovery, the
//! DTLS implementation and the SCTP implementation. The session drives
//! them through these narrow interfaces; mocks implement the same
//! contracts in tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

pub mod view;

pub use view::UnicastView;

/// Discovers the addresses advertised in answers and on the legacy
/// candidates signalling path.
pub trait AddressDiscovery: Send + Sync + 'static {
    fn public_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>>;
    fn internal_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>>;
}

/// Default discovery: the internal address comes from the route a
/// connected UDP socket would take (no packets are sent); the public
/// address must be configured, or falls back to the internal one for
/// single-network deployments.
#[derive(Debug, Default)]
pub struct SystemDiscovery {
    pub public_override: Option<Ipv4Addr>,
}

async fn route_probe_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(Error::Discovery("no IPv4 route".to_owned())),
    }
}

impl AddressDiscovery for SystemDiscovery {
    fn public_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>> {
        match self.public_override {
            Some(address) => Box::pin(async move { Ok(address) }),
            None => Box::pin(route_probe_ipv4()),
        }
    }

    fn internal_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>> {
        Box::pin(route_probe_ipv4())
    }
}

/// Peer certificate predicate: gets the raw peer certificate, answers
/// whether its fingerprint matches the offer-declared one.
pub type PeerVerifier = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Everything the DTLS collaborator needs to run the handshake as the
/// client over the session's unicast view.
pub struct DtlsConn {
    /// Outbound datagrams go through the view; it follows candidate
    /// redirects without the collaborator noticing.
    pub view: Arc<UnicastView>,
    /// Inbound non-STUN datagrams from the session socket.
    pub inbound: mpsc::UnboundedReceiver<BytesMut>,
    /// Endpoint certificate, DER.
    pub certificate: Bytes,
    /// Endpoint private key, PEM as configured.
    pub private_key: Bytes,
    pub verify_peer: PeerVerifier,
}

/// An established DTLS connection: the cleartext duplex the SCTP layer
/// runs over, plus a close notification. A dropped `closed` sender means
/// a clean shutdown; an error value means the record layer failed.
pub struct DtlsLink {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
    pub closed: oneshot::Receiver<Error>,
}

/// The DTLS implementation. `connect` resolves when the handshake
/// completes and the peer certificate passed verification.
pub trait DtlsConnector: Send + Sync + 'static {
    fn connect(&self, conn: DtlsConn) -> BoxFuture<'static, Result<DtlsLink>>;
}

/// Events from a listening SCTP association.
pub enum SctpEvent {
    /// An incoming stream and its inbound message flow.
    Stream {
        id: u16,
        rx: mpsc::UnboundedReceiver<Bytes>,
    },
    Error(Error),
    Closed,
}

/// Commands into the association.
pub enum SctpCommand {
    /// Open the outbound stream mirroring an incoming one; the reply
    /// carries the stream's send side.
    CreateStream {
        id: u16,
        reply: oneshot::Sender<mpsc::UnboundedSender<Bytes>>,
    },
}

/// Handle to a listening SCTP association.
pub struct SctpAssociation {
    pub events: mpsc::UnboundedReceiver<SctpEvent>,
    pub control: mpsc::UnboundedSender<SctpCommand>,
}

/// The SCTP implementation. `listen` brings the association up over the
/// established DTLS link and resolves once it is accepting streams.
pub trait SctpListener: Send + Sync + 'static {
    fn listen(&self, link: DtlsLink, port: u16) -> BoxFuture<'static, Result<SctpAssociation>>;
}

/// A negotiated bidirectional data channel: a pair of SCTP streams
/// sharing one stream id, pre-agreed on both sides, so no in-band open
/// handshake is needed.
pub struct DataChannel {
    stream_id: u16,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl DataChannel {
    pub(crate) fn new(
        stream_id: u16,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        DataChannel { stream_id, tx, rx }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn negotiated(&self) -> bool {
        true
    }

    /// Queues a message onto the outbound stream.
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.tx.send(data).map_err(|_| Error::SessionClosed)
    }

    /// The next message from the inbound stream; `None` once the channel
    /// is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}
