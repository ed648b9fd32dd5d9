use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use log::trace;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::Result;

/// MatchFuncs as described in RFC7983
/// <https://tools.ietf.org/html/rfc7983>
///              +----------------+
///              |        [0..3] -+--> forward to STUN
///              |                |
///  packet -->  |      [20..63] -+--> forward to DTLS
///              +----------------+
fn match_range(lower: u8, upper: u8, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let b = buf[0];
    b >= lower && b <= upper
}

/// match_stun accepts packets with the first byte in [0..3].
pub fn match_stun(buf: &[u8]) -> bool {
    match_range(0, 3, buf)
}

/// match_dtls accepts packets with the first byte in [20..63].
pub fn match_dtls(buf: &[u8]) -> bool {
    match_range(20, 63, buf)
}

/// Per-peer view over the session's shared UDP socket. Outbound sends go
/// to the current remote target; inbound non-STUN datagrams are handed to
/// the view's consumer (the DTLS collaborator). The target is mutable so
/// the consumer keeps its identity when a higher-priority candidate
/// redirects the session.
pub struct UnicastView {
    socket: Arc<UdpSocket>,
    remote: Mutex<SocketAddr>,
    inbound_tx: mpsc::UnboundedSender<BytesMut>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<BytesMut>>>,
}

impl UnicastView {
    pub(crate) fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(UnicastView {
            socket,
            remote: Mutex::new(remote),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        *self.remote.lock().unwrap()
    }

    pub(crate) fn set_remote(&self, remote: SocketAddr) {
        let mut current = self.remote.lock().unwrap();
        if *current != remote {
            trace!("unicast view redirected {} -> {remote}", *current);
            *current = remote;
        }
    }

    /// Sends a datagram to the view's current remote target.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        let remote = self.remote();
        Ok(self.socket.send_to(payload, remote).await?)
    }

    /// The inbound side of the view, handed to the consumer exactly once.
    pub(crate) fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BytesMut>> {
        self.inbound_rx.lock().unwrap().take()
    }

    /// Multiplexes an inbound datagram to the consumer.
    pub(crate) fn deliver(&self, datagram: BytesMut) {
        if self.inbound_tx.send(datagram).is_err() {
            trace!("dropping datagram, view consumer is gone");
        }
    }
}

#[cfg(test)]
mod view_test {
    use super::*;

    #[test]
    fn test_first_byte_demux() {
        assert!(match_stun(&[0x00, 0x01]));
        assert!(match_stun(&[0x01]));
        assert!(!match_stun(&[0x16]));
        assert!(!match_stun(&[]));

        assert!(match_dtls(&[0x16, 0xfe, 0xfd]));
        assert!(match_dtls(&[22]));
        assert!(match_dtls(&[63]));
        assert!(!match_dtls(&[0x00]));
        assert!(!match_dtls(&[64]));
    }
}
