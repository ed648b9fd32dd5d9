//! Placeholder DTLS/SCTP collaborators. They complete the session
//! pipeline with idle links so the signalling and ICE surface can be
//! exercised end to end; wire real implementations for browser interop.

use futures_util::future::BoxFuture;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use rtc_data_endpoint::error::Result;
use rtc_data_endpoint::transport::{
    DtlsConn, DtlsConnector, DtlsLink, SctpAssociation, SctpCommand, SctpEvent, SctpListener,
};

pub struct StubDtls;

impl DtlsConnector for StubDtls {
    fn connect(&self, conn: DtlsConn) -> BoxFuture<'static, Result<DtlsLink>> {
        info!("stub dtls: pretending to handshake with {}", conn.view.remote());
        Box::pin(async move {
            let (outbound, wire_out) = mpsc::unbounded_channel();
            let (wire_in, inbound) = mpsc::unbounded_channel();
            let (closed_tx, closed) = oneshot::channel();
            // Drain the view until the session drops it, keeping the link
            // ends alive meanwhile.
            tokio::spawn(async move {
                let mut conn = conn;
                let _wire_out = wire_out;
                let _wire_in = wire_in;
                let _closed_tx = closed_tx;
                while let Some(datagram) = conn.inbound.recv().await {
                    debug!("stub dtls: discarding {} inbound bytes", datagram.len());
                }
            });
            Ok(DtlsLink {
                outbound,
                inbound,
                closed,
            })
        })
    }
}

pub struct StubSctp;

impl SctpListener for StubSctp {
    fn listen(&self, _link: DtlsLink, port: u16) -> BoxFuture<'static, Result<SctpAssociation>> {
        info!("stub sctp: listening on port {port}");
        Box::pin(async move {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (control, mut control_rx) = mpsc::unbounded_channel();

            // Announce one negotiated stream and loop every mirrored
            // stream's outbound data back into it.
            let (stream_tx, stream_rx) = mpsc::unbounded_channel();
            let _ = events_tx.send(SctpEvent::Stream { id: 0, rx: stream_rx });

            tokio::spawn(async move {
                let _events_tx = events_tx;
                while let Some(SctpCommand::CreateStream { id, reply }) = control_rx.recv().await {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let _ = reply.send(tx);
                    let loopback = stream_tx.clone();
                    tokio::spawn(async move {
                        while let Some(data) = rx.recv().await {
                            debug!("stub sctp: echoing {} bytes on stream {id}", data.len());
                            if loopback.send(data).is_err() {
                                break;
                            }
                        }
                    });
                }
            });

            Ok(SctpAssociation { events, control })
        })
    }
}
