//! End-to-end runs of the session pipeline against mock DTLS/SCTP
//! collaborators and a scripted browser-side STUN peer on loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;

use rtc_data_endpoint::endpoint::{Endpoint, EndpointConfig, EndpointEvent, Transports};
use rtc_data_endpoint::error::{Error, Result};
use rtc_data_endpoint::fingerprint::fingerprint;
use rtc_data_endpoint::signal::{CandidateBody, OfferBody, Signalling};
use rtc_data_endpoint::transport::{
    AddressDiscovery, DtlsConn, DtlsConnector, DtlsLink, SctpAssociation, SctpCommand, SctpEvent,
    SctpListener,
};
use rtc_data_endpoint::SessionState;

const PEER_UFRAG: &str = "A1b2";
const PEER_PWD: &str = "abcdefghij0123456789AB";

struct StaticDiscovery {
    internal: Ipv4Addr,
    public: Ipv4Addr,
}

impl AddressDiscovery for StaticDiscovery {
    fn public_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>> {
        let ip = self.public;
        Box::pin(async move { Ok(ip) })
    }

    fn internal_ipv4(&self) -> BoxFuture<'static, Result<Ipv4Addr>> {
        let ip = self.internal;
        Box::pin(async move { Ok(ip) })
    }
}

/// Presents `peer_cert_der` to the session's verifier; succeeds with idle
/// channels when the fingerprint matches.
struct MockDtls {
    peer_cert_der: Vec<u8>,
}

impl DtlsConnector for MockDtls {
    fn connect(&self, conn: DtlsConn) -> BoxFuture<'static, Result<DtlsLink>> {
        let verified = (conn.verify_peer)(&self.peer_cert_der);
        Box::pin(async move {
            if !verified {
                return Err(Error::DtlsHandshake(
                    "peer certificate fingerprint mismatch".to_owned(),
                ));
            }
            let (outbound, wire_out) = mpsc::unbounded_channel();
            let (wire_in, inbound) = mpsc::unbounded_channel();
            let (closed_tx, closed) = oneshot::channel();
            // Keep the far ends alive for the session's lifetime.
            tokio::spawn(async move {
                let _wire_out = wire_out;
                let _wire_in = wire_in;
                let _closed_tx = closed_tx;
                std::future::pending::<()>().await;
            });
            Ok(DtlsLink {
                outbound,
                inbound,
                closed,
            })
        })
    }
}

/// Hands out an association pre-wired to the test's channel ends.
struct MockSctp {
    association: Mutex<Option<SctpAssociation>>,
}

impl SctpListener for MockSctp {
    fn listen(&self, _link: DtlsLink, port: u16) -> BoxFuture<'static, Result<SctpAssociation>> {
        assert_eq!(port, 5000);
        let association = self.association.lock().unwrap().take();
        Box::pin(async move {
            association.ok_or_else(|| Error::SctpTransport("listen called twice".to_owned()))
        })
    }
}

struct Harness {
    endpoint: Endpoint,
    signalling: Signalling,
    events: mpsc::UnboundedReceiver<EndpointEvent>,
    sctp_events_tx: mpsc::UnboundedSender<SctpEvent>,
    sctp_control_rx: mpsc::UnboundedReceiver<SctpCommand>,
    /// Fingerprint hash of the certificate the mock DTLS peer presents.
    peer_fingerprint: String,
}

fn certificate() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = rcgen::CertificateParams::new(vec!["rtc-data-endpoint".to_owned()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    (
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
        cert.der().to_vec(),
    )
}

/// Builds an endpoint over mocks. `honest_peer` controls whether the mock
/// DTLS peer presents the certificate the offer will pin.
fn harness(discovery: StaticDiscovery, honest_peer: bool) -> Harness {
    let (certificate_pem, private_key_pem, _) = certificate();
    let (_, _, peer_der) = certificate();
    let (_, _, other_der) = certificate();

    let peer_fingerprint = fingerprint(&peer_der);
    let presented = if honest_peer { peer_der } else { other_der };

    let (sctp_events_tx, events) = mpsc::unbounded_channel();
    let (control, sctp_control_rx) = mpsc::unbounded_channel();
    let association = SctpAssociation { events, control };

    let (endpoint, events) = Endpoint::new(
        EndpointConfig {
            certificate_pem,
            private_key_pem,
        },
        Transports {
            discovery: std::sync::Arc::new(discovery),
            dtls: std::sync::Arc::new(MockDtls {
                peer_cert_der: presented,
            }),
            sctp: std::sync::Arc::new(MockSctp {
                association: Mutex::new(Some(association)),
            }),
        },
    )
    .unwrap();

    Harness {
        signalling: Signalling::new(endpoint.clone()),
        endpoint,
        events,
        sctp_events_tx,
        sctp_control_rx,
        peer_fingerprint,
    }
}

fn offer_sdp(fingerprint_value: &str, candidate: Option<SocketAddr>) -> String {
    let mut lines = vec![
        "v=0".to_owned(),
        "o=- 4611731400430051336 2 IN IP4 127.0.0.1".to_owned(),
        "s=-".to_owned(),
        "t=0 0".to_owned(),
        "a=group:BUNDLE data".to_owned(),
        "a=msid-semantic: WMS".to_owned(),
        format!("a=fingerprint:sha-256 {fingerprint_value}"),
        "m=application 9 DTLS/SCTP 5000".to_owned(),
        "c=IN IP4 0.0.0.0".to_owned(),
        format!("a=ice-ufrag:{PEER_UFRAG}"),
        format!("a=ice-pwd:{PEER_PWD}"),
        "a=mid:data".to_owned(),
        "a=sctpmap:5000 webrtc-datachannel 1024".to_owned(),
    ];
    if let Some(addr) = candidate {
        lines.push(format!(
            "a=candidate:0 1 UDP 2122252543 {} {} typ host",
            addr.ip(),
            addr.port()
        ));
    }
    lines.push(String::new());
    lines.join("\r\n")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<EndpointEvent>) -> EndpointEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an endpoint event")
        .expect("event stream ended")
}

/// Plays the browser side of one connectivity check: receives a binding
/// request on `socket` and answers it with a success response keyed by
/// the browser's password.
async fn answer_one_check(socket: &UdpSocket) -> SocketAddr {
    let mut buf = vec![0u8; 1500];
    let (n, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a connectivity check")
        .unwrap();

    let mut check = Message {
        raw: buf[..n].to_vec(),
        ..Default::default()
    };
    check.decode().unwrap();
    assert_eq!(check.typ, BINDING_REQUEST);

    let mut response = Message::new();
    response
        .build(&[
            Box::new(check.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: from.ip(),
                port: from.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                PEER_PWD.to_owned(),
            )),
            Box::new(FINGERPRINT),
        ])
        .unwrap();
    socket.send_to(&response.raw, from).await.unwrap();
    from
}

#[tokio::test]
async fn test_offer_produces_answer() {
    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::new(10, 0, 0, 2),
            public: Ipv4Addr::new(203, 0, 113, 7),
        },
        true,
    );

    let answer = harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, None),
        })
        .await
        .unwrap();
    assert_eq!(answer.kind, "answer");

    let session = harness
        .endpoint
        .session_by_peer_ufrag(PEER_UFRAG)
        .expect("session registered under the peer ufrag");
    assert_eq!(session.state(), SessionState::Listening);
    assert_eq!(harness.endpoint.size(), 1);

    let port = session.port().unwrap();
    let sdp = answer.sdp;
    assert!(sdp.contains("a=setup:active\r\n"));
    assert!(sdp.contains("m=application 9 DTLS/SCTP 5000\r\n"));
    assert!(sdp.contains(&format!(
        "a=fingerprint:sha-256 {}\r\n",
        harness.endpoint.fingerprint()
    )));
    assert!(sdp.contains(&format!(
        "a=candidate:0 1 UDP 2113937151 10.0.0.2 {port} typ host\r\n"
    )));
    assert!(sdp.contains(&format!(
        "a=candidate:1 1 UDP 1677729535 203.0.113.7 {port} typ srflx raddr 10.0.0.2 rport {port}\r\n"
    )));

    // Fresh 4-char ufrag and 22-char password over the ice alphabet.
    assert_eq!(session.local_ufrag().len(), 4);
    assert_eq!(session.local_pwd().len(), 22);
    assert!(sdp.contains(&format!("a=ice-ufrag:{}\r\n", session.local_ufrag())));
    assert!(sdp.contains(&format!("a=ice-pwd:{}\r\n", session.local_pwd())));
    for c in session.local_ufrag().chars() {
        assert!(c.is_ascii_alphanumeric() || c == '+' || c == '/');
    }
}

#[tokio::test]
async fn test_offer_without_data_section_is_rejected() {
    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        true,
    );

    let sdp = [
        "v=0",
        "o=- 1 2 IN IP4 127.0.0.1",
        "s=-",
        "t=0 0",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        "c=IN IP4 0.0.0.0",
        "a=ice-ufrag:A1b2",
        "a=ice-pwd:abcdefghij0123456789AB",
        "",
    ]
    .join("\r\n");

    let err = harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOffer(_)), "got {err}");

    // The aborted session must not linger in the registry.
    assert_eq!(harness.endpoint.size(), 0);
}

#[tokio::test]
async fn test_wrong_body_type_is_rejected() {
    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        true,
    );

    let err = harness
        .signalling
        .offer(OfferBody {
            kind: "answer".to_owned(),
            sdp: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignallingBadRequest(_)));
}

#[tokio::test]
async fn test_trickled_candidate_updates_primary() {
    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        true,
    );

    harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, None),
        })
        .await
        .unwrap();
    let session = harness.endpoint.session_by_peer_ufrag(PEER_UFRAG).unwrap();
    assert_eq!(session.primary_candidate(), None);

    harness
        .signalling
        .candidate(CandidateBody {
            ip: "1.1.1.1".to_owned(),
            port: 1000,
            username: PEER_UFRAG.to_owned(),
            priority: 50,
        })
        .await
        .unwrap();
    assert_eq!(
        session.primary_candidate(),
        Some("1.1.1.1:1000".parse().unwrap())
    );

    harness
        .signalling
        .candidate(CandidateBody {
            ip: "2.2.2.2".to_owned(),
            port: 2000,
            username: PEER_UFRAG.to_owned(),
            priority: 100,
        })
        .await
        .unwrap();
    assert_eq!(
        session.primary_candidate(),
        Some("2.2.2.2:2000".parse().unwrap())
    );

    // Unknown ufrags are acknowledged without effect.
    harness
        .signalling
        .candidate(CandidateBody {
            ip: "3.3.3.3".to_owned(),
            port: 3000,
            username: "nope".to_owned(),
            priority: 999,
        })
        .await
        .unwrap();
    assert_eq!(
        session.primary_candidate(),
        Some("2.2.2.2:2000".parse().unwrap())
    );
}

#[tokio::test]
async fn test_candidates_signalling_path() {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;

    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::new(10, 0, 0, 2),
            public: Ipv4Addr::new(203, 0, 113, 7),
        },
        true,
    );

    harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, None),
        })
        .await
        .unwrap();
    let session = harness.endpoint.session_by_peer_ufrag(PEER_UFRAG).unwrap();
    let port = session.port().unwrap();

    let entries = harness
        .signalling
        .candidates(&BASE64_STANDARD.encode(PEER_UFRAG))
        .await
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[0].candidate,
        format!("candidate:0 1 UDP 2113937151 10.0.0.2 {port} typ host")
    );
    assert_eq!(
        entries[1].candidate,
        format!(
            "candidate:1 1 UDP 1677729535 203.0.113.7 {port} typ srflx raddr 10.0.0.2 rport {port}"
        )
    );
    for entry in &entries {
        assert_eq!(entry.sdp_m_line_index, 0);
        assert_eq!(entry.sdp_mid, "data");
        assert_eq!(entry.username_fragment, session.local_ufrag());
    }

    let err = harness.signalling.candidates("!!!").await.unwrap_err();
    assert!(matches!(err, Error::SignallingBadRequest(_)));
}

#[tokio::test]
async fn test_pipeline_reaches_data_channel() {
    let mut harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        true,
    );

    // The browser side: one UDP socket that the offer advertises inline.
    let browser = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let browser_addr = browser.local_addr().unwrap();

    harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, Some(browser_addr)),
        })
        .await
        .unwrap();
    let session = harness.endpoint.session_by_peer_ufrag(PEER_UFRAG).unwrap();
    let mut states = session.state_changes();

    // The periodic check arrives within a second; answering it completes
    // ICE and starts the DTLS/SCTP ladder.
    answer_one_check(&browser).await;

    timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow_and_update() == SessionState::SctpReady {
                break;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("session never became sctp-ready");

    // An incoming SCTP stream is mirrored and surfaced as a channel.
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    harness
        .sctp_events_tx
        .send(SctpEvent::Stream { id: 1, rx: stream_rx })
        .unwrap();

    let SctpCommand::CreateStream { id, reply } =
        timeout(Duration::from_secs(5), harness.sctp_control_rx.recv())
            .await
            .expect("timed out waiting for the mirrored stream")
            .unwrap();
    assert_eq!(id, 1);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    reply.send(out_tx).unwrap();

    let mut channel = loop {
        if let EndpointEvent::ChannelOpen { channel, .. } = next_event(&mut harness.events).await {
            break channel;
        }
    };
    assert_eq!(channel.stream_id(), 1);
    assert!(channel.negotiated());

    channel.send(Bytes::from_static(b"hello")).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap(),
        Some(Bytes::from_static(b"hello"))
    );

    stream_tx.send(Bytes::from_static(b"world")).unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap(),
        Some(Bytes::from_static(b"world"))
    );
}

#[tokio::test]
async fn test_fingerprint_mismatch_fails_only_its_session() {
    // The mock peer presents a certificate other than the pinned one.
    let mut harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        false,
    );

    let browser = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let browser_addr = browser.local_addr().unwrap();

    harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, Some(browser_addr)),
        })
        .await
        .unwrap();
    let session = harness.endpoint.session_by_peer_ufrag(PEER_UFRAG).unwrap();

    // A sibling session that must stay untouched.
    let sibling = harness.endpoint.create_session();
    assert_eq!(harness.endpoint.size(), 2);

    answer_one_check(&browser).await;

    let error = loop {
        match next_event(&mut harness.events).await {
            EndpointEvent::SessionError { session: id, error } => {
                assert_eq!(id, session.id());
                break error;
            }
            EndpointEvent::ChannelOpen { .. } => panic!("channel opened despite bad fingerprint"),
            _ => {}
        }
    };
    assert!(error.contains("dtls"), "unexpected error: {error}");

    // The handshake failure never advanced the session past ICE; it is
    // torn down and removed, the sibling is unaffected.
    loop {
        if let EndpointEvent::SessionClosed { session: id } =
            next_event(&mut harness.events).await
        {
            assert_eq!(id, session.id());
            break;
        }
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(harness.endpoint.size(), 1);
    assert_eq!(sibling.state(), SessionState::New);
}

#[tokio::test]
async fn test_close_removes_session() {
    let harness = harness(
        StaticDiscovery {
            internal: Ipv4Addr::LOCALHOST,
            public: Ipv4Addr::LOCALHOST,
        },
        true,
    );

    harness
        .signalling
        .offer(OfferBody {
            kind: "offer".to_owned(),
            sdp: offer_sdp(&harness.peer_fingerprint, None),
        })
        .await
        .unwrap();
    let session = harness.endpoint.session_by_peer_ufrag(PEER_UFRAG).unwrap();
    assert_eq!(harness.endpoint.size(), 1);

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(harness.endpoint.size(), 0);

    // Closing twice is a no-op.
    session.close();
    assert_eq!(harness.endpoint.size(), 0);
}
