use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};

use crate::endpoint::{EndpointEvent, EndpointShared};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::ice::agent::{StunAgent, StunOutcome};
use crate::ice::candidate::{CandidateKind, CandidateSet, LocalCandidate};
use crate::ice::rand::{generate_pwd, generate_ufrag};
use crate::sdp;
use crate::transport::view::{match_stun, UnicastView};
use crate::transport::{
    DataChannel, DtlsConn, DtlsLink, PeerVerifier, SctpAssociation, SctpCommand, SctpEvent,
};

/// Interval of the periodic connectivity check.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Socket receive buffer; data-channel traffic stays well under this.
const RECEIVE_MTU: usize = 2000;

pub type SessionId = u64;

/// Session lifecycle. States only move forward, except that any state may
/// fall into `Closed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    New,
    Offered,
    Listening,
    IceConnected,
    DtlsConnected,
    SctpReady,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::Offered => "offered",
            SessionState::Listening => "listening",
            SessionState::IceConnected => "ice-connected",
            SessionState::DtlsConnected => "dtls-connected",
            SessionState::SctpReady => "sctp-ready",
            SessionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Peer-side parameters captured from the offer; immutable afterwards.
struct Negotiated {
    peer_ufrag: String,
    peer_pwd: String,
    peer_fingerprint: String,
    mid: String,
}

/// Networking state behind one lock: a trickled candidate must update the
/// unicast view target in the same critical section as the set insertion.
struct Link {
    socket: Option<Arc<UdpSocket>>,
    candidates: CandidateSet,
    view: Option<Arc<UnicastView>>,
}

pub(crate) struct SessionShared {
    id: SessionId,
    local_ufrag: String,
    local_pwd: String,
    endpoint: Weak<EndpointShared>,
    state_tx: watch::Sender<SessionState>,
    negotiated: OnceLock<Negotiated>,
    answer: OnceLock<String>,
    port: OnceLock<u16>,
    link: Mutex<Link>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Moves the state machine forward; transitions never skip back and
    /// `Closed` is entered through `close` only.
    fn advance(&self, to: SessionState) {
        self.state_tx.send_modify(|state| {
            if *state != SessionState::Closed && *state < to && to != SessionState::Closed {
                debug!("session {}: {} -> {}", self.id, state, to);
                *state = to;
            }
        });
    }

    fn emit(&self, event: EndpointEvent) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.emit(event);
        }
    }

    fn fail(&self, err: &Error) {
        if matches!(err, Error::SessionClosed) {
            // Peer went away; teardown without an error event.
            return;
        }
        warn!("session {}: {err}", self.id);
        self.emit(EndpointEvent::SessionError {
            session: self.id,
            error: err.to_string(),
        });
    }

    /// Terminal transition: releases the socket and the sub-agents hanging
    /// off it, then removes the session from the endpoint registry.
    fn close(&self) {
        let mut already_closed = false;
        self.state_tx.send_modify(|state| {
            if *state == SessionState::Closed {
                already_closed = true;
            } else {
                *state = SessionState::Closed;
            }
        });
        if already_closed {
            return;
        }

        {
            let mut link = self.link.lock().unwrap();
            link.socket = None;
            link.view = None;
        }

        debug!("session {} closed", self.id);
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_session(self.id);
            endpoint.emit(EndpointEvent::SessionClosed { session: self.id });
        }
    }
}

/// One negotiated connection: owns the UDP socket and the STUN, DTLS and
/// SCTP sub-agents constructed as the pipeline advances. Handles are
/// cheap clones sharing the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(id: SessionId, endpoint: Weak<EndpointShared>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::New);
        Session {
            shared: Arc::new(SessionShared {
                id,
                local_ufrag: generate_ufrag(),
                local_pwd: generate_pwd(),
                endpoint,
                state_tx,
                negotiated: OnceLock::new(),
                answer: OnceLock::new(),
                port: OnceLock::new(),
                link: Mutex::new(Link {
                    socket: None,
                    candidates: CandidateSet::default(),
                    view: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watches state transitions; useful for hosts awaiting connectivity.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn local_ufrag(&self) -> &str {
        &self.shared.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.shared.local_pwd
    }

    /// The cached answer, available once `create_answer` succeeded.
    pub fn answer(&self) -> Option<&str> {
        self.shared.answer.get().map(String::as_str)
    }

    /// Local UDP port, bound during `create_answer`.
    pub fn port(&self) -> Option<u16> {
        self.shared.port.get().copied()
    }

    pub(crate) fn peer_ufrag(&self) -> Option<&str> {
        self.shared.negotiated.get().map(|n| n.peer_ufrag.as_str())
    }

    /// Current connectivity-check target: the candidate set's primary.
    /// The unicast view's remote target always equals this.
    pub fn primary_candidate(&self) -> Option<SocketAddr> {
        let link = self.shared.link.lock().unwrap();
        link.candidates.primary().ok().map(|c| c.addr())
    }

    /// Applies the peer's offer: captures credentials and fingerprint,
    /// seeds the candidate set, binds the UDP socket and produces the
    /// answer, leaving the session listening for connectivity checks.
    pub async fn create_answer(&self, offer: &str) -> Result<String> {
        let shared = &self.shared;
        if shared.state() != SessionState::New {
            return Err(Error::InvalidOffer("session already negotiated".to_owned()));
        }

        let view = sdp::parse(offer)?;
        let media = view
            .media
            .iter()
            .find(|m| m.protocol.contains("DTLS/SCTP"))
            .ok_or_else(|| Error::InvalidOffer("no DTLS/SCTP media section".to_owned()))?;
        let peer_ufrag = media
            .ice_ufrag
            .clone()
            .ok_or_else(|| Error::InvalidOffer("missing ice-ufrag".to_owned()))?;
        let peer_pwd = media
            .ice_pwd
            .clone()
            .ok_or_else(|| Error::InvalidOffer("missing ice-pwd".to_owned()))?;
        let peer_fingerprint = view
            .fingerprint
            .clone()
            .or_else(|| media.fingerprint.clone())
            .ok_or_else(|| Error::InvalidOffer("missing fingerprint".to_owned()))?;
        let mid = view
            .groups
            .first()
            .and_then(|g| g.mids.first().cloned())
            .unwrap_or_else(|| sdp::DEFAULT_MID.to_owned());

        debug!(
            "session {}: offer from peer ufrag {peer_ufrag}, mid {mid}",
            shared.id
        );
        shared
            .negotiated
            .set(Negotiated {
                peer_ufrag,
                peer_pwd,
                peer_fingerprint: peer_fingerprint.value,
                mid,
            })
            .map_err(|_| Error::InvalidOffer("offer already applied".to_owned()))?;

        {
            let mut link = shared.link.lock().unwrap();
            for c in &media.candidates {
                link.candidates.push(c.address, c.port, c.priority);
            }
        }
        shared.advance(SessionState::Offered);

        let endpoint = shared.endpoint.upgrade().ok_or(Error::SessionClosed)?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let port = socket.local_addr()?.port();
        let _ = shared.port.set(port);
        shared.link.lock().unwrap().socket = Some(socket.clone());

        let (internal_ip, public_ip) = endpoint.addresses().await?;
        let candidates = [
            LocalCandidate {
                address: internal_ip,
                port,
                kind: CandidateKind::Host,
            },
            LocalCandidate {
                address: public_ip,
                port,
                kind: CandidateKind::ServerReflexive,
            },
        ];

        let negotiated = shared.negotiated.get().ok_or(Error::SessionClosed)?;
        let answer = sdp::create(&sdp::AnswerParams {
            username: &shared.local_ufrag,
            password: &shared.local_pwd,
            fingerprint: endpoint.fingerprint(),
            mid: &negotiated.mid,
            candidates: &candidates,
        });
        let _ = shared.answer.set(answer.clone());
        shared.advance(SessionState::Listening);

        let agent = StunAgent::new(
            shared.local_ufrag.clone(),
            shared.local_pwd.clone(),
            negotiated.peer_ufrag.clone(),
            negotiated.peer_pwd.clone(),
        );
        tokio::spawn(run_session(shared.clone(), socket, agent));

        endpoint.emit(EndpointEvent::AnswerCreated {
            session: shared.id,
            sdp: answer.clone(),
        });
        Ok(answer)
    }

    /// Appends a trickled candidate. The unicast view target follows the
    /// set's primary in the same critical section.
    pub fn append_candidate(&self, address: Ipv4Addr, port: u16, priority: u32) -> Result<()> {
        let shared = &self.shared;
        if shared.state() == SessionState::Closed {
            return Err(Error::SessionClosed);
        }

        {
            let mut link = shared.link.lock().unwrap();
            link.candidates.push(address, port, priority);
            let primary = link.candidates.primary()?.addr();
            if let Some(view) = &link.view {
                view.set_remote(primary);
            }
        }

        trace!(
            "session {}: candidate {address}:{port} prio {priority}",
            shared.id
        );
        shared.emit(EndpointEvent::CandidateAdded {
            session: shared.id,
            address: SocketAddr::new(address.into(), port),
        });
        Ok(())
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

enum Upcall {
    DtlsConnected(DtlsLink),
    DtlsFailed(Error),
    SctpListening(SctpAssociation),
    SctpFailed(Error),
}

async fn run_session(shared: Arc<SessionShared>, socket: Arc<UdpSocket>, agent: StunAgent) {
    if let Err(err) = session_loop(&shared, socket, agent).await {
        shared.fail(&err);
    }
    shared.close();
}

/// Per-session event loop: one task, handlers run to completion. The
/// socket is shared between STUN (handled here) and DTLS (forwarded via
/// the unicast view); the first byte tells them apart.
async fn session_loop(
    shared: &Arc<SessionShared>,
    socket: Arc<UdpSocket>,
    mut agent: StunAgent,
) -> Result<()> {
    let mut state_rx = shared.state_tx.subscribe();
    let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
    let mut association: Option<SctpAssociation> = None;

    let mut check_interval = time::interval(CHECK_INTERVAL);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; RECEIVE_MTU];
    loop {
        tokio::select! {
            biased;

            res = state_rx.changed() => {
                if res.is_err() || *state_rx.borrow_and_update() == SessionState::Closed {
                    return Ok(());
                }
            }
            Some(upcall) = upcall_rx.recv() => {
                handle_upcall(shared, upcall, &upcall_tx, &mut association)?;
            }
            event = async {
                match association.as_mut() {
                    Some(a) => a.events.recv().await,
                    // No association yet; stay out of the way.
                    None => std::future::pending::<Option<SctpEvent>>().await,
                }
            } => {
                handle_sctp_event(shared, event, &mut association).await?;
            }
            _ = check_interval.tick() => {
                let target = {
                    let link = shared.link.lock().unwrap();
                    link.candidates.primary().ok().map(|c| c.addr())
                };
                if let Some(target) = target {
                    let check = agent.binding_check(target)?;
                    socket.send_to(&check.raw, target).await?;
                    trace!("session {}: connectivity check to {target}", shared.id);
                }
            }
            res = socket.recv_from(&mut buf) => {
                let (n, remote) = res?;
                handle_datagram(shared, &socket, &mut agent, &upcall_tx, &buf[..n], remote).await?;
            }
        }
    }
}

async fn handle_datagram(
    shared: &Arc<SessionShared>,
    socket: &Arc<UdpSocket>,
    agent: &mut StunAgent,
    upcall_tx: &mpsc::UnboundedSender<Upcall>,
    data: &[u8],
    remote: SocketAddr,
) -> Result<()> {
    if match_stun(data) {
        match agent.handle_inbound(data, remote) {
            StunOutcome::Reply(reply) => {
                socket.send_to(&reply.raw, remote).await?;
            }
            StunOutcome::CheckSucceeded { destination } => {
                trace!("session {}: check to {destination} succeeded", shared.id);
                if shared.state() == SessionState::Listening {
                    shared.advance(SessionState::IceConnected);
                    start_dtls(shared, socket, upcall_tx)?;
                }
            }
            StunOutcome::Dropped => {}
        }
    } else {
        // DTLS and anything else belongs to the view's consumer.
        let link = shared.link.lock().unwrap();
        match &link.view {
            Some(view) => view.deliver(BytesMut::from(data)),
            None => trace!("session {}: datagram before dtls start, dropped", shared.id),
        }
    }
    Ok(())
}

fn handle_upcall(
    shared: &Arc<SessionShared>,
    upcall: Upcall,
    upcall_tx: &mpsc::UnboundedSender<Upcall>,
    association: &mut Option<SctpAssociation>,
) -> Result<()> {
    match upcall {
        Upcall::DtlsConnected(link) => {
            shared.advance(SessionState::DtlsConnected);
            start_sctp(shared, link, upcall_tx)?;
        }
        Upcall::DtlsFailed(err) => return Err(err),
        Upcall::SctpListening(assoc) => {
            shared.advance(SessionState::SctpReady);
            *association = Some(assoc);
        }
        Upcall::SctpFailed(err) => return Err(err),
    }
    Ok(())
}

/// An incoming stream is mirrored with an outbound stream of the same id
/// and the pair surfaces as a negotiated data channel.
async fn handle_sctp_event(
    shared: &Arc<SessionShared>,
    event: Option<SctpEvent>,
    association: &mut Option<SctpAssociation>,
) -> Result<()> {
    match event {
        Some(SctpEvent::Stream { id, rx }) => {
            let assoc = association
                .as_ref()
                .ok_or_else(|| Error::SctpTransport("no association".to_owned()))?;
            let (reply_tx, reply_rx) = oneshot::channel();
            assoc
                .control
                .send(SctpCommand::CreateStream {
                    id,
                    reply: reply_tx,
                })
                .map_err(|_| Error::SctpTransport("association control closed".to_owned()))?;
            let tx = reply_rx
                .await
                .map_err(|_| Error::SctpTransport(format!("create stream {id} failed")))?;

            debug!("session {}: data channel on stream {id}", shared.id);
            shared.emit(EndpointEvent::ChannelOpen {
                session: shared.id,
                channel: DataChannel::new(id, tx, rx),
            });
            Ok(())
        }
        Some(SctpEvent::Error(err)) => Err(err),
        Some(SctpEvent::Closed) | None => {
            *association = None;
            Err(Error::SessionClosed)
        }
    }
}

/// ICE is up: hand the unicast view to the DTLS collaborator and run the
/// handshake as the client, pinning the peer certificate to the
/// offer-declared fingerprint.
fn start_dtls(
    shared: &Arc<SessionShared>,
    socket: &Arc<UdpSocket>,
    upcall_tx: &mpsc::UnboundedSender<Upcall>,
) -> Result<()> {
    let endpoint = shared.endpoint.upgrade().ok_or(Error::SessionClosed)?;

    let (view, inbound) = {
        let mut link = shared.link.lock().unwrap();
        let primary = link.candidates.primary()?.addr();
        let view = match &link.view {
            Some(view) => {
                view.set_remote(primary);
                view.clone()
            }
            None => {
                let view = UnicastView::new(socket.clone(), primary);
                link.view = Some(view.clone());
                view
            }
        };
        let inbound = view
            .take_inbound()
            .ok_or_else(|| Error::DtlsHandshake("view already consumed".to_owned()))?;
        (view, inbound)
    };

    let negotiated = shared.negotiated.get().ok_or(Error::SessionClosed)?;
    let expected = negotiated.peer_fingerprint.clone();
    let verify_peer: PeerVerifier = Arc::new(move |der: &[u8]| fingerprint(der) == expected);

    debug!("session {}: starting dtls to {}", shared.id, view.remote());
    let connect = endpoint.transports().dtls.connect(DtlsConn {
        view,
        inbound,
        certificate: endpoint.certificate(),
        private_key: endpoint.private_key(),
        verify_peer,
    });

    let upcall_tx = upcall_tx.clone();
    tokio::spawn(async move {
        let upcall = match connect.await {
            Ok(link) => Upcall::DtlsConnected(link),
            Err(err) => Upcall::DtlsFailed(err),
        };
        let _ = upcall_tx.send(upcall);
    });
    Ok(())
}

/// DTLS is up: bring up the SCTP server on the advertised port.
fn start_sctp(
    shared: &Arc<SessionShared>,
    link: DtlsLink,
    upcall_tx: &mpsc::UnboundedSender<Upcall>,
) -> Result<()> {
    let endpoint = shared.endpoint.upgrade().ok_or(Error::SessionClosed)?;

    debug!("session {}: starting sctp on port {}", shared.id, sdp::SCTP_PORT);
    let listen = endpoint.transports().sctp.listen(link, sdp::SCTP_PORT);

    let upcall_tx = upcall_tx.clone();
    tokio::spawn(async move {
        let upcall = match listen.await {
            Ok(association) => Upcall::SctpListening(association),
            Err(err) => Upcall::SctpFailed(err),
        };
        let _ = upcall_tx.send(upcall);
    });
    Ok(())
}
