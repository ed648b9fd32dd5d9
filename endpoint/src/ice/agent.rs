use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{trace, warn};
use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{
    Getter, Message, BINDING_REQUEST, BINDING_SUCCESS, CLASS_REQUEST, CLASS_SUCCESS_RESPONSE,
    METHOD_BINDING,
};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use crate::error::{Error, Result};
use crate::ice::attributes::{AttrControlling, PriorityAttr, UseCandidateAttr};
use crate::ice::candidate::{candidate_priority, CandidateKind};


/// Fixed controlling-role tie-breaker; this server never takes the
/// controlled role, so it need not be random per session.
pub const ICE_CONTROLLING_TIE_BREAKER: u64 = 0xffae_cc81_e3da_e860;

/// Let HTO be the transaction timeout, which SHOULD be 2*RTT if RTT is
/// known or 500 ms otherwise.
///
/// reference: (IETF ref-8445)[https://tools.ietf.org/html/rfc8445#appendix-B.1].
const MAX_BINDING_REQUEST_TIMEOUT: Duration = Duration::from_millis(4000);

struct PendingBindingRequest {
    timestamp: Instant,
    transaction_id: TransactionId,
    destination: SocketAddr,
}

/// Outcome of one inbound STUN datagram.
pub enum StunOutcome {
    /// A validated binding request; the encoded success response goes back
    /// to the sender.
    Reply(Message),
    /// One of our checks to `destination` succeeded.
    CheckSucceeded { destination: SocketAddr },
    /// Not actionable; already logged and dropped.
    Dropped,
}

/// Handles STUN traffic on the session socket: answers the peer's binding
/// requests and originates the periodic nominating checks. Validation
/// failures drop the datagram, they never tear anything down.
pub struct StunAgent {
    local_ufrag: String,
    local_pwd: String,
    peer_ufrag: String,
    peer_pwd: String,

    // LRU of outbound Binding request Transaction IDs
    pending_binding_requests: Vec<PendingBindingRequest>,
}

impl StunAgent {
    pub fn new(
        local_ufrag: String,
        local_pwd: String,
        peer_ufrag: String,
        peer_pwd: String,
    ) -> Self {
        StunAgent {
            local_ufrag,
            local_pwd,
            peer_ufrag,
            peer_pwd,
            pending_binding_requests: Vec::new(),
        }
    }

    /// Builds the periodic connectivity check for `destination`. Every
    /// check nominates (USE-CANDIDATE), so the first success selects the
    /// pair. Integrity is keyed by the peer's password.
    pub fn binding_check(&mut self, destination: SocketAddr) -> Result<Message> {
        let username = format!("{}:{}", self.peer_ufrag, self.local_ufrag);
        let mut msg = Message::new();
        msg.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(Username::new(ATTR_USERNAME, username)),
            Box::<UseCandidateAttr>::default(),
            Box::new(AttrControlling(ICE_CONTROLLING_TIE_BREAKER)),
            Box::new(PriorityAttr(candidate_priority(CandidateKind::Host))),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.peer_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ])?;

        self.invalidate_pending_binding_requests(Instant::now());
        self.pending_binding_requests.push(PendingBindingRequest {
            timestamp: Instant::now(),
            transaction_id: msg.transaction_id,
            destination,
        });

        Ok(msg)
    }

    /// Classifies and handles one STUN datagram from `remote`.
    pub fn handle_inbound(&mut self, data: &[u8], remote: SocketAddr) -> StunOutcome {
        let mut m = Message {
            raw: data.to_vec(),
            ..Default::default()
        };
        if let Err(err) = m.decode() {
            warn!("discard malformed STUN from {remote}: {err}");
            return StunOutcome::Dropped;
        }

        if m.typ.method != METHOD_BINDING {
            trace!(
                "unhandled STUN from {} class({}) method({})",
                remote,
                m.typ.class,
                m.typ.method
            );
            return StunOutcome::Dropped;
        }

        if m.typ.class == CLASS_REQUEST {
            match self.handle_binding_request(&mut m, remote) {
                Ok(reply) => StunOutcome::Reply(reply),
                Err(err) => {
                    warn!("discard binding request from {remote}: {err}");
                    StunOutcome::Dropped
                }
            }
        } else if m.typ.class == CLASS_SUCCESS_RESPONSE {
            match self.handle_binding_success(&mut m, remote) {
                Ok(Some(destination)) => StunOutcome::CheckSucceeded { destination },
                Ok(None) => StunOutcome::Dropped,
                Err(err) => {
                    warn!("discard binding success from {remote}: {err}");
                    StunOutcome::Dropped
                }
            }
        } else {
            trace!("unhandled STUN class({}) from {}", m.typ.class, remote);
            StunOutcome::Dropped
        }
    }

    /// Validates FINGERPRINT, MESSAGE-INTEGRITY (local password) and the
    /// `"<localUfrag>:<peerUfrag>"` USERNAME, then builds the success
    /// response echoing the sender's observed transport.
    fn handle_binding_request(&mut self, m: &mut Message, remote: SocketAddr) -> Result<Message> {
        FINGERPRINT
            .check(m)
            .map_err(|err| Error::StunAuthFailed(format!("fingerprint: {err}")))?;

        let integrity = MessageIntegrity::new_short_term_integrity(self.local_pwd.clone());
        integrity
            .check(m)
            .map_err(|err| Error::StunAuthFailed(format!("message integrity: {err}")))?;

        let expected = format!("{}:{}", self.local_ufrag, self.peer_ufrag);
        let mut username = Username::new(ATTR_USERNAME, String::new());
        username
            .get_from(m)
            .map_err(|err| Error::StunAuthFailed(format!("username: {err}")))?;
        if username.to_string() != expected {
            return Err(Error::StunAuthFailed(format!(
                "username expected({}) actual({})",
                expected, username
            )));
        }

        let mut out = Message::new();
        out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: remote.ip(),
                port: remote.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ])?;

        Ok(out)
    }

    /// A success response is only meaningful when it answers one of our
    /// pending checks; responses are keyed with the password the paired
    /// request carried, the peer's.
    fn handle_binding_success(
        &mut self,
        m: &mut Message,
        remote: SocketAddr,
    ) -> Result<Option<SocketAddr>> {
        let integrity = MessageIntegrity::new_short_term_integrity(self.peer_pwd.clone());
        integrity
            .check(m)
            .map_err(|err| Error::StunAuthFailed(format!("message integrity: {err}")))?;

        match self.take_pending(m.transaction_id) {
            Some(pending) => Ok(Some(pending.destination)),
            None => {
                trace!("success response from {remote} matches no pending check");
                Ok(None)
            }
        }
    }

    /// Asserts that the passed transaction id is in our pending cache and
    /// removes it.
    fn take_pending(&mut self, id: TransactionId) -> Option<PendingBindingRequest> {
        self.invalidate_pending_binding_requests(Instant::now());

        let pending = &mut self.pending_binding_requests;
        for i in 0..pending.len() {
            if pending[i].transaction_id == id {
                return Some(pending.remove(i));
            }
        }
        None
    }

    /// Removes pending binding requests older than the transaction timeout.
    fn invalidate_pending_binding_requests(&mut self, filter_time: Instant) {
        let initial_size = self.pending_binding_requests.len();
        self.pending_binding_requests.retain(|request| {
            filter_time
                .checked_duration_since(request.timestamp)
                .map(|age| age < MAX_BINDING_REQUEST_TIMEOUT)
                .unwrap_or(true)
        });

        let removed = initial_size - self.pending_binding_requests.len();
        if removed > 0 {
            trace!("discarded {removed} binding requests because they expired");
        }
    }
}
