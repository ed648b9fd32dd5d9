use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};

#[cfg(test)]
mod candidate_test;

/// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
/// The RECOMMENDED values are 126 for host candidates, 100
/// for server reflexive candidates, 110 for peer reflexive candidates,
/// and 0 for relayed candidates.
const TYPE_PREFERENCE_HOST: u32 = 126;
const TYPE_PREFERENCE_PRFLX: u32 = 110;
const TYPE_PREFERENCE_SRFLX: u32 = 100;
const TYPE_PREFERENCE_RELAY: u32 = 0;

/// One socket on one interface per session, so a single local preference
/// is enough; this value yields the priorities browsers see on the wire
/// (host 2113937151, srflx 1677729535).
const LOCAL_PREFERENCE: u32 = 30;

/// A data-only bundle has a single component.
pub(crate) const COMPONENT_DATA: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateKind {
    pub const fn preference(self) -> u32 {
        match self {
            CandidateKind::Host => TYPE_PREFERENCE_HOST,
            CandidateKind::PeerReflexive => TYPE_PREFERENCE_PRFLX,
            CandidateKind::ServerReflexive => TYPE_PREFERENCE_SRFLX,
            CandidateKind::Relay => TYPE_PREFERENCE_RELAY,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

/// Computes a candidate priority per RFC 8445 §5.1.2:
/// `(2^24)·typePref + (2^8)·localPref + (256 − componentId)`.
pub const fn candidate_priority(kind: CandidateKind) -> u32 {
    (kind.preference() << 24) + (LOCAL_PREFERENCE << 8) + (256 - COMPONENT_DATA)
}

/// A remote transport address learned from the offer or trickled over
/// signalling. Never removed once added.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: Ipv4Addr,
    pub port: u16,
    pub priority: u32,
}

impl Candidate {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} prio {}", self.address, self.port, self.priority)
    }
}

/// Remote candidates ordered by descending priority; equal priorities keep
/// insertion order. Duplicate transports may appear, they are harmless.
#[derive(Debug, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
}

impl CandidateSet {
    pub fn push(&mut self, address: Ipv4Addr, port: u16, priority: u32) {
        let at = self
            .candidates
            .iter()
            .position(|c| c.priority < priority)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(
            at,
            Candidate {
                address,
                port,
                priority,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The highest-priority candidate, the current target of connectivity
    /// checks and of the unicast view.
    pub fn primary(&self) -> Result<&Candidate> {
        self.candidates.first().ok_or(Error::IceEmpty)
    }
}

/// A candidate this server advertises to the peer, in the answer SDP and
/// on the legacy `candidates` signalling path.
#[derive(Debug, Copy, Clone)]
pub struct LocalCandidate {
    pub address: Ipv4Addr,
    pub port: u16,
    pub kind: CandidateKind,
}

impl LocalCandidate {
    pub fn priority(&self) -> u32 {
        candidate_priority(self.kind)
    }

    /// The `candidate:` attribute value. The foundation is the candidate's
    /// index in the advertised list; every candidate after the first
    /// relates back to the first one's transport.
    pub fn marshal(&self, foundation: usize, base: Option<&LocalCandidate>) -> String {
        let mut s = format!(
            "{foundation} {COMPONENT_DATA} UDP {} {} {} typ {}",
            self.priority(),
            self.address,
            self.port,
            self.kind
        );
        if let Some(base) = base {
            s.push_str(&format!(" raddr {} rport {}", base.address, base.port));
        }
        s
    }
}
