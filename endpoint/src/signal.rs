//! Transport-agnostic signalling façade. The host binds these three
//! operations to whatever request/response channel it runs (HTTP in the
//! demo); bodies are the JSON shapes browsers exchange.

use std::net::Ipv4Addr;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::ice::candidate::{CandidateKind, LocalCandidate};
use crate::sdp::DEFAULT_MID;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerBody {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A trickled candidate addressed by the peer's ufrag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateBody {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEntry {
    pub candidate: String,
    pub sdp_m_line_index: u32,
    pub sdp_mid: String,
    pub username_fragment: String,
}

#[derive(Clone)]
pub struct Signalling {
    endpoint: Endpoint,
}

impl Signalling {
    pub fn new(endpoint: Endpoint) -> Self {
        Signalling { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Creates a session for the offer and answers it.
    pub async fn offer(&self, body: OfferBody) -> Result<AnswerBody> {
        if body.kind != "offer" {
            return Err(Error::SignallingBadRequest(format!(
                "expected type \"offer\", got {:?}",
                body.kind
            )));
        }

        let session = self.endpoint.create_session();
        match session.create_answer(&body.sdp).await {
            Ok(sdp) => Ok(AnswerBody {
                sdp,
                kind: "answer".to_owned(),
            }),
            Err(err) => {
                // An unusable offer must not leave a dead session behind.
                session.close();
                Err(err)
            }
        }
    }

    /// Appends a trickled candidate to the session the peer ufrag names.
    /// Unknown ufrags are acknowledged and ignored; the peer may retry a
    /// session that already went away.
    pub async fn candidate(&self, body: CandidateBody) -> Result<()> {
        let address: Ipv4Addr = body
            .ip
            .parse()
            .map_err(|_| Error::SignallingBadRequest(format!("bad candidate ip {:?}", body.ip)))?;

        match self.endpoint.session_by_peer_ufrag(&body.username) {
            Some(session) => session.append_candidate(address, body.port, body.priority)?,
            None => debug!("candidate for unknown peer ufrag {}", body.username),
        }
        Ok(())
    }

    /// The two candidates the session identified by the base64 peer ufrag
    /// advertises: host and srflx on the session's port.
    pub async fn candidates(&self, username_base64: &str) -> Result<Vec<CandidateEntry>> {
        let decoded = BASE64_STANDARD
            .decode(username_base64)
            .map_err(|err| Error::SignallingBadRequest(format!("bad username: {err}")))?;
        let ufrag = String::from_utf8(decoded)
            .map_err(|err| Error::SignallingBadRequest(format!("bad username: {err}")))?;

        let session = self
            .endpoint
            .session_by_peer_ufrag(&ufrag)
            .ok_or_else(|| {
                Error::SignallingBadRequest(format!("no session for peer ufrag {ufrag:?}"))
            })?;
        let port = session.port().ok_or(Error::SessionClosed)?;
        let (internal_ip, public_ip) = self.endpoint.addresses().await?;

        let host = LocalCandidate {
            address: internal_ip,
            port,
            kind: CandidateKind::Host,
        };
        let srflx = LocalCandidate {
            address: public_ip,
            port,
            kind: CandidateKind::ServerReflexive,
        };

        let entry = |candidate: String, session_ufrag: &str| CandidateEntry {
            candidate,
            sdp_m_line_index: 0,
            sdp_mid: DEFAULT_MID.to_owned(),
            username_fragment: session_ufrag.to_owned(),
        };
        Ok(vec![
            entry(
                format!("candidate:{}", host.marshal(0, None)),
                session.local_ufrag(),
            ),
            entry(
                format!("candidate:{}", srflx.marshal(1, Some(&host))),
                session.local_ufrag(),
            ),
        ])
    }
}
