use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::session::{Session, SessionId};
use crate::transport::{AddressDiscovery, DataChannel, DtlsConnector, SctpListener};

/// Tagged events the endpoint surfaces to the host application.
#[derive(Debug)]
pub enum EndpointEvent {
    /// Address discovery finished; answers can now be produced without
    /// waiting.
    Ready {
        public_ip: Ipv4Addr,
        internal_ip: Ipv4Addr,
    },
    SessionCreated {
        session: SessionId,
    },
    AnswerCreated {
        session: SessionId,
        sdp: String,
    },
    CandidateAdded {
        session: SessionId,
        address: SocketAddr,
    },
    /// A negotiated data channel opened; ownership moves to the host.
    ChannelOpen {
        session: SessionId,
        channel: DataChannel,
    },
    SessionError {
        session: SessionId,
        error: String,
    },
    SessionClosed {
        session: SessionId,
    },
}

/// The pluggable services the core consumes.
pub struct Transports {
    pub discovery: Arc<dyn AddressDiscovery>,
    pub dtls: Arc<dyn DtlsConnector>,
    pub sctp: Arc<dyn SctpListener>,
}

/// Identity material for the endpoint; PEM buffers as read from disk.
pub struct EndpointConfig {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

pub(crate) struct EndpointShared {
    certificate: Bytes,
    private_key: Bytes,
    fingerprint: String,
    transports: Transports,
    public_ip: OnceCell<Ipv4Addr>,
    internal_ip: OnceCell<Ipv4Addr>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_session_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
}

impl EndpointShared {
    pub(crate) fn emit(&self, event: EndpointEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn remove_session(&self, id: SessionId) {
        if self.sessions.lock().unwrap().remove(&id).is_some() {
            debug!("session {id} removed from registry");
        }
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Certificate body, DER.
    pub(crate) fn certificate(&self) -> Bytes {
        self.certificate.clone()
    }

    /// Private key, PEM as configured.
    pub(crate) fn private_key(&self) -> Bytes {
        self.private_key.clone()
    }

    pub(crate) fn transports(&self) -> &Transports {
        &self.transports
    }

    /// The discovered `(internal, public)` pair. Both probes run
    /// concurrently and the results stick, so answers produced before
    /// `start` finished pay the discovery cost once.
    pub(crate) async fn addresses(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let (internal, public) = tokio::try_join!(
            self.internal_ip
                .get_or_try_init(|| self.transports.discovery.internal_ipv4()),
            self.public_ip
                .get_or_try_init(|| self.transports.discovery.public_ipv4()),
        )?;
        Ok((*internal, *public))
    }
}

/// Process-wide endpoint: holds the server identity, discovers the
/// addresses it advertises and tracks the live sessions.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Validates the identity material, computes the certificate's
    /// SHA-256 fingerprint over the PEM-decoded DER body and sets up an
    /// empty registry. Returns the endpoint together with its event
    /// stream.
    pub fn new(
        config: EndpointConfig,
        transports: Transports,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EndpointEvent>)> {
        if config.certificate_pem.is_empty() {
            return Err(Error::InvalidCredentials("empty certificate".to_owned()));
        }
        if config.private_key_pem.is_empty() {
            return Err(Error::InvalidCredentials("empty private key".to_owned()));
        }

        let certificate = pem::parse(&config.certificate_pem)
            .map_err(|err| Error::InvalidCredentials(format!("certificate: {err}")))?;
        pem::parse(&config.private_key_pem)
            .map_err(|err| Error::InvalidCredentials(format!("private key: {err}")))?;

        let der = Bytes::copy_from_slice(certificate.contents());
        let fingerprint = fingerprint(&der);
        debug!("endpoint certificate fingerprint {fingerprint}");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint {
            shared: Arc::new(EndpointShared {
                certificate: der,
                private_key: Bytes::from(config.private_key_pem),
                fingerprint,
                transports,
                public_ip: OnceCell::new(),
                internal_ip: OnceCell::new(),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                events_tx,
            }),
        };
        Ok((endpoint, events_rx))
    }

    /// Discovers the public and internal IPv4 addresses concurrently and
    /// emits `Ready`.
    pub async fn start(&self) -> Result<()> {
        let (internal_ip, public_ip) = self.shared.addresses().await?;
        info!("endpoint ready, internal {internal_ip}, public {public_ip}");
        self.shared.emit(EndpointEvent::Ready {
            public_ip,
            internal_ip,
        });
        Ok(())
    }

    /// Constructs and registers a fresh session.
    pub fn create_session(&self) -> Session {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, Arc::downgrade(&self.shared));
        self.shared
            .sessions
            .lock()
            .unwrap()
            .insert(id, session.clone());
        debug!("session {id} created");
        self.shared.emit(EndpointEvent::SessionCreated { session: id });
        session
    }

    /// Number of live sessions.
    pub fn size(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.shared.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Locates the session negotiated with the given peer ufrag, the key
    /// the legacy signalling paths address sessions by.
    pub fn session_by_peer_ufrag(&self, ufrag: &str) -> Option<Session> {
        self.shared
            .sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.peer_ufrag() == Some(ufrag))
            .cloned()
    }

    pub fn fingerprint(&self) -> &str {
        self.shared.fingerprint()
    }

    pub(crate) async fn addresses(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        self.shared.addresses().await
    }
}
