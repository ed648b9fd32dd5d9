use std::io::Cursor;
use std::net::Ipv4Addr;

use ::sdp::description::common::{Address, Attribute, ConnectionInformation};
use ::sdp::description::media::{MediaDescription, MediaName, RangedPort};
use ::sdp::description::session::{Origin, SessionDescription, TimeDescription, Timing};
use log::trace;

use crate::error::{Error, Result};
use crate::fingerprint::FINGERPRINT_ALGORITHM;
use crate::ice::candidate::LocalCandidate;


/// Fixed origin identifiers: answers from this endpoint are all issued by
/// the same synthetic session.
const ANSWER_SESSION_ID: u64 = 3_497_579_305_088_229_251;
const ANSWER_SESSION_VERSION: u64 = 2;

/// SCTP port, also the `sctpmap` payload id advertised in the answer.
pub const SCTP_PORT: u16 = 5000;

/// Mid used when the offer carries no BUNDLE group.
pub const DEFAULT_MID: &str = "data";

/// Structured view over a parsed offer. Only the attributes the data
/// channel pipeline consumes are surfaced.
#[derive(Debug, Default)]
pub struct OfferView {
    pub groups: Vec<Group>,
    /// Session-level fingerprint; overrides the media-level one when present.
    pub fingerprint: Option<Fingerprint>,
    pub media: Vec<MediaView>,
}

#[derive(Debug)]
pub struct Group {
    pub semantic: String,
    pub mids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct MediaView {
    /// Transport protocol tokens of the `m=` line, slash-joined.
    pub protocol: String,
    pub mid: Option<String>,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub candidates: Vec<OfferCandidate>,
}

/// An inline candidate from the offer. Only IPv4 transports survive
/// parsing; everything else (IPv6, mDNS hostnames) is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferCandidate {
    pub address: Ipv4Addr,
    pub port: u16,
    pub priority: u32,
    pub kind: String,
}

/// Parses an offer into the structured view.
pub fn parse(offer: &str) -> Result<OfferView> {
    let mut reader = Cursor::new(offer.as_bytes());
    let sd = SessionDescription::unmarshal(&mut reader)
        .map_err(|err| Error::InvalidOffer(err.to_string()))?;

    let groups = sd
        .attributes
        .iter()
        .filter(|a| a.key == "group")
        .filter_map(|a| a.value.as_deref())
        .map(|value| {
            let mut fields = value.split_whitespace();
            Group {
                semantic: fields.next().unwrap_or_default().to_owned(),
                mids: fields.map(str::to_owned).collect(),
            }
        })
        .collect();

    let fingerprint = sd
        .attributes
        .iter()
        .find(|a| a.key == "fingerprint")
        .and_then(|a| a.value.as_deref())
        .and_then(parse_fingerprint);

    let media = sd.media_descriptions.iter().map(parse_media).collect();

    Ok(OfferView {
        groups,
        fingerprint,
        media,
    })
}

fn parse_media(m: &MediaDescription) -> MediaView {
    let attr = |key: &str| -> Option<String> {
        m.attribute(key).flatten().map(str::to_owned)
    };

    MediaView {
        protocol: m.media_name.protos.join("/"),
        mid: attr("mid"),
        ice_ufrag: attr("ice-ufrag"),
        ice_pwd: attr("ice-pwd"),
        fingerprint: attr("fingerprint").and_then(|v| parse_fingerprint(&v)),
        candidates: m
            .attributes
            .iter()
            .filter(|a| a.key == "candidate")
            .filter_map(|a| a.value.as_deref())
            .filter_map(parse_candidate)
            .collect(),
    }
}

fn parse_fingerprint(value: &str) -> Option<Fingerprint> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() == 2 {
        Some(Fingerprint {
            algorithm: fields[0].to_owned(),
            value: fields[1].to_owned(),
        })
    } else {
        None
    }
}

/// `<foundation> <component> <transport> <priority> <address> <port> typ <type> …`
fn parse_candidate(value: &str) -> Option<OfferCandidate> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 8 || !fields[2].eq_ignore_ascii_case("udp") || fields[6] != "typ" {
        trace!("skipping candidate attribute {value:?}");
        return None;
    }

    let priority = fields[3].parse().ok()?;
    let address: Ipv4Addr = match fields[4].parse() {
        Ok(address) => address,
        Err(_) => {
            trace!("skipping non-IPv4 candidate {value:?}");
            return None;
        }
    };
    let port = fields[5].parse().ok()?;

    Some(OfferCandidate {
        address,
        port,
        priority,
        kind: fields[7].to_owned(),
    })
}

/// Inputs for the fixed-shape answer.
pub struct AnswerParams<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub fingerprint: &'a str,
    pub mid: &'a str,
    pub candidates: &'a [LocalCandidate],
}

/// Serialises the answer: a single `m=application 9 DTLS/SCTP 5000`
/// section in which this endpoint takes the active DTLS role.
pub fn create(params: &AnswerParams<'_>) -> String {
    let value_attribute = |key: &str, value: String| Attribute {
        key: key.to_owned(),
        value: Some(value),
    };

    let mut attributes = vec![
        value_attribute("setup", "active".to_owned()),
        value_attribute("ice-ufrag", params.username.to_owned()),
        value_attribute("ice-pwd", params.password.to_owned()),
        value_attribute("mid", params.mid.to_owned()),
        value_attribute(
            "fingerprint",
            format!("{FINGERPRINT_ALGORITHM} {}", params.fingerprint),
        ),
        value_attribute("sctpmap", format!("{SCTP_PORT} webrtc-datachannel 1024")),
    ];

    let base = params.candidates.first().copied();
    for (foundation, candidate) in params.candidates.iter().enumerate() {
        let related = if foundation == 0 { None } else { base.as_ref() };
        attributes.push(value_attribute(
            "candidate",
            candidate.marshal(foundation, related),
        ));
    }

    let media = MediaDescription {
        media_name: MediaName {
            media: "application".to_owned(),
            port: RangedPort {
                value: 9,
                range: None,
            },
            protos: vec!["DTLS".to_owned(), "SCTP".to_owned()],
            formats: vec![SCTP_PORT.to_string()],
        },
        media_title: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            address: Some(Address {
                address: "0.0.0.0".to_owned(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        encryption_key: None,
        attributes,
    };

    let sd = SessionDescription {
        version: 0,
        origin: Origin {
            username: "-".to_owned(),
            session_id: ANSWER_SESSION_ID,
            session_version: ANSWER_SESSION_VERSION,
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            unicast_address: "127.0.0.1".to_owned(),
        },
        session_name: "-".to_owned(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: None,
        bandwidth: vec![],
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        time_zones: vec![],
        encryption_key: None,
        attributes: vec![
            Attribute {
                key: "group".to_owned(),
                value: Some(format!("BUNDLE {}", params.mid)),
            },
            Attribute {
                key: "msid-semantic".to_owned(),
                value: Some(" WMS".to_owned()),
            },
        ],
        media_descriptions: vec![media],
    };
    sd.marshal()
}
