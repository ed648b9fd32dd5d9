use super::*;

#[test]
fn test_advertised_priorities() {
    // The wire-visible priorities browsers expect from this server.
    assert_eq!(candidate_priority(CandidateKind::Host), 2_113_937_151);
    assert_eq!(candidate_priority(CandidateKind::ServerReflexive), 1_677_729_535);
}

#[test]
fn test_push_keeps_descending_order() {
    let mut set = CandidateSet::default();
    set.push(Ipv4Addr::new(1, 1, 1, 1), 1000, 50);
    set.push(Ipv4Addr::new(2, 2, 2, 2), 2000, 100);
    set.push(Ipv4Addr::new(3, 3, 3, 3), 3000, 75);

    assert_eq!(set.len(), 3);
    let primary = set.primary().unwrap();
    assert_eq!(primary.address, Ipv4Addr::new(2, 2, 2, 2));
    assert_eq!(primary.port, 2000);
}

#[test]
fn test_primary_tracks_highest_priority() {
    let mut set = CandidateSet::default();
    set.push(Ipv4Addr::new(1, 1, 1, 1), 1000, 50);
    assert_eq!(set.primary().unwrap().port, 1000);

    set.push(Ipv4Addr::new(2, 2, 2, 2), 2000, 100);
    assert_eq!(set.primary().unwrap().port, 2000);

    // Lower priority never displaces the primary.
    set.push(Ipv4Addr::new(4, 4, 4, 4), 4000, 10);
    assert_eq!(set.primary().unwrap().port, 2000);
}

#[test]
fn test_ties_keep_insertion_order() {
    let mut set = CandidateSet::default();
    set.push(Ipv4Addr::new(1, 1, 1, 1), 1000, 50);
    set.push(Ipv4Addr::new(2, 2, 2, 2), 2000, 50);

    assert_eq!(set.primary().unwrap().address, Ipv4Addr::new(1, 1, 1, 1));
}

#[test]
fn test_primary_on_empty_set() {
    let set = CandidateSet::default();
    assert!(matches!(set.primary(), Err(Error::IceEmpty)));
}

#[test]
fn test_local_candidate_marshal() {
    let host = LocalCandidate {
        address: Ipv4Addr::new(10, 0, 0, 2),
        port: 52222,
        kind: CandidateKind::Host,
    };
    let srflx = LocalCandidate {
        address: Ipv4Addr::new(203, 0, 113, 7),
        port: 52222,
        kind: CandidateKind::ServerReflexive,
    };

    assert_eq!(
        host.marshal(0, None),
        "0 1 UDP 2113937151 10.0.0.2 52222 typ host"
    );
    assert_eq!(
        srflx.marshal(1, Some(&host)),
        "1 1 UDP 1677729535 203.0.113.7 52222 typ srflx raddr 10.0.0.2 rport 52222"
    );
}
