//! A directory server receiving updates from a relay.

use std::collections::BTreeSet;
use std::time::Duration;

use dirrepl::{AssuredRequest, PeerStatus, ReplayError, ServerId, ServerState};

use crate::fixtures::scripted_peer::{ScriptedPeer, ds, replica, rs, update};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

#[test]
fn safe_read_ack_follows_replay() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    let sent = update(1, 0, Some(AssuredRequest::SafeRead));
    relay.send_update(sent.clone());
    let inbound = reader.inbound().recv_timeout(WAIT).expect("inbound");
    assert_eq!(inbound.csn(), sent.csn);
    assert!(inbound.expects_ack());
    assert!(relay.next_ack(QUIET).is_none());

    inbound.finish(Ok(()));
    let ack = relay.next_ack(WAIT).expect("ack");
    assert_eq!(ack.csn, sent.csn);
    assert!(ack.is_positive());
    assert!(reader.server_state().covers(&sent.csn));
}

#[test]
fn replay_failure_is_reported_with_own_id() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    relay.send_update(update(1, 0, Some(AssuredRequest::SafeRead)));
    let inbound = reader.inbound().recv_timeout(WAIT).expect("inbound");
    inbound.finish(Err(ReplayError::new("no such parent entry")));

    let ack = relay.next_ack(WAIT).expect("ack");
    assert!(ack.has_replay_error);
    assert_eq!(ack.failed_server_ids, BTreeSet::from([ServerId::new(2)]));
    let received = reader.monitor().snapshot().received;
    assert_eq!(received.safe_read_received_updates, 1);
    assert_eq!(received.safe_read_received_not_acked, 1);
}

#[test]
fn safe_data_is_never_answered_by_a_directory_server() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    relay.send_update(update(1, 0, Some(AssuredRequest::safe_data(1).expect("level"))));
    let inbound = reader.inbound().recv_timeout(WAIT).expect("inbound");
    assert!(!inbound.expects_ack());
    inbound.finish(Ok(()));
    assert!(relay.next_ack(QUIET).is_none());
}

#[test]
fn duplicate_is_acked_without_second_replay() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    let sent = update(1, 0, Some(AssuredRequest::SafeRead));
    relay.send_update(sent.clone());
    reader
        .inbound()
        .recv_timeout(WAIT)
        .expect("inbound")
        .finish(Ok(()));
    assert!(relay.next_ack(WAIT).expect("first ack").is_positive());

    relay.send_update(sent.clone());
    let again = relay.next_ack(WAIT).expect("duplicate ack");
    assert_eq!(again.csn, sent.csn);
    assert!(again.is_positive());
    assert!(reader.inbound().recv_timeout(QUIET).is_err());
}

#[test]
fn demoted_reader_stops_answering() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    relay.set_status(ServerId::new(2), PeerStatus::Degraded);
    assert!(reader.wait_until(WAIT, |r| r.info().status == PeerStatus::Degraded));

    relay.send_update(update(1, 0, Some(AssuredRequest::SafeRead)));
    let inbound = reader.inbound().recv_timeout(WAIT).expect("inbound");
    assert!(!inbound.expects_ack());
    inbound.finish(Ok(()));
    assert!(relay.next_ack(QUIET).is_none());
}

#[test]
fn full_update_is_announced_to_neighbours() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&reader, rs(100));
    assert!(reader.wait_for_peers(1, WAIT));

    reader.begin_full_update();
    let status = relay.next_status(WAIT).expect("status");
    assert_eq!(status.server_id, ServerId::new(2));
    assert_eq!(status.status, PeerStatus::FullUpdate);

    reader.end_full_update();
    let status = relay.next_status(WAIT).expect("status");
    assert_eq!(status.status, PeerStatus::Normal);
}

#[test]
fn handshake_resends_only_what_the_peer_lacks() {
    let reader = replica(&ds(2), Duration::from_secs(1));
    let csns: Vec<_> = (0..3)
        .map(|index| {
            reader
                .write_with(format!("cn=local-{index}"), None, Duration::from_secs(1))
                .expect("write")
                .csn
        })
        .collect();

    let known: ServerState = [csns[0]].into_iter().collect();
    let relay = ScriptedPeer::connect_with_state(&reader, rs(100), known);
    assert!(relay.remote_start().server_state.covers(&csns[2]));

    let resent: Vec<_> = (0..2)
        .map(|_| relay.next_update(WAIT).expect("missed change").csn)
        .collect();
    assert_eq!(resent, csns[1..].to_vec());
    assert!(relay.next_update(QUIET).is_none());
}
