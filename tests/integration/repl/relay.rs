//! Relay forwarding and ack aggregation.

use std::collections::BTreeSet;
use std::time::Duration;

use dirrepl::{AckRecord, AssuredRequest, PeerKind, ServerId};

use crate::fixtures::scripted_peer::{ScriptedPeer, ds, replica, rs, update};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

#[test]
fn relay_merges_downstream_answers_into_one_ack() {
    let relay = replica(&rs(100), Duration::from_millis(300));
    let writer = ScriptedPeer::connect(&relay, ds(1));
    let answering = ScriptedPeer::connect(&relay, ds(5));
    let silent = ScriptedPeer::connect(&relay, ds(6));
    assert!(relay.wait_for_peers(3, WAIT));

    let sent = update(1, 0, Some(AssuredRequest::SafeRead));
    writer.send_update(sent.clone());

    let forwarded = answering.next_update(WAIT).expect("forwarded");
    assert!(forwarded.is_assured());
    assert!(silent.next_update(WAIT).expect("forwarded").is_assured());
    answering.ack(AckRecord::positive(forwarded.csn));

    let merged = writer.next_ack(WAIT).expect("merged ack");
    assert_eq!(merged.csn, sent.csn);
    assert!(merged.has_timeout);
    assert!(!merged.has_replay_error);
    assert_eq!(merged.failed_server_ids, BTreeSet::from([ServerId::new(6)]));
}

#[test]
fn relay_folds_replay_errors_and_timeouts_together() {
    let relay = replica(&rs(100), Duration::from_millis(300));
    let writer = ScriptedPeer::connect(&relay, ds(1));
    let failing = ScriptedPeer::connect(&relay, ds(5));
    let _silent = ScriptedPeer::connect(&relay, ds(6));
    assert!(relay.wait_for_peers(3, WAIT));

    let sent = update(1, 0, Some(AssuredRequest::SafeRead));
    writer.send_update(sent.clone());
    let forwarded = failing.next_update(WAIT).expect("forwarded");
    failing.ack(AckRecord::replay_error(forwarded.csn, ServerId::new(5)));

    let merged = writer.next_ack(WAIT).expect("merged ack");
    assert!(merged.has_timeout);
    assert!(merged.has_replay_error);
    assert_eq!(
        merged.failed_server_ids,
        BTreeSet::from([ServerId::new(5), ServerId::new(6)])
    );
}

#[test]
fn updates_from_a_directory_server_reach_every_other_neighbour() {
    let relay = replica(&rs(100), Duration::from_secs(1));
    let writer = ScriptedPeer::connect(&relay, ds(1));
    let reader = ScriptedPeer::connect(&relay, ds(5));
    let other_relay = ScriptedPeer::connect(&relay, rs(101));
    assert!(relay.wait_for_peers(3, WAIT));

    let sent = update(1, 0, None);
    writer.send_update(sent.clone());
    assert_eq!(reader.next_update(WAIT).expect("reader copy").csn, sent.csn);
    assert_eq!(other_relay.next_update(WAIT).expect("relay copy").csn, sent.csn);
    assert!(writer.next_update(QUIET).is_none());
}

#[test]
fn updates_from_a_relay_only_go_down_to_directory_servers() {
    let relay = replica(&rs(100), Duration::from_secs(1));
    let upstream = ScriptedPeer::connect(&relay, rs(101));
    let sibling = ScriptedPeer::connect(&relay, rs(102));
    let reader = ScriptedPeer::connect(&relay, ds(5));
    assert!(relay.wait_for_peers(3, WAIT));

    let sent = update(7, 0, None);
    upstream.send_update(sent.clone());
    assert_eq!(reader.next_update(WAIT).expect("reader copy").csn, sent.csn);
    assert!(sibling.next_update(QUIET).is_none());
    assert!(upstream.next_update(QUIET).is_none());
}

#[test]
fn safe_data_relay_needs_one_fewer_relay() {
    let relay = replica(&rs(100), Duration::from_secs(2));
    let writer = ScriptedPeer::connect(&relay, ds(1));
    let first = ScriptedPeer::connect(&relay, rs(101));
    let second = ScriptedPeer::connect(&relay, rs(102));
    assert!(relay.wait_for_peers(3, WAIT));

    // Level 1 is satisfied by the relay itself.
    let immediate = update(1, 0, Some(AssuredRequest::safe_data(1).expect("level")));
    writer.send_update(immediate.clone());
    let ack = writer.next_ack(WAIT).expect("immediate ack");
    assert_eq!(ack.csn, immediate.csn);
    assert!(ack.is_positive());
    assert!(!first.next_update(WAIT).expect("still forwarded").is_assured());

    // Level 2 waits for one more relay.
    let waited = update(1, 1, Some(AssuredRequest::safe_data(2).expect("level")));
    writer.send_update(waited.clone());
    let forwarded = first.next_update(WAIT).expect("forwarded");
    assert!(forwarded.is_assured());
    second.next_update(WAIT).expect("forwarded");
    assert!(writer.next_ack(Duration::from_millis(200)).is_none());
    first.ack(AckRecord::positive(forwarded.csn));
    let ack = writer.next_ack(WAIT).expect("ack after one relay");
    assert_eq!(ack.csn, waited.csn);
    assert!(ack.is_positive());
}

#[test]
fn relay_snapshot_lists_itself_and_its_directory_servers() {
    let relay = replica(&rs(100), Duration::from_secs(1));
    let _writer = ScriptedPeer::connect(&relay, ds(1));
    let upstream = ScriptedPeer::connect(&relay, rs(101));
    let _other = ScriptedPeer::connect(&relay, rs(102));
    assert!(relay.wait_for_peers(3, WAIT));

    let mut last = None;
    while let Some(snapshot) = upstream.next_topology(QUIET) {
        last = Some(snapshot);
    }
    let snapshot = last.expect("snapshot");
    let listed: BTreeSet<ServerId> = snapshot.peers().map(|peer| peer.server_id).collect();
    assert_eq!(listed, BTreeSet::from([ServerId::new(100), ServerId::new(1)]));
    assert!(snapshot.rs_infos.iter().all(|peer| peer.kind == PeerKind::Rs));
}

#[test]
fn duplicate_assured_update_is_acked_without_forwarding() {
    let relay = replica(&rs(100), Duration::from_secs(1));
    let writer = ScriptedPeer::connect(&relay, ds(1));
    let reader = ScriptedPeer::connect(&relay, ds(5));
    assert!(relay.wait_for_peers(2, WAIT));

    let sent = update(1, 0, Some(AssuredRequest::SafeRead));
    writer.send_update(sent.clone());
    let forwarded = reader.next_update(WAIT).expect("forwarded");
    reader.ack(AckRecord::positive(forwarded.csn));
    assert!(writer.next_ack(WAIT).expect("first ack").is_positive());

    writer.send_update(sent.clone());
    let again = writer.next_ack(WAIT).expect("duplicate ack");
    assert_eq!(again.csn, sent.csn);
    assert!(again.is_positive());
    assert!(reader.next_update(QUIET).is_none());
}
