//! Assured waits seen from the writing directory server.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dirrepl::{AckRecord, AssuredRequest, GenerationId, PeerInfo, PeerStatus, ServerId};

use crate::fixtures::scripted_peer::{ScriptedPeer, ds, replica, rs};

const WAIT: Duration = Duration::from_secs(2);

fn ids(raw: &[u16]) -> BTreeSet<ServerId> {
    raw.iter().copied().map(ServerId::new).collect()
}

#[test]
fn safe_data_returns_once_level_relays_answer() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(3)));
    let relays: Vec<_> = [101, 102, 103]
        .into_iter()
        .map(|id| ScriptedPeer::connect(&writer, rs(id)))
        .collect();
    assert!(writer.wait_for_peers(3, WAIT));

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            let request = AssuredRequest::safe_data(2).expect("level");
            writer
                .write_with("cn=a", Some(request), Duration::from_secs(3))
                .expect("write")
        })
    };

    let updates: Vec<_> = relays
        .iter()
        .map(|relay| relay.next_update(WAIT).expect("update"))
        .collect();
    assert!(updates.iter().all(|update| update.is_assured()));

    thread::sleep(Duration::from_millis(200));
    relays[0].ack(AckRecord::positive(updates[0].csn));
    relays[1].ack(AckRecord::positive(updates[1].csn));

    let completion = submit.join().expect("submit thread");
    assert!(completion.is_acked());
    assert!(completion.report.is_positive());
    assert!(completion.elapsed >= Duration::from_millis(200));
    assert!(completion.elapsed < Duration::from_millis(1500));

    let snapshot = writer.monitor().snapshot();
    assert_eq!(snapshot.safe_data.sent_updates, 1);
    assert_eq!(snapshot.safe_data.acknowledged_updates, 1);
}

#[test]
fn timeout_names_exactly_the_silent_relays() {
    let writer = Arc::new(replica(&ds(1), Duration::from_millis(300)));
    let relays: Vec<_> = [101, 102, 103]
        .into_iter()
        .map(|id| ScriptedPeer::connect(&writer, rs(id)))
        .collect();
    assert!(writer.wait_for_peers(3, WAIT));

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            let request = AssuredRequest::safe_data(3).expect("level");
            writer
                .write_with("cn=b", Some(request), Duration::from_millis(300))
                .expect("write")
        })
    };
    let update = relays[0].next_update(WAIT).expect("update");
    relays[0].ack(AckRecord::positive(update.csn));

    let completion = submit.join().expect("submit thread");
    assert!(completion.is_timed_out());
    assert!(completion.report.has_timeout);
    assert_eq!(completion.failed_server_ids(), &ids(&[102, 103]));

    let snapshot = writer.monitor().snapshot();
    assert_eq!(snapshot.safe_data.timeout_updates, 1);
    assert_eq!(
        snapshot.safe_data.server_not_acknowledged_updates.get(&ServerId::new(102)),
        Some(&1)
    );
    assert_eq!(snapshot.peers[&ServerId::new(103)].failed_to_ack, 1);
}

#[test]
fn out_of_scope_relay_receives_but_is_not_counted() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(3)));
    let in_scope = ScriptedPeer::connect(&writer, rs(101));
    let mut other = rs(102);
    other.generation_id = GenerationId::new(11);
    let out_of_scope = ScriptedPeer::connect(&writer, other);
    assert!(writer.wait_for_peers(2, WAIT));

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            let request = AssuredRequest::safe_data(2).expect("level");
            writer
                .write_with("cn=c", Some(request), Duration::from_secs(3))
                .expect("write")
        })
    };

    let counted = in_scope.next_update(WAIT).expect("in-scope update");
    assert!(counted.is_assured());
    let uncounted = out_of_scope.next_update(WAIT).expect("out-of-scope update");
    assert!(!uncounted.is_assured());
    assert_eq!(uncounted.csn, counted.csn);

    // Level 2 with one eligible relay: the single answer is enough.
    in_scope.ack(AckRecord::positive(counted.csn));
    let completion = submit.join().expect("submit thread");
    assert!(completion.is_acked());
    assert_eq!(completion.required, ids(&[101]));
}

#[test]
fn nothing_eligible_acks_at_once() {
    let writer = replica(&ds(1), Duration::from_secs(3));
    let started = Instant::now();
    let completion = writer
        .write_with("cn=d", Some(AssuredRequest::SafeRead), Duration::from_secs(3))
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.required.is_empty());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn one_relay_ack_answers_for_everything_behind_it() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(3)));
    let relay = ScriptedPeer::connect(&writer, rs(101));
    relay.announce([rs(102), ds(5)]);
    assert!(writer.wait_for_peers(3, WAIT));
    assert_eq!(
        writer.registry().peers().iter().filter(|p| p.relay.is_some()).count(),
        2
    );

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            let request = AssuredRequest::safe_data(2).expect("level");
            writer
                .write_with("cn=e", Some(request), Duration::from_secs(3))
                .expect("write")
        })
    };
    let update = relay.next_update(WAIT).expect("update");
    relay.ack(AckRecord::positive(update.csn));

    let completion = submit.join().expect("submit thread");
    assert!(completion.is_acked());
    assert_eq!(completion.required, ids(&[101, 102]));
}

#[test]
fn degraded_reader_is_reported_not_awaited() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(3)));
    let relay = ScriptedPeer::connect(&writer, rs(101));
    relay.announce([
        ds(5),
        ds(6).with_status(PeerStatus::Degraded),
        ds(7).with_status(PeerStatus::FullUpdate),
    ]);
    assert!(writer.wait_for_peers(4, WAIT));

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            writer
                .write_with("cn=f", Some(AssuredRequest::SafeRead), Duration::from_secs(3))
                .expect("write")
        })
    };
    let update = relay.next_update(WAIT).expect("update");
    assert!(update.is_assured());
    relay.ack(AckRecord::positive(update.csn));

    let completion = submit.join().expect("submit thread");
    assert!(completion.is_acked());
    assert!(completion.is_degraded());
    assert!(completion.report.has_wrong_status);
    assert_eq!(completion.required, ids(&[5]));
    assert_eq!(completion.failed_server_ids(), &ids(&[6]));
    assert_eq!(writer.monitor().snapshot().safe_read.wrong_status_updates, 1);
}

#[test]
fn departed_reader_stops_being_awaited() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(10)));
    let first = ScriptedPeer::connect(&writer, ds(5));
    let second = ScriptedPeer::connect(&writer, ds(6));
    assert!(writer.wait_for_peers(2, WAIT));

    let submit = {
        let writer = writer.clone();
        thread::spawn(move || {
            writer
                .write_with("cn=g", Some(AssuredRequest::SafeRead), Duration::from_secs(10))
                .expect("write")
        })
    };
    let update = first.next_update(WAIT).expect("update");
    second.next_update(WAIT).expect("update");
    first.ack(AckRecord::positive(update.csn));
    second.disconnect();

    let completion = submit.join().expect("submit thread");
    assert!(completion.is_acked());
    assert!(completion.elapsed < Duration::from_secs(5));
    assert!(writer.wait_until(WAIT, |w| w.peer_status(ServerId::new(6)).is_none()));
}

#[test]
fn acks_match_by_csn_across_concurrent_writes() {
    let writer = Arc::new(replica(&ds(1), Duration::from_secs(3)));
    let reader = ScriptedPeer::connect(&writer, ds(5));
    assert!(writer.wait_for_peers(1, WAIT));

    let submits: Vec<_> = (0..3)
        .map(|index| {
            let writer = writer.clone();
            thread::spawn(move || {
                writer
                    .write_with(
                        format!("cn=h{index}"),
                        Some(AssuredRequest::SafeRead),
                        Duration::from_secs(3),
                    )
                    .expect("write")
            })
        })
        .collect();

    let mut updates: Vec<_> = (0..3)
        .map(|_| reader.next_update(WAIT).expect("update"))
        .collect();
    updates.reverse();
    for update in &updates {
        reader.ack(AckRecord::positive(update.csn));
    }

    for submit in submits {
        let completion = submit.join().expect("submit thread");
        assert!(completion.is_acked());
        assert!(completion.report.is_positive());
    }
}

#[test]
fn peer_info_nested_entries_keep_their_relay() {
    let writer = replica(&ds(1), Duration::from_secs(1));
    let relay = ScriptedPeer::connect(&writer, rs(101));
    relay.announce([ds(5)]);
    assert!(writer.wait_for_peers(2, WAIT));
    let nested: Vec<PeerInfo> = writer
        .registry()
        .peers()
        .into_iter()
        .filter(|peer| peer.server_id == ServerId::new(5))
        .collect();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].hop(), ServerId::new(101));
}
