//! End-to-end runs over in-process meshes of real replicas.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use dirrepl::config::ReplicationConfig;
use dirrepl::sim::{Cluster, ClusterSpec, ReaderBehavior};
use dirrepl::{AssuredRequest, PeerStatus, ServerId};

use crate::fixtures::scripted_peer::{ds, replica, rs};

const CONVERGE: Duration = Duration::from_secs(5);

fn started(spec: ClusterSpec) -> Cluster {
    let cluster = Cluster::start(&spec).expect("cluster");
    assert!(cluster.wait_converged(CONVERGE), "topology never converged");
    cluster
}

#[test]
fn safe_read_waits_for_replay_on_every_reader() {
    let spec = ClusterSpec {
        replay_delay: Duration::from_millis(50),
        ..ClusterSpec::default()
    }
    .with_relays(2)
    .with_readers([ReaderBehavior::Replay, ReaderBehavior::Replay]);
    let cluster = started(spec);

    let completion = cluster
        .writer()
        .write_with("cn=a", Some(AssuredRequest::SafeRead), Duration::from_secs(3))
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.report.is_positive());
    assert_eq!(
        completion.required,
        BTreeSet::from([ClusterSpec::reader_id(0), ClusterSpec::reader_id(1)])
    );
    assert!(completion.elapsed >= Duration::from_millis(50));

    for reader in cluster.readers() {
        assert!(reader.wait_until(CONVERGE, |r| r.server_state().covers(&completion.csn)));
        assert!(reader.wait_until(CONVERGE, |r| {
            r.monitor().snapshot().received.safe_read_received_acked == 1
        }));
    }
    cluster.shutdown();
}

#[test]
fn replay_error_is_a_degraded_ack() {
    let cluster = started(ClusterSpec::default().with_readers([ReaderBehavior::Fail]));
    let failing = ClusterSpec::reader_id(0);

    let completion = cluster
        .writer()
        .write_with("cn=b", Some(AssuredRequest::SafeRead), Duration::from_secs(3))
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.is_degraded());
    assert!(completion.report.has_replay_error);
    assert_eq!(completion.failed_server_ids(), &BTreeSet::from([failing]));

    let snapshot = cluster.writer().monitor().snapshot();
    assert_eq!(snapshot.safe_read.replay_error_updates, 1);
    assert_eq!(
        snapshot.safe_read.server_not_acknowledged_updates.get(&failing),
        Some(&1)
    );
    assert!(cluster.reader(0).wait_until(CONVERGE, |r| {
        r.monitor().snapshot().received.safe_read_received_not_acked == 1
    }));
    cluster.shutdown();
}

#[test]
fn safe_data_counts_relays_across_the_mesh() {
    let cluster = started(ClusterSpec::default().with_relays(3));
    let request = AssuredRequest::safe_data(2).expect("level");

    let completion = cluster
        .writer()
        .write_with("cn=c", Some(request), Duration::from_secs(3))
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.report.is_positive());
    let relays: BTreeSet<ServerId> = (0..3).map(ClusterSpec::relay_id).collect();
    assert_eq!(completion.required, relays);
    assert!(completion.elapsed < Duration::from_secs(1));

    for relay in cluster.relays() {
        assert!(relay.wait_until(CONVERGE, |r| r.server_state().covers(&completion.csn)));
    }
    cluster.shutdown();
}

#[test]
fn stalled_reader_is_demoted_and_recovers_once_drained() {
    let base = ReplicationConfig {
        window_size: 2,
        degraded_status_threshold: 3,
        ..ReplicationConfig::default()
    };
    let spec = ClusterSpec {
        base,
        writer_timeout: Some(Duration::from_millis(300)),
        ..ClusterSpec::default()
    }
    .with_readers([ReaderBehavior::Replay, ReaderBehavior::Stall]);
    let cluster = started(spec);
    let writer = cluster.writer();
    let stalled = ClusterSpec::reader_id(1);
    let timeout = Duration::from_millis(300);

    let mut timed_out = 0;
    for index in 0..10 {
        if writer.peer_status(stalled) == Some(PeerStatus::Degraded) {
            break;
        }
        let completion = writer
            .write_with(format!("cn=d{index}"), Some(AssuredRequest::SafeRead), timeout)
            .expect("write");
        if completion.is_timed_out() {
            assert_eq!(completion.failed_server_ids(), &BTreeSet::from([stalled]));
            timed_out += 1;
        }
    }
    assert!(timed_out > 0);
    assert!(writer.wait_until(CONVERGE, |w| {
        w.peer_status(stalled) == Some(PeerStatus::Degraded)
    }));

    let completion = writer
        .write_with("cn=excluded", Some(AssuredRequest::SafeRead), timeout)
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.report.has_wrong_status);
    assert_eq!(completion.failed_server_ids(), &BTreeSet::from([stalled]));
    assert_eq!(completion.required, BTreeSet::from([ClusterSpec::reader_id(0)]));

    let _replayer = cluster.reader(1).spawn_replayer(|_| Ok(()));
    assert!(writer.wait_until(CONVERGE, |w| {
        w.peer_status(stalled) == Some(PeerStatus::Normal)
    }));
    let completion = writer
        .write_with("cn=back", Some(AssuredRequest::SafeRead), Duration::from_secs(3))
        .expect("write");
    assert!(completion.is_acked());
    assert!(completion.report.is_positive());
    assert!(completion.required.contains(&stalled));
    cluster.shutdown();
}

#[test]
fn demoted_reader_recovers_when_drain_is_not_a_whole_half_window() {
    let base = ReplicationConfig {
        window_size: 10,
        degraded_status_threshold: 3,
        ..ReplicationConfig::default()
    };
    let spec = ClusterSpec {
        base,
        ..ClusterSpec::default()
    }
    .with_readers([ReaderBehavior::Stall]);
    let cluster = started(spec);
    let reader = ClusterSpec::reader_id(0);

    // Seven updates against a half-window of five.
    for index in 0..7 {
        cluster
            .writer()
            .write_with(format!("cn=g{index}"), None, Duration::from_secs(1))
            .expect("write");
    }
    let relay = cluster.relay(0);
    assert!(relay.wait_until(CONVERGE, |r| {
        r.peer_status(reader) == Some(PeerStatus::Degraded)
    }));

    let _replayer = cluster.reader(0).spawn_replayer(|_| Ok(()));
    assert!(
        relay.wait_until(CONVERGE, |r| r.peer_status(reader) == Some(PeerStatus::Normal)),
        "reader drained everything but stayed degraded"
    );
    assert!(cluster.writer().wait_until(CONVERGE, |w| {
        w.peer_status(reader) == Some(PeerStatus::Normal)
    }));
    cluster.shutdown();
}

#[test]
fn shutdown_releases_a_blocked_writer() {
    let cluster = started(ClusterSpec::default().with_readers([ReaderBehavior::Stall]));
    let writer = cluster.writer();

    let completion = thread::scope(|scope| {
        let pending = scope.spawn(|| {
            writer
                .write_with("cn=e", Some(AssuredRequest::SafeRead), Duration::from_secs(30))
                .expect("write")
        });
        thread::sleep(Duration::from_millis(200));
        writer.shutdown();
        pending.join().expect("writer thread")
    });
    assert!(completion.is_timed_out());
    assert!(completion.elapsed < Duration::from_secs(5));
    cluster.shutdown();
}

#[test]
fn late_joiner_receives_missed_changes_in_order() {
    let writer = replica(&ds(1), Duration::from_secs(1));
    let relay = replica(&rs(100), Duration::from_secs(1));
    let reader = replica(&ds(2), Duration::from_secs(1));
    reader.connect(&relay);
    assert!(reader.wait_for_peers(1, CONVERGE));

    let written: Vec<_> = (0..3)
        .map(|index| {
            writer
                .write_with(format!("cn=offline-{index}"), None, Duration::from_secs(1))
                .expect("write")
                .csn
        })
        .collect();
    writer.connect(&relay);

    let received: Vec<_> = (0..3)
        .map(|_| {
            let inbound = reader
                .inbound()
                .recv_timeout(CONVERGE)
                .expect("missed change");
            let csn = inbound.csn();
            inbound.finish(Ok(()));
            csn
        })
        .collect();
    assert_eq!(received, written);
}
