use std::time::Duration;

use super::super::{SimulateArgs, print_json, print_line, render};
use crate::Result;
use crate::config::Config;
use crate::sim::{Cluster, ClusterSpec};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn handle(args: &SimulateArgs, config: &Config, json: bool) -> Result<()> {
    let request = args.request(config)?;
    let spec = ClusterSpec {
        relays: args.relays,
        replay_delay: Duration::from_millis(args.replay_delay_ms),
        base: config.replication.clone(),
        writer_timeout: args.timeout_ms.map(Duration::from_millis),
        ..ClusterSpec::default()
    }
    .with_readers(args.behaviors());

    let cluster = Cluster::start(&spec)?;
    if !cluster.wait_converged(CONVERGE_TIMEOUT) {
        tracing::warn!(
            expected = cluster.remote_count(),
            "topology did not converge before writing"
        );
    }
    let timeout = cluster.writer().assured_timeout();
    let report = cluster.run_writes(args.writes, request, timeout);
    cluster.shutdown();
    let report = report?;

    if json {
        return print_json(&report);
    }
    print_line(&render::render_report(&report, request))
}
