//! Human renderer for CLI outputs.

use crate::core::{AssuredMode, AssuredRequest};
use crate::daemon::monitor::ModeCounters;
use crate::sim::SimulationReport;

pub fn render_report(report: &SimulationReport, request: Option<AssuredRequest>) -> String {
    let mut out = String::new();
    let mode = match request {
        Some(AssuredRequest::SafeData { level }) => format!("safe-data (level {level})"),
        Some(AssuredRequest::SafeRead) => "safe-read".to_string(),
        None => "not assured".to_string(),
    };
    out.push_str(&format!(
        "{} writes, {mode}, {} ms\n",
        report.writes, report.elapsed_ms
    ));
    out.push_str(&format!(
        "  acked: {}  degraded: {}  timed out: {}  max latency: {} ms",
        report.acked, report.degraded, report.timed_out, report.max_latency_ms
    ));
    if let Some(request) = request {
        let counters = report.monitor.mode(request.mode());
        out.push('\n');
        out.push_str(&render_counters(request.mode(), counters));
    }
    out
}

fn render_counters(mode: AssuredMode, counters: &ModeCounters) -> String {
    let mut out = format!(
        "  {mode}: sent {} acked {} not acked {} (timeout {}, wrong status {}, replay error {})",
        counters.sent_updates,
        counters.acknowledged_updates,
        counters.not_acknowledged_updates,
        counters.timeout_updates,
        counters.wrong_status_updates,
        counters.replay_error_updates,
    );
    for (server, count) in &counters.server_not_acknowledged_updates {
        out.push_str(&format!("\n    server {server}: {count} not acked"));
    }
    out
}
