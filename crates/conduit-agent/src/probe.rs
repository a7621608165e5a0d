use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    api::{PanelClient, ProbeReading},
    diagnose,
};

const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Ping each coordinator-assigned target once and report the readings.
/// Errors skip the cycle; the next tick retries.
async fn run_once(client: &PanelClient) {
    let targets = match client.probe_targets().await {
        Ok(t) => t,
        Err(e) => {
            debug!(error = %e, "probe: target fetch failed");
            return;
        }
    };
    if targets.is_empty() {
        return;
    }

    let mut readings = Vec::with_capacity(targets.len());
    for target in &targets {
        if target.ip.is_empty() {
            continue;
        }
        let report = diagnose::icmp_probe(&target.ip, 1, 1000).await;
        let rtt = report.average_time.unwrap_or(0);
        let loss = report.packet_loss.unwrap_or(100);
        readings.push(ProbeReading {
            target_id: target.id,
            rtt_ms: rtt,
            ok: (loss < 100 && report.success) as i64,
        });
    }

    if readings.is_empty() {
        return;
    }
    if let Err(e) = client.report_probe(&readings).await {
        debug!(error = %e, "probe: report failed");
    }
}

pub async fn run_loop(client: Arc<PanelClient>) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    loop {
        ticker.tick().await;
        run_once(&client).await;
    }
}
