use std::{sync::OnceLock, time::Duration};

use conduit_proto::{DiagnoseReport, DiagnoseRequest};
use rand::Rng;
use regex::Regex;
use tokio::{net::TcpStream, process::Command, time::timeout};
use tracing::debug;

const DEFAULT_COUNT: u32 = 3;
const DEFAULT_TIMEOUT_MS: u64 = 1500;
const DEFAULT_IPERF_DURATION: u64 = 5;

/// Run one diagnostics request. Never returns an error: every failure
/// mode becomes a `success: false` report so the caller always gets a
/// correlated reply.
pub async fn run(req: &DiagnoseRequest) -> DiagnoseReport {
    let mut report = match req.mode.to_ascii_lowercase().as_str() {
        "icmp" => {
            let count = if req.count == 0 { DEFAULT_COUNT } else { req.count };
            let timeout_ms = if req.timeout_ms == 0 {
                DEFAULT_TIMEOUT_MS
            } else {
                req.timeout_ms
            };
            icmp_probe(&req.host, count, timeout_ms).await
        }
        "iperf3" if req.server => iperf_server(req.port).await,
        "iperf3" if req.client => {
            let duration = if req.duration == 0 {
                DEFAULT_IPERF_DURATION
            } else {
                req.duration
            };
            iperf_client(&req.host, req.port, duration, req.reverse).await
        }
        "iperf3" => DiagnoseReport {
            success: false,
            message: Some("unknown iperf3 mode".to_string()),
            ..Default::default()
        },
        _ => tcp_probe(req).await,
    };
    report.ctx = req.ctx.clone();
    report
}

/// Timed TCP connect loop: average latency over `count` attempts plus a
/// whole-percent loss figure.
async fn tcp_probe(req: &DiagnoseRequest) -> DiagnoseReport {
    let count = if req.count == 0 { DEFAULT_COUNT } else { req.count };
    let timeout_ms = if req.timeout_ms == 0 {
        DEFAULT_TIMEOUT_MS
    } else {
        req.timeout_ms
    };
    let target = if req.host.contains(':') && !req.host.starts_with('[') {
        format!("[{}]:{}", req.host, req.port)
    } else {
        format!("{}:{}", req.host, req.port)
    };

    let mut ok = 0u32;
    let mut total_ms = 0i64;
    for _ in 0..count {
        let started = std::time::Instant::now();
        match timeout(Duration::from_millis(timeout_ms), TcpStream::connect(&target)).await {
            Ok(Ok(_)) => {
                ok += 1;
                total_ms += started.elapsed().as_millis() as i64;
            }
            Ok(Err(e)) => debug!(%target, error = %e, "tcp probe attempt failed"),
            Err(_) => debug!(%target, "tcp probe attempt timed out"),
        }
    }

    let loss = ((count - ok) * 100 / count) as i64;
    DiagnoseReport {
        success: ok > 0,
        message: Some(if ok > 0 { "ok" } else { "connect fail" }.to_string()),
        average_time: Some(if ok > 0 { total_ms / ok as i64 } else { 0 }),
        packet_loss: Some(loss),
        ..Default::default()
    }
}

/// ICMP via the system `ping` binary: no raw-socket capability needed,
/// and its output format is stable enough to parse.
pub async fn icmp_probe(host: &str, count: u32, timeout_ms: u64) -> DiagnoseReport {
    let timeout_s = (timeout_ms / 1000).max(1);
    let mut cmd = Command::new("ping");
    if host.contains(':') {
        cmd.arg("-6");
    }
    let output = cmd
        .arg("-c")
        .arg(count.to_string())
        .arg("-W")
        .arg(timeout_s.to_string())
        .arg(host)
        .output()
        .await;

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            return DiagnoseReport {
                success: false,
                message: Some(format!("ping unavailable: {e}")),
                packet_loss: Some(100),
                average_time: Some(0),
                ..Default::default()
            };
        }
    };

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let loss = parse_packet_loss(&text).unwrap_or(100);
    let avg = parse_avg_rtt(&text).unwrap_or(0);
    let success = output.status.success() && loss < 100;
    DiagnoseReport {
        success,
        message: Some(if success { "ok" } else { "unreachable" }.to_string()),
        average_time: Some(avg),
        packet_loss: Some(loss),
        ..Default::default()
    }
}

fn loss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9.]+)% packet loss").unwrap())
}

fn rtt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "rtt min/avg/max/mdev = 0.4/1.2/2.0/0.5 ms"
    RE.get_or_init(|| Regex::new(r"=\s*[0-9.]+/([0-9.]+)/").unwrap())
}

pub fn parse_packet_loss(text: &str) -> Option<i64> {
    loss_re()
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|v| v.round() as i64)
}

pub fn parse_avg_rtt(text: &str) -> Option<i64> {
    rtt_re()
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|v| v.round() as i64)
}

/// Pick a free high port for an ephemeral iperf3 server.
pub fn pick_port() -> u16 {
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let port: u16 = rng.gen_range(20000..40000);
        if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return port;
        }
    }
    0
}

/// Launch a daemonized one-shot iperf3 server and report the chosen port
/// so a paired node can connect.
async fn iperf_server(requested: u16) -> DiagnoseReport {
    let port = if requested != 0 { requested } else { pick_port() };
    if port == 0 {
        return DiagnoseReport {
            success: false,
            message: Some("no free port for iperf3 server".to_string()),
            ..Default::default()
        };
    }
    let spawned = Command::new("iperf3")
        .arg("-s")
        .arg("-D")
        .arg("-1")
        .arg("-p")
        .arg(port.to_string())
        .output()
        .await;
    match spawned {
        Ok(o) if o.status.success() => DiagnoseReport {
            success: true,
            message: Some("iperf3 server started".to_string()),
            port: Some(port),
            ..Default::default()
        },
        Ok(o) => DiagnoseReport {
            success: false,
            message: Some(format!(
                "iperf3 server failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            )),
            ..Default::default()
        },
        Err(e) => DiagnoseReport {
            success: false,
            message: Some(format!("iperf3 unavailable: {e}")),
            ..Default::default()
        },
    }
}

async fn iperf_client(host: &str, port: u16, duration: u64, reverse: bool) -> DiagnoseReport {
    let mut cmd = Command::new("iperf3");
    cmd.arg("-J")
        .arg("-c")
        .arg(host)
        .arg("-p")
        .arg(port.to_string())
        .arg("-t")
        .arg(duration.to_string());
    if reverse {
        cmd.arg("-R");
    }
    let output = match cmd.output().await {
        Ok(o) => o,
        Err(e) => {
            return DiagnoseReport {
                success: false,
                message: Some(format!("iperf3 unavailable: {e}")),
                ..Default::default()
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_iperf_mbps(&stdout) {
        Some(mbps) => DiagnoseReport {
            success: true,
            message: Some("ok".to_string()),
            bandwidth_mbps: Some(mbps),
            ..Default::default()
        },
        None => DiagnoseReport {
            success: false,
            message: Some(format!(
                "iperf3 run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            ..Default::default()
        },
    }
}

/// Pull the end-of-run throughput from iperf3 JSON output, preferring
/// the receiver-side sum.
pub fn parse_iperf_mbps(json_text: &str) -> Option<f64> {
    let v: serde_json::Value = serde_json::from_str(json_text).ok()?;
    let end = v.get("end")?;
    let bps = end
        .get("sum_received")
        .or_else(|| end.get("sum_sent"))?
        .get("bits_per_second")?
        .as_f64()?;
    Some(bps / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_probe_reports_total_loss_on_closed_port() {
        // Bind, learn the port, then drop the listener so the port is
        // known-closed for the probe.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let req = DiagnoseRequest {
            host: "127.0.0.1".into(),
            port,
            count: 2,
            timeout_ms: 300,
            ..Default::default()
        };
        let report = run(&req).await;
        assert!(!report.success);
        assert_eq!(report.packet_loss, Some(100));
        assert_eq!(report.message.as_deref(), Some("connect fail"));
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let req = DiagnoseRequest {
            host: "127.0.0.1".into(),
            port,
            count: 2,
            timeout_ms: 500,
            ctx: Some(serde_json::json!({"probe": 1})),
            ..Default::default()
        };
        let report = run(&req).await;
        assert!(report.success);
        assert_eq!(report.packet_loss, Some(0));
        assert_eq!(report.ctx, req.ctx, "ctx must be echoed untouched");
    }

    #[tokio::test]
    async fn mode_is_matched_case_insensitively() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let req = DiagnoseRequest {
            host: "127.0.0.1".into(),
            port,
            mode: "TCP".into(),
            count: 1,
            timeout_ms: 500,
            ..Default::default()
        };
        let report = run(&req).await;
        assert!(report.success);
    }

    #[tokio::test]
    async fn iperf3_without_a_side_selected_is_rejected() {
        let req = DiagnoseRequest {
            host: "127.0.0.1".into(),
            port: 5201,
            mode: "iperf3".into(),
            ..Default::default()
        };
        let report = run(&req).await;
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("unknown iperf3 mode"));
    }

    #[test]
    fn ping_output_parses() {
        let text = "\
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 10.312/12.871/15.002/1.771 ms
";
        assert_eq!(parse_packet_loss(text), Some(25));
        assert_eq!(parse_avg_rtt(text), Some(13));
    }

    #[test]
    fn ping_total_loss_has_no_rtt_line() {
        let text = "3 packets transmitted, 0 received, 100% packet loss, time 2030ms\n";
        assert_eq!(parse_packet_loss(text), Some(100));
        assert_eq!(parse_avg_rtt(text), None);
    }

    #[test]
    fn iperf_json_prefers_receiver_sum() {
        let text = r#"{"end": {"sum_sent": {"bits_per_second": 1.0e9},
                       "sum_received": {"bits_per_second": 9.4e8}}}"#;
        let mbps = parse_iperf_mbps(text).unwrap();
        assert!((mbps - 940.0).abs() < 0.01);
    }

    #[test]
    fn ephemeral_port_is_in_range() {
        let port = pick_port();
        assert!((20000..40000).contains(&port));
    }
}
