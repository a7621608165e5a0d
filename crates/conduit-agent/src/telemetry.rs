use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Parse the aggregate `cpu ` line of /proc/stat. idle includes iowait.
pub fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let total = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { idle, total })
}

/// CPU usage needs two samples; the tracker keeps the previous one and
/// reports the busy share of the delta.
#[derive(Debug, Default)]
pub struct CpuTracker {
    prev: Option<CpuTimes>,
}

impl CpuTracker {
    pub fn update(&mut self, sample: CpuTimes) -> f64 {
        let usage = match self.prev {
            Some(prev) if sample.total > prev.total => {
                let total = (sample.total - prev.total) as f64;
                let idle = sample.idle.saturating_sub(prev.idle) as f64;
                ((total - idle) / total * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        self.prev = Some(sample);
        usage
    }
}

/// Used-memory percentage from /proc/meminfo (MemTotal vs MemAvailable).
pub fn parse_meminfo(text: &str) -> Option<f64> {
    fn kib(text: &str, key: &str) -> Option<u64> {
        text.lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }
    let total = kib(text, "MemTotal:")?;
    let available = kib(text, "MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

/// Cumulative rx/tx byte totals summed over every interface except
/// loopback, from /proc/net/dev.
pub fn parse_net_dev(text: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() >= 9 {
            rx += fields[0].parse::<u64>().unwrap_or(0);
            tx += fields[8].parse::<u64>().unwrap_or(0);
        }
    }
    (rx, tx)
}

pub fn parse_uptime(text: &str) -> u64 {
    text.split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u64)
        .unwrap_or(0)
}

/// Global-scope addresses per interface, best effort via `ip -o addr`.
async fn interfaces() -> Value {
    let mut out = serde_json::Map::new();
    for family in ["-4", "-6"] {
        let Ok(output) = tokio::process::Command::new("ip")
            .args(["-o", family, "addr", "show", "up", "scope", "global"])
            .output()
            .await
        else {
            continue;
        };
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // "2: eth0    inet 203.0.113.5/24 ..."
            if fields.len() >= 4 {
                let name = fields[1].to_string();
                let addr = fields[3].split('/').next().unwrap_or("").to_string();
                out.entry(name)
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .map(|v| v.push(Value::String(addr)));
            }
        }
    }
    Value::Object(out)
}

async fn read_proc(path: &str) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

async fn sample(cpu: &mut CpuTracker) -> Value {
    let cpu_usage = parse_cpu_line(&read_proc("/proc/stat").await)
        .map(|s| cpu.update(s))
        .unwrap_or(0.0);
    let mem_usage = parse_meminfo(&read_proc("/proc/meminfo").await).unwrap_or(0.0);
    let (rx, tx) = parse_net_dev(&read_proc("/proc/net/dev").await);
    let uptime = parse_uptime(&read_proc("/proc/uptime").await);

    json!({
        "Uptime": uptime,
        "BytesReceived": rx,
        "BytesTransmitted": tx,
        "CPUUsage": cpu_usage,
        "MemoryUsage": mem_usage,
        "Interfaces": interfaces().await,
    })
}

/// Push a telemetry frame every few seconds until the socket writer
/// goes away.
pub async fn report_loop(out: mpsc::Sender<Message>) {
    let mut cpu = CpuTracker::default();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        let payload = sample(&mut cpu).await;
        let text = payload.to_string();
        if out.send(Message::text(text)).await.is_err() {
            debug!("telemetry loop stopping: connection writer gone");
            return;
        }
    }
}
