use std::{path::Path, time::Duration};

use anyhow::Context;
use conduit_proto::ServiceSpec;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::config::{AgentConfig, AgentRole};

/// External probe target handed out by the coordinator.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeTarget {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
}

/// One probe measurement reported back. `ok` is 0/1 on the wire.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReading {
    pub target_id: i64,
    pub rtt_ms: i64,
    pub ok: i64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ExpectedVersions {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub agent2: String,
}

#[derive(Debug, serde::Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    data: Option<T>,
}

/// Thin client for the coordinator HTTP surface. Every call carries the
/// node secret; a transport error or non-zero `code` aborts the current
/// cycle only — callers retry on their next tick.
pub struct PanelClient {
    base: String,
    secret: String,
    http: reqwest::Client,
}

impl PanelClient {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            base: cfg.http_base(),
            secret: cfg.secret.clone(),
            http: reqwest::Client::builder()
                .user_agent("conduit-agent")
                .timeout(Duration::from_secs(8))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<Option<T>> {
        let url = format!("{}{path}", self.base);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("post {path}"))?
            .error_for_status()
            .with_context(|| format!("post {path} (status)"))?;
        let env: ApiEnvelope<T> = resp
            .json()
            .await
            .with_context(|| format!("parse {path} response"))?;
        if env.code != 0 {
            anyhow::bail!("{path} returned code {}", env.code);
        }
        Ok(env.data)
    }

    pub async fn desired_services(&self) -> anyhow::Result<Vec<ServiceSpec>> {
        let data: Option<Vec<ServiceSpec>> = self
            .post_json(
                "/api/v1/agent/desired-services",
                &serde_json::json!({"secret": self.secret}),
            )
            .await?;
        Ok(data.unwrap_or_default())
    }

    pub async fn push_services(&self, services: &[ServiceSpec]) -> anyhow::Result<()> {
        self.post_json::<serde_json::Value>(
            "/api/v1/agent/push-services",
            &serde_json::json!({"secret": self.secret, "services": services}),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_services(&self, names: &[String]) -> anyhow::Result<()> {
        self.post_json::<serde_json::Value>(
            "/api/v1/agent/remove-services",
            &serde_json::json!({"secret": self.secret, "services": names}),
        )
        .await?;
        Ok(())
    }

    pub async fn probe_targets(&self) -> anyhow::Result<Vec<ProbeTarget>> {
        let data: Option<Vec<ProbeTarget>> = self
            .post_json(
                "/api/v1/agent/probe-targets",
                &serde_json::json!({"secret": self.secret}),
            )
            .await?;
        Ok(data.unwrap_or_default())
    }

    pub async fn report_probe(&self, results: &[ProbeReading]) -> anyhow::Result<()> {
        self.post_json::<serde_json::Value>(
            "/api/v1/agent/report-probe",
            &serde_json::json!({"secret": self.secret, "results": results}),
        )
        .await?;
        Ok(())
    }

    pub async fn expected_versions(&self) -> anyhow::Result<ExpectedVersions> {
        let url = format!("{}/api/v1/version", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("get /api/v1/version")?
            .error_for_status()
            .context("get /api/v1/version (status)")?;
        let env: ApiEnvelope<ExpectedVersions> =
            resp.json().await.context("parse version response")?;
        if env.code != 0 {
            anyhow::bail!("/api/v1/version returned code {}", env.code);
        }
        Ok(env.data.unwrap_or_default())
    }

    /// Download URL of a role/arch-named agent binary.
    pub fn artifact_url(&self, role: AgentRole, arch: &str) -> String {
        format!(
            "{}/conduit-agent/{}-linux-{arch}",
            self.base,
            role.service_name()
        )
    }

    /// Stream a download straight to `dest`. Callers pass a temp path
    /// next to the final target and rename afterwards, so a failed
    /// download never leaves a partially written binary installed.
    pub async fn download_to(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Separate client: binary downloads outlive the API timeout.
        let client = reqwest::Client::builder()
            .user_agent("conduit-agent")
            .timeout(Duration::from_secs(10 * 60))
            .build()
            .context("build download client")?;

        let resp = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentRole;

    fn client() -> PanelClient {
        let cfg = AgentConfig {
            addr: "panel:8080".into(),
            secret: "s".into(),
            scheme: "ws".into(),
            role: AgentRole::Agent1,
            version: "v".into(),
        };
        PanelClient::new(&cfg)
    }

    #[test]
    fn artifact_urls_are_role_and_arch_named() {
        let c = client();
        assert_eq!(
            c.artifact_url(AgentRole::Agent1, "amd64"),
            "http://panel:8080/conduit-agent/conduit-agent-linux-amd64"
        );
        assert_eq!(
            c.artifact_url(AgentRole::Agent2, "arm64"),
            "http://panel:8080/conduit-agent/conduit-agent2-linux-arm64"
        );
    }

    #[test]
    fn probe_reading_wire_shape() {
        let r = ProbeReading {
            target_id: 3,
            rtt_ms: 12,
            ok: 1,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["targetId"], 3);
        assert_eq!(v["rttMs"], 12);
        assert_eq!(v["ok"], 1);
    }
}
