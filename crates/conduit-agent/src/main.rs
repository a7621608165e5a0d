use conduit_agent::{config::AgentConfig, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AgentConfig::load()?;
    tracing::info!(
        role = cfg.role.as_str(),
        version = %cfg.version,
        addr = %cfg.addr,
        "agent starting"
    );

    run::run(cfg).await;
    Ok(())
}
