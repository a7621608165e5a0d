use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    api::PanelClient,
    config::AgentConfig,
    dispatch::Dispatcher,
    probe,
    reconcile::Reconciler,
    store::ServiceStore,
    telemetry, upgrade,
};

/// Read side gives up if the coordinator stays silent this long; the
/// coordinator pings well inside the window.
const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// One full connection lifetime: dial, run background work, pump frames
/// until the socket dies. Returning (Ok or Err) hands control back to
/// the reconnect loop.
pub async fn run_once(
    cfg: &AgentConfig,
    client: Arc<PanelClient>,
    store: ServiceStore,
    strict: bool,
) -> anyhow::Result<()> {
    let url = cfg.ws_url();
    let (socket, _resp) = tokio_tungstenite::connect_async(&url)
        .await
        .context("dial coordinator")?;
    info!(addr = %cfg.addr, role = cfg.role.as_str(), "connected to coordinator");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let pinger = {
        let out = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if out.send(Message::Ping(b"ping".to_vec().into())).await.is_err() {
                    return;
                }
            }
        })
    };

    let mut background = vec![
        tokio::spawn(telemetry::report_loop(out_tx.clone())),
        tokio::spawn(
            Reconciler::new(client.clone(), store.clone(), strict).run_periodic(),
        ),
        tokio::spawn(probe::run_loop(client.clone())),
    ];
    background.push({
        let client = client.clone();
        let role = cfg.role;
        tokio::spawn(async move {
            upgrade::cross_check_counterpart(&client, role).await;
        })
    });

    let dispatcher = Dispatcher::new(
        store,
        client,
        cfg.role,
        cfg.version.clone(),
        out_tx.clone(),
    );

    let result = loop {
        match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => break Err(anyhow::anyhow!("no traffic for {READ_DEADLINE:?}")),
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(e).context("read frame"),
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => dispatcher.handle_frame(text.as_bytes()).await,
                Message::Binary(bytes) => dispatcher.handle_frame(&bytes).await,
                Message::Close(frame) => {
                    debug!(?frame, "coordinator closed the connection");
                    break Ok(());
                }
                // Pings are answered by tungstenite itself; both
                // directions just refresh the deadline.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            },
        }
    };

    for handle in background {
        handle.abort();
    }
    pinger.abort();
    drop(out_tx);
    writer.abort();

    result
}

/// Reconnect forever with a short fixed backoff. Only a missing
/// identity at startup is fatal; everything after that retries.
pub async fn run(cfg: AgentConfig) {
    const RECONNECT_DELAY: Duration = Duration::from_secs(3);

    let client = Arc::new(PanelClient::new(&cfg));
    let store = ServiceStore::from_env();
    let strict = Reconciler::strict_from_env();

    loop {
        match run_once(&cfg, client.clone(), store.clone(), strict).await {
            Ok(()) => info!("connection closed, reconnecting"),
            Err(e) => warn!(error = %e, "connection lost, reconnecting"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
