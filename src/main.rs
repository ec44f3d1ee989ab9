use std::sync::Arc;

use estuary::bridge::{
    ident, AdvancedSettings, BridgedClient, ClientConfig, EventBroker, IdentRegistry,
    IdentityGenerator, ServerConfig,
};
use tokio::sync::Semaphore;
use tracing::info;

/// Connect one bridged client to the server named in `ESTUARY_SERVER` and
/// print every event it surfaces. A smoke harness, not the bridge itself.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let domain = std::env::var("ESTUARY_SERVER").unwrap_or_else(|_| "localhost".into());
    let nick = std::env::var("ESTUARY_NICK").unwrap_or_else(|_| "estuary".into());
    let channel = std::env::var("ESTUARY_CHANNEL").unwrap_or_else(|_| "#estuary".into());

    let advanced = AdvancedSettings {
        ident_bind: std::env::var("ESTUARY_IDENT_BIND").ok(),
        ..AdvancedSettings::default()
    };

    let registry = Arc::new(IdentRegistry::new());
    if let Some(bind) = advanced.ident_bind.clone() {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = ident::run_responder(registry, &bind).await {
                tracing::warn!("ident responder exited: {e}");
            }
        });
    }
    let limiter = Arc::new(Semaphore::new(advanced.max_outbound_sockets));

    let (broker, mut events) = EventBroker::channel();
    let client = BridgedClient::new(
        Arc::new(ServerConfig::new(&domain)),
        ClientConfig::new(&nick),
        None,
        None,
        true,
        broker,
        registry,
        Arc::new(IdentityGenerator::new()),
        None,
        Some(limiter),
    );

    info!("estuary — connecting to {domain} as {nick}");
    client.connect().await?;
    client.join_channel(&channel, None).await?;

    while let Some(event) = events.recv().await {
        info!("{event:?}");
    }

    Ok(())
}
