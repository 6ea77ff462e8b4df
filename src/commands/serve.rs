//! `tokenrelay serve`: run the chat server.

use std::sync::Arc;
use std::time::Duration;

use clap::ArgMatches;
use tokenrelay_server::{ChatServer, EchoProvider, InMemoryMessageStore};

use crate::config::AppConfig;

pub async fn run(matches: &ArgMatches, config: AppConfig) -> anyhow::Result<()> {
    let mut server_config = config.server;
    if let Some(host) = matches.get_one::<String>("host") {
        server_config.bind_address = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        server_config.port = *port;
    }
    let token_delay = matches
        .get_one::<u64>("token-delay-ms")
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or_default();

    let server = ChatServer::new(
        server_config,
        Arc::new(EchoProvider::with_token_delay(token_delay)),
        Arc::new(InMemoryMessageStore::new()),
    )?;
    let bound = server.bind().await?;
    let addr = bound.local_addr();

    println!("\x1b[32m\u{2713}\x1b[0m tokenrelay server listening on {}", addr);
    println!("  WebSocket:    ws://{}/ws/chat", addr);
    println!("  Long-polling: http://{}/poll/chat", addr);
    println!("  Health:       http://{}/health", addr);

    bound
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
