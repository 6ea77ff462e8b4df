//! `tokenrelay chat`: send one message and stream the reply to stdout.

use std::io::Write;

use anyhow::{anyhow, Context};
use clap::ArgMatches;
use tokenrelay_client::{ChatClient, ChatRequest, MessageUpdate};

use crate::config::AppConfig;

pub async fn run(matches: &ArgMatches, config: AppConfig) -> anyhow::Result<()> {
    let mut client_config = config.client;
    if let Some(url) = matches.get_one::<String>("url") {
        client_config.server_url = url.clone();
    }
    let message = matches
        .get_one::<String>("message")
        .context("a message is required")?;
    let model = matches
        .get_one::<String>("model")
        .cloned()
        .unwrap_or_else(|| "echo".to_string());

    let mut request = ChatRequest::new(message.as_str(), model);
    if let Some(conversation) = matches.get_one::<String>("conversation") {
        request = request.in_conversation(conversation.as_str().into());
    }
    let images: Vec<String> = matches
        .get_many::<String>("image")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if !images.is_empty() {
        request = request.with_images(images, matches.get_one::<String>("vision-model").cloned());
    }

    let client = ChatClient::new(client_config)?;
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", client.config().server_url))?;

    let (id, mut updates) = client.stream_message(request).await?;
    tracing::debug!(message_id = %id, "message sent");

    let mut stdout = std::io::stdout();
    let outcome = loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tokio::signal::ctrl_c() => {
                client.cancel(&id).await?;
                continue;
            }
        };

        match update {
            Some(MessageUpdate::Token(token)) => {
                print!("{}", token);
                stdout.flush()?;
            }
            Some(MessageUpdate::ConversationCreated(conversation)) => {
                tracing::info!(conversation_id = %conversation, "conversation created");
            }
            Some(MessageUpdate::Complete {
                conversation_id,
                metadata,
            }) => {
                println!();
                let conversation = conversation_id
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                eprintln!(
                    "\x1b[32m\u{2713}\x1b[0m complete (conversation {}, {} tokens)",
                    conversation,
                    metadata.token_count.unwrap_or_default()
                );
                break Ok(());
            }
            Some(MessageUpdate::Error(error)) => {
                println!();
                break Err(anyhow!("generation failed: {}", error));
            }
            Some(MessageUpdate::Cancelled) => {
                println!();
                break Err(anyhow!("message {} cancelled", id));
            }
            Some(MessageUpdate::Thinking) | Some(MessageUpdate::Generating) => {}
            None => break Err(anyhow!("update stream closed before a terminal event")),
        }
    };

    client.shutdown().await;
    outcome
}
