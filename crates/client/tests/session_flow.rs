use std::sync::Arc;
use std::time::Duration;

use tokenrelay_client::transport::{MemoryAcceptor, MemoryConnector, MemoryPeer};
use tokenrelay_client::{
    ChannelHandler, ChatClient, ChatRequest, ClientConfig, ClientError, ConnectionState,
    Connector, MessageMetadata, MessageUpdate, TransportError,
};
use tokenrelay_protocol::{
    decode_client, encode_server, AckPayload, ClientEvent, CompletePayload, ErrorPayload,
    GenerationMetadata, LifecycleState, MessageId, MessageRef, ServerEvent, TokenPayload,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn client_with(connector: MemoryConnector, config: ClientConfig) -> ChatClient {
    let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(connector)];
    ChatClient::with_connectors(config, connectors).unwrap()
}

async fn connected_client(config: ClientConfig) -> (ChatClient, MemoryAcceptor, MemoryPeer) {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = client_with(connector, config);
    client.connect().await.unwrap();
    let peer = acceptor.accept().await.unwrap();
    (client, acceptor, peer)
}

/// Next non-heartbeat frame the client sent.
async fn next_client_event(peer: &mut MemoryPeer) -> Option<ClientEvent> {
    while let Some(text) = peer.incoming.recv().await {
        match decode_client(&text) {
            Ok(ClientEvent::Ping) | Ok(ClientEvent::Pong) => continue,
            Ok(event) => return Some(event),
            Err(e) => panic!("client sent undecodable frame {:?}: {}", text, e),
        }
    }
    None
}

async fn emit(peer: &MemoryPeer, event: ServerEvent) {
    peer.outgoing
        .send(encode_server(&event).unwrap())
        .await
        .unwrap();
}

fn ack(id: &MessageId) -> ServerEvent {
    ServerEvent::Ack(AckPayload {
        message_id: id.clone(),
    })
}

fn thinking(id: &MessageId) -> ServerEvent {
    ServerEvent::Thinking(MessageRef {
        message_id: id.clone(),
    })
}

fn generating(id: &MessageId) -> ServerEvent {
    ServerEvent::Generating(MessageRef {
        message_id: id.clone(),
    })
}

fn token(id: &MessageId, token: &str) -> ServerEvent {
    ServerEvent::Token(TokenPayload {
        message_id: id.clone(),
        token: token.to_string(),
    })
}

fn complete(id: &MessageId, conversation: &str) -> ServerEvent {
    ServerEvent::Complete(CompletePayload {
        message_id: id.clone(),
        conversation_id: Some(conversation.into()),
        metadata: GenerationMetadata::default(),
    })
}

fn error(id: &MessageId, message: &str) -> ServerEvent {
    ServerEvent::Error(ErrorPayload {
        message_id: id.clone(),
        error: message.to_string(),
    })
}

async fn next_update(updates: &mut UnboundedReceiver<MessageUpdate>) -> MessageUpdate {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("timed out waiting for update")
        .expect("handler channel closed")
}

async fn collect_until_terminal(updates: &mut UnboundedReceiver<MessageUpdate>) -> Vec<MessageUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = next_update(updates).await;
        let terminal = update.is_terminal();
        seen.push(update);
        if terminal {
            return seen;
        }
    }
}

async fn wait_for_queued(client: &ChatClient, count: usize) {
    for _ in 0..500 {
        if client.reconciler().queued_len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never reached {} events", count);
}

#[tokio::test(start_paused = true)]
async fn example_message_streams_in_order_and_is_cleaned_up() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;

    let server = tokio::spawn(async move {
        let Some(ClientEvent::ChatMessage(request)) = next_client_event(&mut peer).await else {
            panic!("expected chat:message");
        };
        assert_eq!(request.content, "hi");
        let id = request.message_id;
        emit(&peer, ack(&id)).await;
        emit(&peer, thinking(&id)).await;
        emit(&peer, generating(&id)).await;
        emit(&peer, token(&id, "Hel")).await;
        emit(&peer, token(&id, "lo")).await;
        emit(&peer, complete(&id, "conv1")).await;
        peer
    });

    let (handler, mut updates) = ChannelHandler::new();
    let id = client
        .send_message_with_id("m1".into(), ChatRequest::new("hi", "echo"), Arc::new(handler))
        .await
        .unwrap();

    let seen = collect_until_terminal(&mut updates).await;
    assert_eq!(
        seen,
        vec![
            MessageUpdate::Thinking,
            MessageUpdate::Generating,
            MessageUpdate::Token("Hel".into()),
            MessageUpdate::Token("lo".into()),
            MessageUpdate::Complete {
                conversation_id: Some("conv1".into()),
                metadata: GenerationMetadata::default(),
            },
        ]
    );

    let snapshot = client.coordinator().snapshot(&id).unwrap();
    assert_eq!(snapshot.state, LifecycleState::Complete);
    assert_eq!(snapshot.token_count, 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(client.coordinator().snapshot(&id).is_none());
    assert!(updates.try_recv().is_err());

    let _peer = server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn duplicate_terminal_events_deliver_once() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;

    let server = tokio::spawn(async move {
        let Some(ClientEvent::ChatMessage(request)) = next_client_event(&mut peer).await else {
            panic!("expected chat:message");
        };
        let id = request.message_id;
        emit(&peer, ack(&id)).await;
        emit(&peer, thinking(&id)).await;
        emit(&peer, generating(&id)).await;
        emit(&peer, complete(&id, "conv1")).await;
        emit(&peer, complete(&id, "conv1")).await;
        emit(&peer, error(&id, "late failure")).await;
        emit(&peer, token(&id, "ghost")).await;
        peer
    });

    let (_id, mut updates) = client
        .stream_message(ChatRequest::new("hi", "echo"))
        .await
        .unwrap();

    let seen = collect_until_terminal(&mut updates).await;
    assert_eq!(seen.len(), 3);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(updates.try_recv().is_err());

    let _peer = server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn events_before_registration_are_delivered_on_register() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;
    let id = MessageId::from("late1");

    emit(&peer, thinking(&id)).await;
    emit(&peer, generating(&id)).await;
    wait_for_queued(&client, 2).await;

    // Inside the retry window: the first retry already ran at 1s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.reconciler().queued_len(), 2);

    let server = tokio::spawn(async move {
        if let Some(ClientEvent::ChatMessage(request)) = next_client_event(&mut peer).await {
            emit(&peer, ack(&request.message_id)).await;
        }
        peer
    });

    let (handler, mut updates) = ChannelHandler::new();
    client
        .send_message_with_id(id.clone(), ChatRequest::new("hi", "echo"), Arc::new(handler))
        .await
        .unwrap();

    assert_eq!(next_update(&mut updates).await, MessageUpdate::Thinking);
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Generating);
    assert_eq!(client.reconciler().queued_len(), 0);
    assert_eq!(
        client.coordinator().state(&id),
        Some(LifecycleState::Generating)
    );

    let _peer = server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_queued_events_in_order() {
    let mut config = ClientConfig::default();
    config.reconciler.initial_retry_delay = Duration::from_secs(30);
    let (client, mut acceptor, peer) = connected_client(config).await;
    let start = tokio::time::Instant::now();

    let id = MessageId::from("m3");
    emit(&peer, thinking(&id)).await;
    emit(&peer, generating(&id)).await;
    emit(&peer, token(&id, "a")).await;
    wait_for_queued(&client, 3).await;

    let in_flight = MessageId::from("m4");
    client
        .coordinator()
        .create(in_flight.clone(), MessageMetadata::default())
        .unwrap();

    // Register without flushing; only the reconnect replay can deliver.
    let (handler, mut updates) = ChannelHandler::new();
    client
        .coordinator()
        .create_with_handler(id.clone(), MessageMetadata::default(), Arc::new(handler))
        .unwrap();
    assert!(updates.try_recv().is_err());

    drop(peer);
    let _peer2 = acceptor.accept().await.unwrap();

    assert_eq!(next_update(&mut updates).await, MessageUpdate::Thinking);
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Generating);
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Token("a".into()));
    assert!(start.elapsed() < Duration::from_secs(30));

    assert_eq!(client.diagnostics().connect_count, 2);
    assert_eq!(
        client.coordinator().state(&in_flight),
        Some(LifecycleState::Pending)
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_message_events_are_dropped_without_callbacks() {
    let (client, _acceptor, peer) = connected_client(ClientConfig::default()).await;

    let (handler, mut updates) = ChannelHandler::new();
    let bystander = MessageId::from("m1");
    client
        .coordinator()
        .create(bystander.clone(), MessageMetadata::default())
        .unwrap();
    client
        .coordinator()
        .register_handler(bystander, Arc::new(handler));

    emit(&peer, token(&"m_unknown".into(), "x")).await;
    wait_for_queued(&client, 1).await;

    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(client.reconciler().queued_len(), 0);
    assert!(updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_bounded_attempts() {
    let (connector, _acceptor) = MemoryConnector::new();
    connector.set_available(false);
    let mut config = ClientConfig::default();
    config.transport.max_reconnect_attempts = 3;
    let client = client_with(connector, config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::ReconnectFailed { attempts: 3 })
    ));
    assert_eq!(
        client.transport().current_state(),
        ConnectionState::Failed { attempts: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn frames_sent_while_disconnected_are_flushed_on_connect() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = client_with(connector, ClientConfig::default());

    let (handler, _updates) = ChannelHandler::new();
    let id = client
        .send_message_with_id("m7".into(), ChatRequest::new("queued", "echo"), Arc::new(handler))
        .await
        .unwrap();
    assert_eq!(client.transport().outbound_len(), 1);

    client.connect().await.unwrap();
    let mut peer = acceptor.accept().await.unwrap();
    match next_client_event(&mut peer).await {
        Some(ClientEvent::ChatMessage(request)) => {
            assert_eq!(request.message_id, id);
            assert_eq!(request.content, "queued");
        }
        other => panic!("expected chat:message, got {:?}", other),
    }
    assert_eq!(client.transport().outbound_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_delivery_and_notifies_server() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;

    let server = tokio::spawn(async move {
        let Some(ClientEvent::ChatMessage(request)) = next_client_event(&mut peer).await else {
            panic!("expected chat:message");
        };
        let id = request.message_id;
        emit(&peer, ack(&id)).await;
        emit(&peer, thinking(&id)).await;

        let cancel = next_client_event(&mut peer).await;
        emit(&peer, token(&id, "late")).await;
        emit(&peer, error(&id, "generation cancelled")).await;
        (peer, cancel)
    });

    let (id, mut updates) = client
        .stream_message(ChatRequest::new("hi", "echo"))
        .await
        .unwrap();
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Thinking);

    assert!(client.cancel(&id).await.unwrap());
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Cancelled);

    let (_peer, cancel) = server.await.unwrap();
    match cancel {
        Some(ClientEvent::ChatCancel(payload)) => assert_eq!(payload.message_id, id),
        other => panic!("expected chat:cancel, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(updates.try_recv().is_err());
    assert_eq!(
        client.coordinator().state(&id),
        Some(LifecycleState::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn graceful_disconnect_keeps_state_and_does_not_reconnect() {
    let (client, mut acceptor, _peer) = connected_client(ClientConfig::default()).await;
    let id = MessageId::from("m9");
    client
        .coordinator()
        .create(id.clone(), MessageMetadata::default())
        .unwrap();

    client.disconnect().await;
    assert_eq!(client.transport().current_state(), ConnectionState::Disconnected);
    assert!(client.coordinator().contains(&id));

    let reconnect = tokio::time::timeout(Duration::from_secs(3), acceptor.accept()).await;
    assert!(reconnect.is_err());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_messages() {
    let (connector, _acceptor) = MemoryConnector::new();
    let client = client_with(connector, ClientConfig::default());

    let (handler, mut updates) = ChannelHandler::new();
    client
        .send_message_with_id("m1".into(), ChatRequest::new("hi", "echo"), Arc::new(handler))
        .await
        .unwrap();

    client.shutdown().await;
    assert_eq!(next_update(&mut updates).await, MessageUpdate::Cancelled);
    assert_eq!(client.coordinator().active_count(), 0);
    assert!(matches!(
        client
            .send_message(ChatRequest::new("again", "echo"), Arc::new(ChannelHandler::new().0))
            .await,
        Err(ClientError::Coordinator(_))
    ));
}

async fn wait_for_heartbeat(client: &ChatClient) -> u64 {
    for _ in 0..500 {
        if let Some(age) = client.diagnostics().last_heartbeat_age_ms {
            return age;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("heartbeat was never recorded");
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_and_tracks_replies() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;
    assert_eq!(client.diagnostics().last_heartbeat_age_ms, None);
    let start = tokio::time::Instant::now();

    let frame = tokio::time::timeout(Duration::from_secs(30), peer.incoming.recv())
        .await
        .expect("no ping within the heartbeat interval")
        .unwrap();
    assert_eq!(frame, r#"{"event":"ping"}"#);
    assert!(start.elapsed() >= Duration::from_secs(25));

    emit(&peer, ServerEvent::Pong).await;
    let recorded = wait_for_heartbeat(&client).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let later = client.diagnostics().last_heartbeat_age_ms.unwrap();
    assert!(later >= recorded + 3_000);

    // A server ping is answered and counts as a heartbeat too.
    emit(&peer, ServerEvent::Ping).await;
    let reply = decode_client(&peer.incoming.recv().await.unwrap()).unwrap();
    assert!(matches!(reply, ClientEvent::Pong));
    assert!(client.diagnostics().last_heartbeat_age_ms.unwrap() < later);
}

#[tokio::test(start_paused = true)]
async fn missing_pongs_do_not_drop_the_link() {
    let (client, _acceptor, mut peer) = connected_client(ClientConfig::default()).await;

    // Three heartbeat periods with every ping left unanswered.
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(30), peer.incoming.recv())
            .await
            .expect("heartbeat stopped")
            .unwrap();
        assert!(matches!(decode_client(&frame), Ok(ClientEvent::Ping)));
    }

    assert!(client.transport().current_state().is_connected());
    let diagnostics = client.diagnostics();
    assert_eq!(diagnostics.connect_count, 1);
    assert_eq!(diagnostics.last_heartbeat_age_ms, None);
}
