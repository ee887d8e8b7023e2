use crate::fakes::{stream_feed, ScriptedBackend};
use newsdesk_core::client::{ChatClient, ChatEvent, ClientOptions, SendOptions};
use newsdesk_core::error::ChatError;
use newsdesk_core::push::{ClientEvent, LoopbackLink, ReceivedMessage, ServerEvent};
use newsdesk_core::transport::{ConnectionState, SendMode, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Client over a connected loopback link, with a session created through it.
async fn push_client(backend: Arc<ScriptedBackend>) -> (ChatClient, Arc<LoopbackLink>) {
    let link = Arc::new(LoopbackLink::new(ConnectionState::Connected));
    let client = ChatClient::new(backend, ClientOptions::default()).with_push(link.clone());
    let creating = {
        let client = client.clone();
        tokio::spawn(async move { client.create_session().await })
    };
    wait_for_emit(&link, |event| matches!(event, ClientEvent::CreateSession)).await;
    link.push(ServerEvent::SessionCreated {
        session_id: "push-session".into(),
    });
    creating.await.expect("join").expect("session");
    (client, link)
}

async fn wait_for_emit(link: &LoopbackLink, wanted: impl Fn(&ClientEvent) -> bool) {
    while !link.emitted().iter().any(&wanted) {
        tokio::task::yield_now().await;
    }
}

fn sends_emitted(link: &LoopbackLink) -> usize {
    link.emitted()
        .iter()
        .filter(|event| matches!(event, ClientEvent::SendMessage { .. }))
        .count()
}

async fn wait_for_sends(link: &LoopbackLink, count: usize) {
    while sends_emitted(link) < count {
        tokio::task::yield_now().await;
    }
}

fn answer(content: &str) -> ServerEvent {
    ServerEvent::MessageReceived(ReceivedMessage {
        session_id: Some("push-session".into()),
        content: content.into(),
        sources: Vec::new(),
        timestamp: None,
    })
}

#[test]
fn selection_prefers_a_connected_push_channel() {
    for mode in [SendMode::Streaming, SendMode::Standard] {
        assert_eq!(Transport::select(ConnectionState::Connected, mode), Transport::Push);
    }
    for state in [
        ConnectionState::Connecting,
        ConnectionState::Disconnected,
        ConnectionState::Reconnecting,
    ] {
        assert_eq!(
            Transport::select(state, SendMode::Streaming),
            Transport::StreamingHttp
        );
        assert_eq!(Transport::select(state, SendMode::Standard), Transport::PlainHttp);
    }
}

#[tokio::test]
async fn standard_send_without_push_makes_exactly_one_plain_call() {
    let backend = Arc::new(ScriptedBackend::new());
    let client = ChatClient::new(backend.clone(), ClientOptions::default());
    client.create_session().await.expect("session");

    let outcome = client
        .send("election results", SendOptions::default())
        .await
        .expect("send");

    assert_eq!(outcome.transport, Some(Transport::PlainHttp));
    let counts = backend.counts();
    assert_eq!(counts.send, 1);
    assert_eq!(counts.stream, 0);
}

#[tokio::test]
async fn streaming_send_without_push_uses_the_stream_endpoint() {
    let backend = Arc::new(ScriptedBackend::new());
    let (feed, stream) = stream_feed();
    feed.delta("Polls ");
    feed.delta("closed.");
    feed.end();
    backend.queue_stream(stream);
    let client = ChatClient::new(backend.clone(), ClientOptions::default());
    client.create_session().await.expect("session");

    let outcome = client
        .send("polls", SendOptions::streaming())
        .await
        .expect("send");

    assert_eq!(outcome.transport, Some(Transport::StreamingHttp));
    assert_eq!(outcome.message.expect("answer").text, "Polls closed.");
    assert_eq!(backend.counts().send, 0);
    assert_eq!(backend.counts().stream, 1);
}

#[tokio::test]
async fn invalid_messages_never_reach_any_transport() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;

    assert_eq!(
        client.send("   ", SendOptions::default()).await,
        Err(ChatError::EmptyMessage)
    );
    assert_eq!(
        client.send(&"y".repeat(1001), SendOptions::streaming()).await,
        Err(ChatError::MessageTooLong { max: 1000 })
    );

    assert!(!link
        .emitted()
        .iter()
        .any(|event| matches!(event, ClientEvent::SendMessage { .. })));
    assert_eq!(backend.counts().deliveries(), 0);
    assert!(client.messages().is_empty());
}

#[tokio::test]
async fn sending_without_a_session_fails_before_any_call() {
    let backend = Arc::new(ScriptedBackend::new());
    let client = ChatClient::new(backend.clone(), ClientOptions::default());

    let result = client.send("anything new?", SendOptions::default()).await;

    assert_eq!(result, Err(ChatError::NoActiveSession));
    assert_eq!(backend.counts(), Default::default());
    assert!(client.messages().is_empty());
}

#[tokio::test]
async fn connected_push_channel_carries_the_message() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;
    assert!(client.session_info().push_connected);

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("storm update", SendOptions::streaming()).await })
    };
    wait_for_emit(&link, |event| matches!(event, ClientEvent::SendMessage { .. })).await;
    link.push(ServerEvent::MessageReceived(ReceivedMessage {
        session_id: Some("push-session".into()),
        content: "The storm moved east.".into(),
        sources: Vec::new(),
        timestamp: None,
    }));

    let outcome = sending.await.expect("join").expect("send");
    assert_eq!(outcome.transport, Some(Transport::Push));
    assert_eq!(backend.counts().deliveries(), 0);
    assert_eq!(client.messages().len(), 2);
}

#[tokio::test]
async fn push_error_event_surfaces_as_backend_error() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("sports", SendOptions::default()).await })
    };
    wait_for_emit(&link, |event| matches!(event, ClientEvent::SendMessage { .. })).await;
    link.push(ServerEvent::Error {
        message: "Failed to process message".into(),
    });

    let result = sending.await.expect("join");
    assert!(matches!(result, Err(ChatError::Backend(_))));
    assert_eq!(backend.counts().deliveries(), 0);
}

#[tokio::test]
async fn request_lost_across_a_reconnect_is_resent_and_answered() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("flood warning", SendOptions::default()).await })
    };
    wait_for_sends(&link, 1).await;
    link.set_state(ConnectionState::Reconnecting);
    link.set_state(ConnectionState::Connected);
    wait_for_sends(&link, 2).await;
    link.push(answer("Rivers are rising."));

    let outcome = sending.await.expect("join").expect("send");
    assert_eq!(outcome.transport, Some(Transport::Push));
    assert_eq!(outcome.message.expect("answer").text, "Rivers are rising.");
    assert_eq!(sends_emitted(&link), 2);
    assert_eq!(backend.counts().deliveries(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_push_request_does_not_swallow_later_replies() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("transit", SendOptions::default()).await })
    };
    wait_for_sends(&link, 1).await;
    tokio::time::advance(Duration::from_secs(31)).await;
    wait_for_sends(&link, 2).await;
    link.push(answer("Trains run on time."));

    let outcome = sending.await.expect("join").expect("retry is answered");
    assert_eq!(outcome.message.expect("answer").text, "Trains run on time.");

    let next = {
        let client = client.clone();
        tokio::spawn(async move { client.send("weather", SendOptions::default()).await })
    };
    wait_for_sends(&link, 3).await;
    link.push(answer("Sunny."));
    let outcome = next.await.expect("join").expect("next send is answered");
    assert_eq!(outcome.message.expect("answer").text, "Sunny.");
    assert_eq!(sends_emitted(&link), 3);
}

#[tokio::test]
async fn bot_typing_is_reported_as_progress() {
    let backend = Arc::new(ScriptedBackend::new());
    let (client, link) = push_client(backend.clone()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let sending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send("elections", SendOptions::default().with_progress(tx))
                .await
        })
    };
    wait_for_sends(&link, 1).await;
    link.push(ServerEvent::BotTyping(true));
    let mut seen = Vec::new();
    while !seen.contains(&ChatEvent::Typing(true)) {
        match rx.try_recv() {
            Ok(event) => seen.push(event),
            Err(_) => tokio::task::yield_now().await,
        }
    }
    link.push(answer("Turnout was high."));
    sending.await.expect("join").expect("send");
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }

    let typing: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Typing(typing) => Some(*typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, [true, false]);
    assert!(matches!(seen.last(), Some(ChatEvent::Completed(_))));
}
