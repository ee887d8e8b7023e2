use crate::fakes::{stream_feed, ScriptedBackend};
use newsdesk_core::client::{ChatClient, ClientOptions, Completion, SendOptions};
use newsdesk_core::state::MessageRole;
use std::sync::Arc;

async fn wait_for_assistant_text(client: &ChatClient, text: &str) {
    loop {
        let messages = client.messages();
        let last = messages.last();
        if last.is_some_and(|m| m.role == MessageRole::Assistant && m.text == text) {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn new_send_cancels_and_finalizes_the_running_stream() {
    let backend = Arc::new(ScriptedBackend::new());
    let (first_feed, first) = stream_feed();
    let (second_feed, second) = stream_feed();
    backend.queue_stream(first);
    backend.queue_stream(second);
    let client = ChatClient::new(backend.clone(), ClientOptions::default());
    client.create_session().await.expect("session");

    let first_send = {
        let client = client.clone();
        tokio::spawn(async move { client.send("first", SendOptions::streaming()).await })
    };
    first_feed.delta("Hel");
    first_feed.delta("lo");
    wait_for_assistant_text(&client, "Hello").await;

    second_feed.delta("World");
    second_feed.end();
    let second_outcome = client
        .send("second", SendOptions::streaming())
        .await
        .expect("second send");
    let first_outcome = first_send.await.expect("join").expect("first send");

    assert_eq!(first_outcome.completion, Completion::Cancelled);
    let interrupted = first_outcome.message.expect("partial answer");
    assert_eq!(interrupted.text, "Hello");
    assert!(interrupted.is_final());
    assert_eq!(second_outcome.completion, Completion::Finished);

    let messages = client.messages();
    let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["first", "Hello", "second", "World"]);
    assert!(messages.iter().all(|m| m.is_final()));

    // Chunks for the abandoned stream change nothing.
    first_feed.delta(" again");
    tokio::task::yield_now().await;
    assert_eq!(client.messages()[1].text, "Hello");
}

#[tokio::test]
async fn stop_finalizes_partial_text_and_frees_the_client() {
    let backend = Arc::new(ScriptedBackend::new());
    let (feed, stream) = stream_feed();
    backend.queue_stream(stream);
    let client = ChatClient::new(backend.clone(), ClientOptions::default());
    client.create_session().await.expect("session");

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("long read", SendOptions::streaming()).await })
    };
    feed.delta("The first paragraph");
    wait_for_assistant_text(&client, "The first paragraph").await;
    assert!(client.is_busy());

    assert!(client.cancel());
    let outcome = sending.await.expect("join").expect("cancel is not an error");

    assert!(outcome.is_cancelled());
    assert!(!client.is_busy());
    assert!(!client.cancel());
    let messages = client.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_final());
    assert!(client.conversation().in_progress().is_none());
}

#[tokio::test]
async fn cancelling_a_plain_request_appends_no_answer() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.hang_sends();
    let client = ChatClient::new(backend.clone(), ClientOptions::default());
    client.create_session().await.expect("session");

    let sending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("quiet", SendOptions::default()).await })
    };
    while backend.counts().send == 0 {
        tokio::task::yield_now().await;
    }
    client.cancel();
    let outcome = sending.await.expect("join").expect("cancelled");

    assert_eq!(outcome.completion, Completion::Cancelled);
    assert!(outcome.message.is_none());
    assert_eq!(client.messages().len(), 1);
}
