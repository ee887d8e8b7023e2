use crate::fakes::ScriptedBackend;
use newsdesk_core::client::{ChatClient, ClientOptions, SendOptions};
use newsdesk_core::state::MessageRole;
use newsdesk_core::store::SessionStore;
use std::sync::Arc;
use tempfile::TempDir;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

#[test]
fn client_records_messages_and_persists_them() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let store = SessionStore::new(temp_dir.path().to_path_buf());
    let client = ChatClient::new(Arc::new(ScriptedBackend::new()), ClientOptions::default())
        .with_store(store.clone());

    runtime
        .block_on(client.create_session())
        .expect("create session");
    runtime
        .block_on(client.send("hello world", SendOptions::default()))
        .expect("send message");

    let messages = client.messages();
    assert!(messages.iter().any(|msg| msg.role == MessageRole::User));
    assert!(messages
        .iter()
        .any(|msg| msg.role == MessageRole::Assistant
            && msg.text == ScriptedBackend::answer_for("hello world")));

    let persisted = store.load_messages().expect("persisted messages");
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].text, "hello world");
    assert_eq!(persisted[1].citations.len(), 1);
}

#[test]
fn clearing_keeps_the_session_but_drops_messages() {
    let runtime = test_runtime();
    let backend = Arc::new(ScriptedBackend::new());
    let client = ChatClient::new(backend.clone(), ClientOptions::default());

    let session_id = runtime.block_on(client.create_session()).expect("session");
    runtime
        .block_on(client.send("first", SendOptions::default()))
        .expect("send");
    runtime.block_on(client.clear_session()).expect("clear");

    assert!(client.messages().is_empty());
    assert_eq!(client.session_id(), Some(session_id));
    assert_eq!(backend.counts().clear, 1);
}
