use crate::fakes::stream_feed;
use futures::StreamExt;
use newsdesk_core::cancel::CancelToken;
use newsdesk_core::error::ChatError;
use newsdesk_core::state::{Citation, Message};
use newsdesk_core::stream::{Finish, StreamReassembler};

async fn final_text(deltas: &[&str]) -> String {
    let (feed, source) = stream_feed();
    for delta in deltas {
        feed.delta(delta);
    }
    feed.end();
    let updates: Vec<_> = StreamReassembler::new(source, Message::placeholder(), CancelToken::new())
        .into_updates()
        .collect()
        .await;
    let last = updates.last().expect("final update").as_ref().expect("ok");
    assert!(last.is_final);
    last.message.text.clone()
}

#[tokio::test]
async fn chunk_boundaries_do_not_change_the_answer() {
    assert_eq!(final_text(&["Rates ", "held ", "steady."]).await, "Rates held steady.");
    assert_eq!(
        final_text(&["Ra", "tes held", " ", "steady."]).await,
        "Rates held steady."
    );
}

#[tokio::test]
async fn later_citation_batch_wins() {
    let (feed, source) = stream_feed();
    let a = Citation::new("A", "first", None);
    let b = Citation::new("B", "second", None);
    let c = Citation::new("C", "third", Some("https://example.com/c".into()));
    feed.citations(&[a, b]);
    feed.citations(&[c.clone()]);
    feed.end();

    let mut reassembler =
        StreamReassembler::new(source, Message::placeholder(), CancelToken::new());
    while let Some(update) = reassembler.next().await {
        update.expect("update");
    }
    assert_eq!(reassembler.message().citations, vec![c]);
}

#[tokio::test]
async fn cancel_keeps_partial_text_without_error() {
    let (feed, source) = stream_feed();
    feed.delta("Hel");
    feed.delta("lo");
    let token = CancelToken::new();
    let mut reassembler = StreamReassembler::new(source, Message::placeholder(), token.clone());

    reassembler.next().await.expect("first").expect("ok");
    reassembler.next().await.expect("second").expect("ok");
    token.cancel();
    let last = reassembler.next().await.expect("final").expect("not an error");

    assert!(last.is_final);
    assert_eq!(last.message.text, "Hello");
    assert_eq!(reassembler.finish(), Some(Finish::Cancelled));
    assert!(reassembler.next().await.is_none());
}

#[tokio::test]
async fn error_chunk_keeps_partial_text_and_fails() {
    let (feed, source) = stream_feed();
    feed.delta("Hel");
    feed.delta("lo");
    feed.raw(r#"{"kind":"error","message":"boom"}"#);
    feed.delta(" ignored");
    let mut reassembler =
        StreamReassembler::new(source, Message::placeholder(), CancelToken::new());

    reassembler.next().await.expect("first").expect("ok");
    reassembler.next().await.expect("second").expect("ok");
    let failure = reassembler.next().await.expect("error");

    assert_eq!(
        failure,
        Err(ChatError::StreamError {
            message: "boom".into()
        })
    );
    assert_eq!(reassembler.message().text, "Hello");
    assert!(reassembler.next().await.is_none());
}
