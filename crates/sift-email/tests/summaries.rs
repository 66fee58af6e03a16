mod common;

use common::Harness;
use sift_core::{FlagKind, Pagination, RootConfidence};
use sift_email::testing::{CountingSource, TestMessage};
use sift_email::{FlagSynchronizer, ThreadSummaryEngine};
use sift_storage::ThreadSummarySource;
use std::sync::Arc;

fn engine(h: &Harness) -> (Arc<CountingSource<sift_storage::Storage>>, ThreadSummaryEngine) {
    let counting = Arc::new(CountingSource::new(h.storage.clone()));
    let source: Arc<dyn ThreadSummarySource> = counting.clone();
    (counting, ThreadSummaryEngine::new(source, Arc::clone(&h.cipher)))
}

fn page(limit: usize) -> Pagination {
    Pagination { limit, offset: 0 }
}

async fn queries_for_threads(n: usize) -> usize {
    let h = Harness::new().await;
    for i in 0..n {
        h.server.deliver(
            "INBOX",
            &TestMessage::new(&format!("<t{i}@example.com>")).minutes_after_epoch(i as i64),
        );
    }
    h.sync("INBOX").await;

    let (counting, engine) = engine(&h);
    let listed = engine
        .list_threads(h.account, &page(n))
        .await
        .expect("list");
    assert_eq!(listed.total, n);
    assert_eq!(listed.items.len(), n);
    counting.queries()
}

#[tokio::test]
async fn round_trips_do_not_grow_with_the_page() {
    let one = queries_for_threads(1).await;
    let fifty = queries_for_threads(50).await;
    let five_hundred = queries_for_threads(500).await;
    assert_eq!(one, 4);
    assert_eq!(fifty, one);
    assert_eq!(five_hundred, one);
}

#[tokio::test]
async fn summary_takes_subject_from_root_and_sender_from_latest() {
    let h = Harness::new().await;
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<a@example.com>")
            .subject("Offsite agenda")
            .from("Alice <alice@example.com>"),
    );
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<b@example.com>")
            .reply_to("<a@example.com>")
            .subject("Re: Offsite agenda")
            .from("Bob <bob@example.com>")
            .minutes_after_epoch(30),
    );
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<solo@example.com>")
            .subject("Unrelated")
            .minutes_after_epoch(5),
    );
    h.sync("INBOX").await;

    let (_, engine) = engine(&h);
    let listed = engine
        .list_threads(h.account, &page(10))
        .await
        .expect("list");
    assert_eq!(listed.total, 2);

    let thread = &listed.items[0];
    let root = h.message("<a@example.com>").await;
    let reply = h.message("<b@example.com>").await;
    assert_eq!(thread.thread_id, root.thread_id);
    assert_eq!(thread.message_count, 2);
    assert_eq!(thread.subject, "Offsite agenda");
    assert_eq!(thread.latest_sender, "bob@example.com");
    assert_eq!(thread.root_message, root.id);
    assert_eq!(thread.latest_message, reply.id);
    assert_eq!(thread.root_confidence, RootConfidence::Confirmed);
    assert_eq!(thread.oldest_date, root.received_at);
    assert!(thread.has_unread);
    assert_eq!(listed.items[1].subject, "Unrelated");

    let flags = FlagSynchronizer::new(h.storage.clone(), h.session.clone());
    for record in [root, reply] {
        flags
            .apply_local_change(&record, FlagKind::Seen, true)
            .await
            .expect("mark read");
    }
    let refreshed = engine
        .summaries_for_threads(h.account, &[thread.thread_id.clone()])
        .await
        .expect("summaries");
    assert!(!refreshed[0].has_unread);
}

#[tokio::test]
async fn two_roots_fall_back_to_the_earliest_with_one_extra_query() {
    let h = Harness::new().await;
    let early = h.record("<x@example.com>", "t-split", 1);
    let late = h.record("<y@example.com>", "t-split", 9);
    let healthy = h.record("<z@example.com>", "t-ok", 5);
    for record in [&late, &early, &healthy] {
        h.storage.upsert_message(record).await.expect("insert");
    }

    let (counting, engine) = engine(&h);
    let summaries = engine
        .summaries_for_threads(h.account, &["t-split".to_string(), "t-ok".to_string()])
        .await
        .expect("summaries");
    assert_eq!(counting.queries(), 4);

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].thread_id, "t-split");
    assert_eq!(summaries[0].root_message, early.id);
    assert_eq!(summaries[0].root_confidence, RootConfidence::Degraded);
    assert_eq!(summaries[0].subject, "subject of <x@example.com>");
    assert_eq!(summaries[1].root_confidence, RootConfidence::Confirmed);
}

#[tokio::test]
async fn soft_deleted_messages_leave_the_listing() {
    let h = Harness::new().await;
    h.server.deliver("INBOX", &TestMessage::new("<a@example.com>"));
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<b@example.com>")
            .reply_to("<a@example.com>")
            .minutes_after_epoch(10),
    );
    h.sync("INBOX").await;

    let reply = h.message("<b@example.com>").await;
    sift_email::MoveReconciler::new(h.storage.clone(), h.session.clone(), None)
        .delete_message(&reply)
        .await
        .expect("delete");

    let (_, engine) = engine(&h);
    let listed = engine
        .list_threads(h.account, &page(10))
        .await
        .expect("list");
    assert_eq!(listed.total, 1);
    assert_eq!(listed.items[0].message_count, 1);
    assert_eq!(
        listed.items[0].latest_message,
        h.message("<a@example.com>").await.id
    );
}

#[tokio::test]
async fn search_matches_decrypted_subject_and_sender() {
    let h = Harness::new().await;
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<inv@example.com>").subject("Invoice #42"),
    );
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<news@example.com>")
            .subject("Weekly digest")
            .from("News <digest@news.example.org>")
            .minutes_after_epoch(3),
    );
    h.server.deliver(
        "INBOX",
        &TestMessage::new("<re@example.com>")
            .reply_to("<inv@example.com>")
            .subject("Re: Invoice #42")
            .minutes_after_epoch(8),
    );
    h.sync("INBOX").await;

    let (counting, engine) = engine(&h);
    let found = engine
        .search_threads(h.account, "INVOICE", &page(10))
        .await
        .expect("search");
    assert_eq!(found.total, 1);
    assert_eq!(found.items[0].message_count, 2);
    assert_eq!(found.items[0].subject, "Invoice #42");
    assert_eq!(counting.queries(), 4);

    let by_sender = engine
        .search_threads(h.account, "news.example", &page(10))
        .await
        .expect("search");
    assert_eq!(by_sender.total, 1);
    assert_eq!(by_sender.items[0].subject, "Weekly digest");

    let none = engine
        .search_threads(h.account, "nothing like this", &page(10))
        .await
        .expect("search");
    assert_eq!(none.total, 0);
    assert!(none.items.is_empty());
}
