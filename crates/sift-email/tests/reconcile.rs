mod common;

use common::Harness;
use sift_core::{FlagKind, MessageFlags, RemapState};
use sift_email::testing::TestMessage;
use sift_email::{EmailError, FlagSynchronizer, MoveReconciler};

fn reconciler(h: &Harness, trash: Option<&str>) -> MoveReconciler {
    MoveReconciler::new(
        h.storage.clone(),
        h.session.clone(),
        trash.map(str::to_string),
    )
}

#[tokio::test]
async fn confirmed_move_remaps_by_copyuid() {
    let h = Harness::new().await;
    h.server.create_folder("Archive");
    for n in 1..=2 {
        h.server
            .deliver("Archive", &TestMessage::new(&format!("<old{n}@example.com>")));
    }
    for n in 1..=10 {
        h.server
            .deliver("INBOX", &TestMessage::new(&format!("<m{n}@example.com>")));
    }
    h.sync("INBOX").await;

    let tenth = h.message("<m10@example.com>").await;
    assert_eq!(tenth.uid, Some(10));
    let moved = reconciler(&h, None)
        .move_message(&tenth, "Archive")
        .await
        .expect("move");

    let archive_v = h.server.uidvalidity("Archive").expect("archive");
    assert_eq!(moved.folder, "Archive");
    assert_eq!((moved.uidvalidity, moved.uid), (archive_v, Some(3)));
    assert_eq!(moved.remap_state, RemapState::Confirmed);

    let inbox_v = h.server.uidvalidity("INBOX").expect("inbox");
    let left_behind = h
        .storage
        .find_by_uids(h.account, "INBOX", inbox_v, &[10])
        .await
        .expect("lookup");
    assert!(left_behind.is_empty());

    let stored = h.message("<m10@example.com>").await;
    assert_eq!((stored.folder.as_str(), stored.uid), ("Archive", Some(3)));
}

#[tokio::test]
async fn move_without_copyuid_is_searched_then_swept() {
    let h = Harness::new().await;
    h.server.create_folder("Archive");
    h.server.set_uidplus(false);
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.sync("INBOX").await;

    let record = h.message("<m1@example.com>").await;
    let reconciler = reconciler(&h, None);
    let moved = reconciler
        .move_message(&record, "Archive")
        .await
        .expect("move");
    assert_eq!(moved.folder, "Archive");
    assert_eq!(moved.uid, Some(1));
    assert_eq!(moved.remap_state, RemapState::Unconfirmed);

    let report = reconciler.sweep_unconfirmed(h.account).await.expect("sweep");
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.still_unconfirmed, 0);
    let swept = h.message("<m1@example.com>").await;
    assert_eq!(swept.remap_state, RemapState::Confirmed);
    assert_eq!(swept.uid, Some(1));
}

#[tokio::test]
async fn sweep_leaves_ambiguous_and_missing_messages_unconfirmed() {
    let h = Harness::new().await;
    h.server.create_folder("Archive");
    h.server.deliver("Archive", &TestMessage::new("<dup@example.com>"));
    h.server.deliver("Archive", &TestMessage::new("<dup@example.com>"));

    let mut duplicated = h.record("<dup@example.com>", "t-1", 1);
    duplicated.folder = "Archive".to_string();
    duplicated.remap_state = RemapState::Unconfirmed;
    let mut missing = h.record("<gone@example.com>", "t-2", 2);
    missing.folder = "Archive".to_string();
    missing.remap_state = RemapState::Unconfirmed;
    for record in [&duplicated, &missing] {
        h.storage.upsert_message(record).await.expect("insert");
    }
    // Upserts confirm; put the state back the way an unconfirmed move leaves it.
    h.storage
        .remap_messages(&[
            sift_storage::MessageRemap {
                id: duplicated.id,
                folder: "Archive".to_string(),
                uidvalidity: 1,
                uid: None,
                state: RemapState::Unconfirmed,
            },
            sift_storage::MessageRemap {
                id: missing.id,
                folder: "Archive".to_string(),
                uidvalidity: 1,
                uid: None,
                state: RemapState::Unconfirmed,
            },
        ])
        .await
        .expect("remap");

    let report = reconciler(&h, None)
        .sweep_unconfirmed(h.account)
        .await
        .expect("sweep");
    assert_eq!(report.confirmed, 0);
    assert_eq!(report.still_unconfirmed, 2);
    assert_eq!(
        h.storage
            .list_unconfirmed(h.account)
            .await
            .expect("list")
            .len(),
        2
    );
}

#[tokio::test]
async fn delete_goes_to_trash_when_configured() {
    let h = Harness::new().await;
    h.server.create_folder("Trash");
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.sync("INBOX").await;

    let record = h.message("<m1@example.com>").await;
    let deleted = reconciler(&h, Some("Trash"))
        .delete_message(&record)
        .await
        .expect("delete");
    assert_eq!(deleted.folder, "Trash");
    assert!(deleted.soft_deleted_at.is_some());
    assert!(h.server.uids("INBOX").is_empty());
    assert_eq!(h.server.uids("Trash"), vec![1]);

    let stored = h.message("<m1@example.com>").await;
    assert!(stored.soft_deleted_at.is_some());
}

#[tokio::test]
async fn delete_without_trash_only_marks_deleted() {
    let h = Harness::new().await;
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.sync("INBOX").await;

    let record = h.message("<m1@example.com>").await;
    reconciler(&h, None)
        .delete_message(&record)
        .await
        .expect("delete");

    assert_eq!(h.server.uids("INBOX"), vec![1]);
    let server = h.server.server_flags("INBOX", 1).expect("still on server");
    assert!(server.deleted);
    let stored = h.message("<m1@example.com>").await;
    assert!(stored.soft_deleted_at.is_some());
    assert!(stored.flags.deleted && stored.remote_flags.deleted);
}

#[tokio::test]
async fn local_changes_push_and_remote_changes_pull() {
    let h = Harness::new().await;
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.server.deliver("INBOX", &TestMessage::new("<m2@example.com>"));
    h.sync("INBOX").await;
    let v = h.server.uidvalidity("INBOX").expect("uidvalidity");
    let flags = FlagSynchronizer::new(h.storage.clone(), h.session.clone());

    let first = h.message("<m1@example.com>").await;
    let read = flags
        .apply_local_change(&first, FlagKind::Seen, true)
        .await
        .expect("mark read");
    assert!(read.flags.seen && read.remote_flags.seen);
    assert!(h.server.server_flags("INBOX", 1).expect("present").seen);

    h.server.set_server_flags(
        "INBOX",
        2,
        MessageFlags {
            flagged: true,
            ..MessageFlags::default()
        },
    );
    let report = flags
        .reconcile_folder(h.account, "INBOX", v, 50)
        .await
        .expect("reconcile");
    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 0);
    let second = h.message("<m2@example.com>").await;
    assert!(second.flags.flagged && second.remote_flags.flagged);

    h.server.clear_commands();
    let quiet = flags
        .reconcile_folder(h.account, "INBOX", v, 50)
        .await
        .expect("reconcile");
    assert_eq!(quiet, Default::default());
    assert!(!h.server.commands().iter().any(|c| c.starts_with("STORE")));
}

#[tokio::test]
async fn failed_push_stays_dirty_until_the_next_reconcile() {
    let h = Harness::new().await;
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.sync("INBOX").await;
    let v = h.server.uidvalidity("INBOX").expect("uidvalidity");
    let flags = FlagSynchronizer::new(h.storage.clone(), h.session.clone());

    h.server.fail_next("STORE +");
    let record = h.message("<m1@example.com>").await;
    flags
        .apply_local_change(&record, FlagKind::Flagged, true)
        .await
        .expect("local change survives push failure");
    let dirty = h.message("<m1@example.com>").await;
    assert!(dirty.flags.flagged);
    assert!(!dirty.remote_flags.flagged);
    assert!(!h.server.server_flags("INBOX", 1).expect("present").flagged);

    // Someone marks it read elsewhere meanwhile; both sides survive.
    h.server.set_server_flags(
        "INBOX",
        1,
        MessageFlags {
            seen: true,
            ..MessageFlags::default()
        },
    );
    let report = flags
        .reconcile_folder(h.account, "INBOX", v, 50)
        .await
        .expect("reconcile");
    assert_eq!(report.pushed, 1);
    let server = h.server.server_flags("INBOX", 1).expect("present");
    assert!(server.flagged && server.seen);
    let clean = h.message("<m1@example.com>").await;
    assert_eq!(clean.flags, clean.remote_flags);
    assert!(clean.flags.seen && clean.flags.flagged);
}

#[tokio::test]
async fn moved_message_without_id_survives_syncing_the_destination() {
    let h = Harness::new().await;
    h.server.create_folder("Archive");
    h.server
        .deliver("INBOX", &TestMessage::without_id().subject("No id here"));
    h.sync("INBOX").await;
    let record = h
        .storage
        .list_unprocessed(h.account, 10)
        .await
        .expect("list")
        .pop()
        .expect("one record");
    assert!(record.message_id_synthetic);

    let moved = reconciler(&h, None)
        .move_message(&record, "Archive")
        .await
        .expect("move");
    assert_eq!(moved.remap_state, RemapState::Confirmed);
    assert_eq!(moved.uid, Some(1));

    let report = h.sync("Archive").await;
    assert_eq!(report.stored, 1);

    let archive_v = h.server.uidvalidity("Archive").expect("archive");
    let stored = h
        .storage
        .find_by_uids(h.account, "Archive", archive_v, &[1])
        .await
        .expect("lookup");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, record.id);
    assert_eq!(stored[0].message_id, record.message_id);
    assert_eq!(stored[0].thread_id, record.thread_id);

    // A second pass over the same folder stays quiet.
    h.sync("Archive").await;
    let all = h
        .storage
        .list_recent(h.account, 10)
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn failed_flag_fetch_skips_only_its_chunk() {
    let h = Harness::new().await;
    for n in 1..=4 {
        h.server
            .deliver("INBOX", &TestMessage::new(&format!("<m{n}@example.com>")));
    }
    h.sync("INBOX").await;
    let v = h.server.uidvalidity("INBOX").expect("uidvalidity");
    for uid in 1..=4 {
        h.server.set_server_flags(
            "INBOX",
            uid,
            MessageFlags {
                seen: true,
                ..MessageFlags::default()
            },
        );
    }
    let flags = FlagSynchronizer::new(h.storage.clone(), h.session.clone());

    h.server.fail_next("FETCH [1, 2] Flags");
    let report = flags
        .reconcile_folder(h.account, "INBOX", v, 2)
        .await
        .expect("reconcile");
    assert_eq!(report.pulled, 2);
    assert_eq!(report.failed, 2);
    for n in 1..=2 {
        assert!(!h.message(&format!("<m{n}@example.com>")).await.flags.seen);
    }
    for n in 3..=4 {
        assert!(h.message(&format!("<m{n}@example.com>")).await.flags.seen);
    }

    let retry = flags
        .reconcile_folder(h.account, "INBOX", v, 2)
        .await
        .expect("reconcile");
    assert_eq!(retry.pulled, 2);
    assert_eq!(retry.failed, 0);
    assert!(h.message("<m1@example.com>").await.flags.seen);
}

#[tokio::test]
async fn move_to_missing_folder_fails_before_touching_the_server() {
    let h = Harness::new().await;
    h.server.deliver("INBOX", &TestMessage::new("<m1@example.com>"));
    h.sync("INBOX").await;
    let record = h.message("<m1@example.com>").await;
    h.server.clear_commands();

    let err = reconciler(&h, None)
        .move_message(&record, "Projects")
        .await
        .expect_err("no such folder");
    assert!(matches!(&err, EmailError::Data(message) if message.contains("Projects")));
    assert!(!err.is_protocol());
    assert_eq!(h.server.commands(), vec!["LIST".to_string()]);
    assert_eq!(h.server.uids("INBOX"), vec![1]);

    let stored = h.message("<m1@example.com>").await;
    assert_eq!((stored.folder.as_str(), stored.uid), ("INBOX", Some(1)));
}
