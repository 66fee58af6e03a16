mod common;

use common::{subject_contains, Harness};
use sift_core::{Condition, MessagePriority, RemapState, RuleAction};
use sift_email::testing::TestMessage;
use tokio_util::sync::CancellationToken;

fn message(id: &str, minute: i64, subject: &str) -> TestMessage {
    TestMessage::new(id)
        .subject(subject)
        .minutes_after_epoch(minute)
}

#[tokio::test]
async fn lower_priority_number_runs_first_and_can_stop_the_rest() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<r1@example.com>", 0, "Weekly report")])
        .await;

    // Saved first so storage order cannot decide.
    let late = harness
        .save_rule("flag reports", 100, subject_contains("report"), vec![RuleAction::MarkFlagged])
        .await;
    let early = harness
        .save_rule(
            "read reports",
            50,
            subject_contains("report"),
            vec![RuleAction::MarkRead, RuleAction::StopProcessing],
        )
        .await;

    let report = harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.matched, 1);

    let stored = harness.message("<r1@example.com>").await;
    assert!(stored.flags.seen);
    assert!(!stored.flags.flagged);
    assert!(stored.processed);
    assert_eq!(harness.times_triggered(&early).await, 1);
    assert_eq!(harness.times_triggered(&late).await, 0);
}

#[tokio::test]
async fn later_rules_see_the_effect_of_earlier_moves() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<m1@example.com>", 0, "Receipt 1")])
        .await;

    let inbox_only = harness
        .save_rule(
            "flag inbox",
            100,
            vec![Condition::FolderEquals("INBOX".to_string())],
            vec![RuleAction::MarkFlagged],
        )
        .await;
    let archive = harness
        .save_rule(
            "archive receipts",
            50,
            subject_contains("receipt"),
            vec![RuleAction::MoveToFolder {
                folder: "Archive".to_string(),
            }],
        )
        .await;

    harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");

    let stored = harness.message("<m1@example.com>").await;
    assert_eq!(stored.folder, "Archive");
    assert!(!stored.flags.flagged);
    assert_eq!(harness.times_triggered(&archive).await, 1);
    assert_eq!(harness.times_triggered(&inbox_only).await, 0);
}

#[tokio::test]
async fn move_then_mark_read_follows_the_message() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<n1@example.com>", 0, "Newsletter")])
        .await;
    harness
        .save_rule(
            "file newsletters",
            10,
            subject_contains("newsletter"),
            vec![
                RuleAction::MoveToFolder {
                    folder: "Archive".to_string(),
                },
                RuleAction::MarkRead,
            ],
        )
        .await;

    let report = harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.actions_applied, 2);
    assert_eq!(report.action_failures, 0);

    let stored = harness.message("<n1@example.com>").await;
    assert_eq!(stored.folder, "Archive");
    assert_eq!(stored.remap_state, RemapState::Confirmed);
    let uid = stored.uid.expect("destination identifier");
    assert!(harness
        .server
        .server_flags("Archive", uid)
        .expect("message on server")
        .seen);
    assert!(stored.remote_flags.seen);
    assert!(harness.server.uids("INBOX").is_empty());
}

#[tokio::test]
async fn missing_tags_are_never_created() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<t1@example.com>", 0, "Your receipt")])
        .await;
    harness
        .storage
        .insert_tag(harness.account, "Receipts")
        .await
        .expect("insert tag");
    let rule = harness
        .save_rule(
            "tag receipts",
            10,
            subject_contains("receipt"),
            vec![
                RuleAction::ApplyTag {
                    tag: "Nonexistent".to_string(),
                },
                RuleAction::ApplyTag {
                    tag: "receipts".to_string(),
                },
            ],
        )
        .await;

    let report = harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.actions_applied, 1);
    assert_eq!(report.action_failures, 0);

    assert_eq!(
        harness
            .storage
            .count_tags(harness.account)
            .await
            .expect("count tags"),
        1
    );
    let stored = harness.message("<t1@example.com>").await;
    assert_eq!(
        harness
            .storage
            .message_tag_names(stored.id)
            .await
            .expect("tag names"),
        vec!["Receipts".to_string()]
    );
    assert_eq!(harness.times_triggered(&rule).await, 1);
}

#[tokio::test]
async fn failed_action_does_not_stop_the_rest() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<f1@example.com>", 0, "Alert: disk")])
        .await;
    let rule = harness
        .save_rule(
            "alerts",
            10,
            subject_contains("alert"),
            vec![
                RuleAction::MoveToFolder {
                    folder: "Archive".to_string(),
                },
                RuleAction::MarkRead,
            ],
        )
        .await;
    harness.server.fail_next("MOVE");

    let report = harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.action_failures, 1);
    assert_eq!(report.actions_applied, 1);
    assert_eq!(report.failed_messages, 0);

    let stored = harness.message("<f1@example.com>").await;
    assert_eq!(stored.folder, "INBOX");
    assert!(stored.flags.seen);
    assert!(stored.processed);
    assert_eq!(harness.times_triggered(&rule).await, 1);
}

#[tokio::test]
async fn every_message_is_marked_processed_match_or_not() {
    let harness = Harness::new().await;
    harness
        .deliver(&[
            message("<a@example.com>", 0, "Lunch?"),
            message("<b@example.com>", 1, "Re: Lunch?"),
            message("<c@example.com>", 2, "Quarterly numbers"),
        ])
        .await;
    harness
        .save_rule("never", 10, subject_contains("no such words"), vec![RuleAction::MarkRead])
        .await;
    assert_eq!(harness.unprocessed().await, 3);

    let engine = harness.engine();
    let report = engine
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.matched, 0);
    assert_eq!(harness.unprocessed().await, 0);

    let again = engine
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("second pass");
    assert_eq!(again.evaluated, 0);
}

#[tokio::test]
async fn body_rules_fetch_and_keep_the_body_sealed() {
    let harness = Harness::new().await;
    harness
        .deliver(&[
            message("<news@example.com>", 0, "Digest").body("Click here to unsubscribe."),
            message("<note@example.com>", 1, "Note").body("See you tomorrow."),
        ])
        .await;
    harness
        .storage
        .insert_tag(harness.account, "Newsletters")
        .await
        .expect("insert tag");
    harness
        .save_rule(
            "newsletters",
            10,
            vec![Condition::BodyContains("UNSUBSCRIBE".to_string())],
            vec![RuleAction::ApplyTag {
                tag: "Newsletters".to_string(),
            }],
        )
        .await;
    harness.server.clear_commands();

    let report = harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");
    assert_eq!(report.matched, 1);
    assert_eq!(
        harness
            .server
            .commands()
            .iter()
            .filter(|command| command.starts_with("FETCH") && command.ends_with("Body"))
            .count(),
        2
    );

    let news = harness.message("<news@example.com>").await;
    let sealed = news.body_sealed.expect("body stored");
    assert!(!String::from_utf8_lossy(&sealed).contains("unsubscribe"));
    assert!(harness
        .cipher
        .open_string(&sealed)
        .expect("open")
        .contains("unsubscribe"));
    assert_eq!(
        harness
            .storage
            .message_tag_names(news.id)
            .await
            .expect("tag names"),
        vec!["Newsletters".to_string()]
    );

    let note = harness.message("<note@example.com>").await;
    assert!(note.body_sealed.is_some());
    assert!(harness
        .storage
        .message_tag_names(note.id)
        .await
        .expect("tag names")
        .is_empty());
}

#[tokio::test]
async fn soft_delete_goes_to_trash_and_ends_evaluation() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<spam@example.com>", 0, "You won a prize")])
        .await;
    let delete = harness
        .save_rule(
            "prizes",
            10,
            subject_contains("prize"),
            vec![RuleAction::SoftDelete, RuleAction::MarkFlagged],
        )
        .await;
    let later = harness
        .save_rule("read all", 20, subject_contains("you"), vec![RuleAction::MarkRead])
        .await;

    harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");

    let stored = harness.message("<spam@example.com>").await;
    assert_eq!(stored.folder, "Trash");
    assert!(stored.soft_deleted_at.is_some());
    assert!(!stored.flags.flagged);
    assert!(!stored.flags.seen);
    assert_eq!(harness.times_triggered(&delete).await, 1);
    assert_eq!(harness.times_triggered(&later).await, 0);
    assert!(harness.server.uids("INBOX").is_empty());
    assert_eq!(harness.server.uids("Trash").len(), 1);
}

#[tokio::test]
async fn priority_lands_with_the_processed_flag() {
    let harness = Harness::new().await;
    harness
        .deliver(&[message("<boss@example.com>", 0, "Urgent: budget")])
        .await;
    harness
        .save_rule(
            "urgent",
            10,
            subject_contains("urgent"),
            vec![RuleAction::SetPriority {
                priority: MessagePriority::Urgent,
            }],
        )
        .await;

    harness
        .engine()
        .process_pending(harness.account, 50, &CancellationToken::new())
        .await
        .expect("automation");

    let stored = harness.message("<boss@example.com>").await;
    assert!(stored.processed);
    assert_eq!(stored.priority, Some(MessagePriority::Urgent));
}

#[tokio::test]
async fn cancelled_pass_leaves_messages_pending() {
    let harness = Harness::new().await;
    harness
        .deliver(&[
            message("<x1@example.com>", 0, "one"),
            message("<x2@example.com>", 1, "two"),
        ])
        .await;
    harness
        .save_rule("all", 10, subject_contains("o"), vec![RuleAction::MarkRead])
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = harness
        .engine()
        .process_pending(harness.account, 50, &cancel)
        .await
        .expect("automation");
    assert!(report.cancelled);
    assert_eq!(report.evaluated, 0);
    assert_eq!(harness.unprocessed().await, 2);
}

#[tokio::test]
async fn dry_run_reports_without_touching_anything() {
    let harness = Harness::new().await;
    let messages: Vec<TestMessage> = (0..10)
        .map(|n| {
            let subject = if n % 2 == 0 {
                format!("Invoice {n}")
            } else {
                format!("Chat {n}")
            };
            message(&format!("<d{n}@example.com>"), n, &subject)
        })
        .collect();
    harness.deliver(&messages).await;
    let rule = harness
        .save_rule(
            "archive invoices",
            10,
            subject_contains("invoice"),
            vec![RuleAction::MoveToFolder {
                folder: "Archive".to_string(),
            }],
        )
        .await;
    harness.server.clear_commands();

    let report = harness
        .engine()
        .dry_run(harness.account, std::slice::from_ref(&rule), 50)
        .await
        .expect("dry run");
    assert_eq!(report.evaluated, 10);
    assert_eq!(report.matches.len(), 5);
    assert!(report
        .matches
        .iter()
        .all(|hit| hit.rule_id == rule.id && hit.actions == rule.actions));

    assert!(harness.server.commands().is_empty());
    assert_eq!(harness.server.uids("INBOX").len(), 10);
    assert_eq!(harness.times_triggered(&rule).await, 0);
    assert_eq!(harness.unprocessed().await, 10);
}
