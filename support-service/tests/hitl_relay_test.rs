mod common;

use common::*;
use support_service::models::{Escalation, EscalationStatus, LEARNED_CATEGORY};
use support_service::services::relay::mock::RelayEvent;
use support_service::services::relay::protocol::{CorrelationTag, SKIPPED_RESOLUTION};
use support_service::services::synthesizer::PROMPT_CONTRACT;

/// Escalate one question and return the stored escalation with its notice.
async fn escalate(app: &TestApp, ai_answer: &str) -> (Escalation, String) {
    let session = app.start_session().await;
    app.completer.push_answer(ai_answer);
    let answer = app.ask(&session.session_id, UNKNOWN_QUESTION).await.unwrap();
    assert!(answer.escalated);

    app.relay.wait_for_events(1).await;
    let notice = app.relay.last_escalation_notice().expect("notice sent");
    let escalation = app.store.escalations(&app.partition()).remove(0);
    (escalation, notice)
}

fn stored(app: &TestApp, id: uuid::Uuid) -> Escalation {
    app.store
        .escalations(&app.partition())
        .into_iter()
        .find(|e| e.id == id)
        .expect("escalation stored")
}

#[tokio::test]
async fn notice_carries_a_parseable_tag() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;

    let tag = CorrelationTag::parse(&notice).expect("tag present");
    assert_eq!(tag.escalation_id, escalation.id);
    assert_eq!(tag.partition, app.partition());
    assert!(notice.contains(UNKNOWN_QUESTION));
}

#[tokio::test]
async fn skip_closes_without_learning() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;

    let feedback = app.relay.operator_replies(&notice, "ops_anna", "skip").await.unwrap();
    assert!(feedback.contains("skipped"));

    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Skipped);
    assert_eq!(closed.resolution.as_deref(), Some(SKIPPED_RESOLUTION));
    assert_eq!(closed.resolved_by.as_deref(), Some("ops_anna"));
    assert!(closed.resolved_at.is_some());
    assert!(!closed.was_added_to_kb);
    assert!(app.store.knowledge_entries(&app.partition()).is_empty());
}

#[tokio::test]
async fn custom_answer_resolves_and_teaches_the_knowledge_base() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;
    let reply = "Skydiving lessons are not claimable under any plan.";

    let feedback = app.relay.operator_replies(&notice, "ops_anna", reply).await.unwrap();
    assert!(feedback.starts_with("✅"));

    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Resolved);
    assert_eq!(closed.resolution.as_deref(), Some(reply));
    assert!(closed.was_added_to_kb);

    let entries = app.store.knowledge_entries(&app.partition());
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.category, LEARNED_CATEGORY);
    assert_eq!(entry.subcategory.as_deref(), Some("standard"));
    assert_eq!(entry.title, UNKNOWN_QUESTION);
    assert_eq!(
        entry.content,
        format!("Question: {}\n\nAnswer: {}", UNKNOWN_QUESTION, reply)
    );
    assert_eq!(entry.embedding.len(), DIMENSIONS);

    let message_id = escalation.last_message_id.expect("assistant message linked");
    assert!(app
        .store
        .is_escalation_resolved_on_message(&app.partition(), message_id));
}

#[tokio::test]
async fn confirm_reuses_the_ai_answer() {
    let app = TestApp::spawn().await;
    let ai_answer = "Skydiving is an excluded activity.";
    let (escalation, notice) = escalate(&app, ai_answer).await;

    app.relay.operator_replies(&notice, "ops_anna", "correct").await.unwrap();

    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Resolved);
    assert_eq!(closed.resolution.as_deref(), Some(ai_answer));
    let entries = app.store.knowledge_entries(&app.partition());
    assert!(entries[0].content.ends_with(ai_answer));
}

#[tokio::test]
async fn reply_to_closed_escalation_is_rejected_without_changes() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;

    app.relay.operator_replies(&notice, "ops_anna", "skip").await.unwrap();
    let feedback = app
        .relay
        .operator_replies(&notice, "ops_ben", "Actually it is covered.")
        .await
        .unwrap();

    assert!(feedback.starts_with("❌"));
    assert!(feedback.contains("already skipped"));
    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Skipped);
    assert_eq!(closed.resolved_by.as_deref(), Some("ops_anna"));
    assert!(app.store.knowledge_entries(&app.partition()).is_empty());
}

#[tokio::test]
async fn knowledge_failure_still_resolves() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;
    app.store.fail_knowledge_inserts(true);

    let feedback = app
        .relay
        .operator_replies(&notice, "ops_anna", "Not covered.")
        .await
        .unwrap();

    assert!(feedback.starts_with("⚠️"));
    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Resolved);
    assert!(!closed.was_added_to_kb);
    assert!(app.store.knowledge_entries(&app.partition()).is_empty());
}

#[tokio::test]
async fn reply_without_tag_is_ignored() {
    let app = TestApp::spawn().await;
    escalate(&app, PROMPT_CONTRACT.refusal).await;

    let feedback = app
        .relay
        .operator_replies("Good morning team", "ops_anna", "skip")
        .await;

    assert!(feedback.is_none());
    assert!(!app
        .relay
        .events()
        .iter()
        .any(|e| matches!(e, RelayEvent::Reply { .. })));
    assert_eq!(
        app.store.escalations(&app.partition())[0].status,
        EscalationStatus::Pending
    );
}

#[tokio::test]
async fn unknown_partition_is_rejected() {
    let app = TestApp::spawn().await;
    let (escalation, _) = escalate(&app, PROMPT_CONTRACT.refusal).await;
    let forged = format!("[Escalation: {}|Schema: company_ghost]", escalation.id);

    let feedback = app
        .relay
        .operator_replies(&forged, "ops_anna", "skip")
        .await
        .unwrap();

    assert!(feedback.starts_with("❌"));
    assert_eq!(stored(&app, escalation.id).status, EscalationStatus::Pending);
}

#[tokio::test]
async fn flag_failure_after_insert_reports_the_learned_entry() {
    let app = TestApp::spawn().await;
    let (escalation, notice) = escalate(&app, PROMPT_CONTRACT.refusal).await;
    app.store.fail_kb_flags(true);

    let feedback = app
        .relay
        .operator_replies(&notice, "ops_anna", "Not covered.")
        .await
        .unwrap();

    let entries = app.store.knowledge_entries(&app.partition());
    assert_eq!(entries.len(), 1);
    assert!(feedback.starts_with("⚠️"));
    assert!(feedback.contains("added to the knowledge base"));
    assert!(feedback.contains(&entries[0].id.to_string()));
    assert!(!feedback.contains("update failed"));

    let closed = stored(&app, escalation.id);
    assert_eq!(closed.status, EscalationStatus::Resolved);
    assert!(!closed.was_added_to_kb);
}
