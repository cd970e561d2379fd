mod common;

use common::*;
use service_core::error::AppError;
use std::time::Duration;
use support_service::models::{
    EscalationReason, EscalationStatus, KnowledgeMatch, MessageRole, NewKnowledgeEntry,
};
use support_service::services::relay::mock::RelayEvent;
use support_service::services::synthesizer::PROMPT_CONTRACT;

fn seed_entry(app: &TestApp, title: &str, subcategory: &str, embedding: Vec<f32>) {
    app.store.seed_knowledge(
        &app.partition(),
        NewKnowledgeEntry {
            title: title.to_string(),
            content: format!("{} details.", title),
            category: "benefits".to_string(),
            subcategory: Some(subcategory.to_string()),
            source: "handbook".to_string(),
            embedding,
        },
    );
}

#[tokio::test]
async fn dental_question_is_answered_from_policy_filtered_knowledge() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session = app.start_session().await;

    let answer = app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    assert!(!answer.escalated);
    assert_eq!(answer.answer, DEFAULT_ANSWER);
    assert_eq!(answer.conversation_id, session.conversation_id);
    let titles: Vec<_> = answer.sources.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Annual limits", "Dental coverage"]);
    assert!((answer.confidence - (0.5 + 0.3 * 0.785)).abs() < 1e-3);

    let prompt = &app.completer.requests()[0].messages[0].content;
    assert!(prompt.contains("Dental coverage"));
    assert!(!prompt.contains("Premium dental"));

    assert!(app.store.escalations(&app.partition()).is_empty());
}

#[tokio::test]
async fn both_messages_are_persisted_in_order() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session = app.start_session().await;

    app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    let messages = app.store.messages(&app.partition(), session.conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, DENTAL_QUESTION);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[1].confidence.is_some());

    let history = app
        .state
        .pipeline
        .history(&app.candidates(), &session.session_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn confidence_at_threshold_escalates() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;
    app.completer.push_answer("Your plan covers that.");

    let answer = app.ask(&session.session_id, UNKNOWN_QUESTION).await.unwrap();

    assert_eq!(answer.confidence, 0.5);
    assert!(answer.escalated);

    let escalations = app.store.escalations(&app.partition());
    assert_eq!(escalations.len(), 1);
    let escalation = &escalations[0];
    assert_eq!(escalation.status, EscalationStatus::Pending);
    assert_eq!(escalation.snapshot.reason, EscalationReason::LowConfidence);
    assert_eq!(escalation.snapshot.knowledge_match, KnowledgeMatch::NoKnowledge);
    assert_eq!(escalation.snapshot.subject.policy_bucket, "standard");
    assert_eq!(escalation.query, UNKNOWN_QUESTION);

    let messages = app.store.messages(&app.partition(), session.conversation_id);
    let assistant = messages.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
    assert_eq!(escalation.last_message_id, Some(assistant.id));
    assert!(assistant.was_escalated);

    let events = app.relay.wait_for_events(1).await;
    assert!(matches!(&events[0], RelayEvent::Escalation { escalation_id, .. } if *escalation_id == escalation.id));
}

#[tokio::test]
async fn refusal_escalates_and_notice_failure_is_swallowed() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    app.relay.set_failing(true);
    let session = app.start_session().await;
    app.completer.push_answer(PROMPT_CONTRACT.refusal);

    let answer = app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    assert!(answer.escalated);
    let escalations = app.store.escalations(&app.partition());
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].snapshot.reason, EscalationReason::RefusalPhrase);
    assert_eq!(escalations[0].snapshot.knowledge_match, KnowledgeMatch::GoodMatch);
}

#[tokio::test]
async fn privacy_refusal_is_never_escalated() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;
    app.completer.push_answer(PROMPT_CONTRACT.privacy_refusal);

    let answer = app
        .ask(&session.session_id, "What is John's coverage limit?")
        .await
        .unwrap();

    assert!(answer.confidence <= 0.5);
    assert!(!answer.escalated);
    assert!(app.store.escalations(&app.partition()).is_empty());
}

#[tokio::test]
async fn contact_details_attach_to_pending_escalation() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;
    app.completer.push_answer(PROMPT_CONTRACT.refusal);
    app.completer
        .push_answer("Thank you for your contact information. Our team will reach out soon.");

    let first = app.ask(&session.session_id, UNKNOWN_QUESTION).await.unwrap();
    assert!(first.escalated);

    let second = app.ask(&session.session_id, "+65 9123 4567").await.unwrap();
    assert!(!second.escalated);

    let escalations = app.store.escalations(&app.partition());
    assert_eq!(escalations.len(), 1);
    let contact = escalations[0].contact.as_ref().expect("contact attached");
    assert_eq!(contact.contact, "+65 9123 4567");
    assert_eq!(escalations[0].status, EscalationStatus::Pending);

    let events = app.relay.wait_for_events(2).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, RelayEvent::Contact { contact, .. } if contact == "+65 9123 4567")));
}

#[tokio::test]
async fn contact_without_pending_escalation_is_a_normal_turn() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session = app.start_session().await;

    let answer = app.ask(&session.session_id, "mei.tan@acme.com").await.unwrap();

    assert!(answer.confidence >= 0.5);
    assert!(app
        .store
        .escalations(&app.partition())
        .iter()
        .all(|e| e.contact.is_none()));
}

#[tokio::test]
async fn each_question_escalates_independently() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;
    app.completer.push_answer(PROMPT_CONTRACT.refusal);
    app.completer.push_answer(PROMPT_CONTRACT.refusal);

    app.ask(&session.session_id, UNKNOWN_QUESTION).await.unwrap();
    app.ask(&session.session_id, "Is acupuncture covered?").await.unwrap();

    assert_eq!(app.store.escalations(&app.partition()).len(), 2);
}

#[tokio::test]
async fn session_from_another_tenant_is_not_found() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;

    let mut other = acme_tenant();
    other.domain = "globex.com".to_string();
    other.alternate_domains.clear();
    other.partition = support_service::models::PartitionHandle::parse("company_globex").unwrap();
    app.store.seed_tenant(other);

    let err = app
        .state
        .pipeline
        .answer_query(
            &support_service::services::tenant::DomainCandidates::from_values(["globex.com"]),
            &session.session_id,
            DENTAL_QUESTION,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn provider_outage_fails_the_turn_without_persisting() {
    let app = TestApp::spawn().await;
    let session = app.start_session().await;
    app.completer.set_failing(true);

    let err = app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap_err();

    assert!(matches!(err, AppError::BadGateway(_)));
    assert!(app
        .store
        .messages(&app.partition(), session.conversation_id)
        .is_empty());
}

#[tokio::test]
async fn weak_knowledge_below_threshold_is_a_poor_match() {
    let app = TestApp::spawn().await;
    seed_entry(&app, "Travel insurance", "general", vector_with_similarity(0.5, 1));
    let session = app.start_session().await;
    app.completer.push_answer("I'm not sure.");

    let answer = app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    assert!(answer.escalated);
    assert!(answer.sources.is_empty());
    let prompt = &app.completer.requests()[0].messages[0].content;
    assert!(!prompt.contains("Travel insurance"));

    let escalation = &app.store.escalations(&app.partition())[0];
    assert_eq!(escalation.snapshot.knowledge_match, KnowledgeMatch::PoorMatch);
    assert!(escalation.snapshot.sources.is_empty());
}

#[tokio::test]
async fn filtered_out_candidates_do_not_starve_top_k() {
    let app = TestApp::spawn().await;
    for i in 0..5 {
        let similarity = 0.95 - 0.01 * i as f32;
        let embedding = vector_with_similarity(similarity, 1);
        seed_entry(&app, &format!("Premium benefit {}", i), "premium", embedding);
    }
    for i in 0..5 {
        let similarity = 0.85 - 0.01 * i as f32;
        let embedding = vector_with_similarity(similarity, 2);
        seed_entry(&app, &format!("General benefit {}", i), "general", embedding);
    }
    let session = app.start_session().await;

    let answer = app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    assert_eq!(answer.sources.len(), 5);
    assert!(answer
        .sources
        .iter()
        .all(|s| s.title.starts_with("General benefit")));
    assert_eq!(answer.sources[0].title, "General benefit 0");
}

#[tokio::test]
async fn returned_contexts_record_usage() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session = app.start_session().await;

    app.ask(&session.session_id, DENTAL_QUESTION).await.unwrap();

    let usage = |title: &str| {
        app.store
            .knowledge_entries(&app.partition())
            .into_iter()
            .find(|e| e.title == title)
            .map(|e| (e.usage_count, e.last_used_at.is_some()))
            .unwrap()
    };
    for _ in 0..50 {
        if usage("Dental coverage").0 == 1 && usage("Annual limits").0 == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(usage("Annual limits"), (1, true));
    assert_eq!(usage("Dental coverage"), (1, true));
    assert_eq!(usage("Premium dental"), (0, false));
}
