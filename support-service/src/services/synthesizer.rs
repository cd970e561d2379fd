//! Grounded answer synthesis and deterministic confidence scoring.

use crate::models::{
    AiConfig, Context, KnowledgeMatch, Message, MessageRole, Source, SubjectProfile,
};
use crate::services::providers::{
    ChatTurn, CompletionProvider, CompletionRequest, FinishReason,
};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;

/// Sentences shared by the prompt template and the answer detectors.
///
/// Changing any sentence here changes both sides at once; bump `version` when
/// doing so, since cached answers and stored escalations carry the old text.
#[derive(Debug, Clone, Copy)]
pub struct PromptContract {
    pub version: &'static str,
    /// Exact sentence the model must use when the answer is not in context.
    pub refusal: &'static str,
    /// Exact sentence used when asked about someone else's data.
    pub privacy_refusal: &'static str,
    /// Opening of the reply to a message that only carries contact details.
    pub contact_acknowledgement: &'static str,
    pub uncertainty_phrases: &'static [&'static str],
}

pub const PROMPT_CONTRACT: PromptContract = PromptContract {
    version: "3",
    refusal: "I don't have that information right now. Please share your phone number or email and our support team will get back to you.",
    privacy_refusal: "I can only help with your own insurance information and cannot share details about other employees.",
    contact_acknowledgement: "Thank you for your contact information",
    uncertainty_phrases: &[
        "i don't have",
        "i do not have",
        "i'm not sure",
        "i am not sure",
        "not certain",
        "unable to find",
        "cannot find",
        "can't find",
        "no information",
        "don't know",
        "please contact",
    ],
};

/// Lower-case and drop markdown emphasis so `**I don't have**` still matches.
pub fn plain_text(answer: &str) -> String {
    answer
        .chars()
        .filter(|c| *c != '*' && *c != '_')
        .collect::<String>()
        .to_lowercase()
}

impl PromptContract {
    pub fn is_refusal(&self, answer: &str) -> bool {
        plain_text(answer).contains(&self.refusal.to_lowercase())
    }

    pub fn is_privacy_refusal(&self, answer: &str) -> bool {
        plain_text(answer).contains(&self.privacy_refusal.to_lowercase())
    }

    pub fn is_contact_acknowledgement(&self, answer: &str) -> bool {
        plain_text(answer).contains(&self.contact_acknowledgement.to_lowercase())
    }

    pub fn is_uncertain(&self, answer: &str) -> bool {
        let text = plain_text(answer);
        self.uncertainty_phrases.iter().any(|p| text.contains(p))
    }
}

/// Confidence in [0, 1] derived from retrieval quality and the answer text.
pub fn score_confidence(answer: &str, contexts: &[Context], finish_reason: FinishReason) -> f64 {
    let contract = PROMPT_CONTRACT;

    let mean_similarity = if contexts.is_empty() {
        0.0
    } else {
        contexts.iter().map(|c| c.similarity).sum::<f64>() / contexts.len() as f64
    };
    let mut confidence = 0.5 + 0.3 * mean_similarity.clamp(0.0, 1.0);

    if contract.is_contact_acknowledgement(answer) {
        confidence = confidence.max(0.75);
    } else if contract.is_uncertain(answer) {
        confidence = confidence.min(0.5);
    }

    if finish_reason == FinishReason::Length {
        confidence *= 0.9;
    }

    confidence.clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub contexts: &'a [Context],
    pub knowledge_exists: bool,
    pub subject: &'a SubjectProfile,
    pub history: &'a [Message],
    pub ai: &'a AiConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAnswer {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<Source>,
    pub knowledge_match: KnowledgeMatch,
    pub finish_reason: FinishReason,
}

pub struct ResponseSynthesizer {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
    history_turns: usize,
}

impl ResponseSynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32, history_turns: usize) -> Self {
        Self {
            provider,
            max_tokens,
            history_turns,
        }
    }

    #[instrument(skip_all, fields(contexts = input.contexts.len(), history = input.history.len()))]
    pub async fn answer(&self, input: SynthesisInput<'_>) -> Result<SynthesizedAnswer, AppError> {
        let request = CompletionRequest {
            messages: build_messages(&input, self.history_turns),
            model: input.ai.model.clone(),
            temperature: input.ai.temperature,
            max_tokens: self.max_tokens,
        };

        let completion = self.provider.complete(&request).await?;
        let answer = completion.text.trim().to_string();
        if answer.is_empty() {
            return Err(AppError::BadGateway(
                "Completion provider returned an empty answer".to_string(),
            ));
        }

        let confidence = score_confidence(&answer, input.contexts, completion.finish_reason);

        Ok(SynthesizedAnswer {
            answer,
            confidence,
            sources: input.contexts.iter().map(Source::from).collect(),
            knowledge_match: KnowledgeMatch::classify(input.contexts.len(), input.knowledge_exists),
            finish_reason: completion.finish_reason,
        })
    }
}

/// System prompt, the most recent `history_turns` messages, then the query.
pub fn build_messages(input: &SynthesisInput<'_>, history_turns: usize) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history_turns + 2);
    turns.push(ChatTurn::system(build_system_prompt(
        input.subject,
        input.contexts,
        input.ai,
    )));

    let skip = input.history.len().saturating_sub(history_turns);
    turns.extend(input.history.iter().skip(skip).map(|m| match m.role {
        MessageRole::User => ChatTurn::user(m.content.clone()),
        MessageRole::Assistant => ChatTurn::assistant(m.content.clone()),
    }));

    turns.push(ChatTurn::user(input.query));
    turns
}

pub fn build_system_prompt(subject: &SubjectProfile, contexts: &[Context], ai: &AiConfig) -> String {
    let contract = PROMPT_CONTRACT;
    let mut prompt = String::new();

    prompt.push_str(ai.system_prompt.as_deref().unwrap_or(
        "You are a helpful insurance benefits assistant answering questions from employees.",
    ));
    prompt.push_str("\n\n## Employee profile\n");
    prompt.push_str(&format!("- Name: {}\n", subject.name));
    prompt.push_str(&format!("- Employee ID: {}\n", subject.employee_id));
    if let Some(department) = &subject.department {
        prompt.push_str(&format!("- Department: {}\n", department));
    }
    prompt.push_str(&format!(
        "- Policy: {}\n",
        subject.policy_type.as_deref().unwrap_or("not specified")
    ));
    if let Some(limit) = subject.coverage_limit {
        prompt.push_str(&format!("- Coverage limit: {:.2}\n", limit));
    }

    prompt.push_str("\n## Knowledge base context\n");
    if contexts.is_empty() {
        prompt.push_str("(no relevant entries found)\n");
    }
    for (i, ctx) in contexts.iter().enumerate() {
        let label = match &ctx.subcategory {
            Some(sub) => format!("{}/{}", ctx.category, sub),
            None => ctx.category.clone(),
        };
        prompt.push_str(&format!(
            "[{}] ({}) {}\n{}\n\n",
            i + 1,
            label,
            ctx.title,
            ctx.content
        ));
    }

    prompt.push_str("\n## Rules\n");
    prompt.push_str("1. Answer only from the knowledge base context and the employee profile above.\n");
    prompt.push_str(&format!(
        "2. If the information is not available, reply with exactly: \"{}\"\n",
        contract.refusal
    ));
    prompt.push_str(&format!(
        "3. Never discuss another employee's data. If asked, reply with exactly: \"{}\"\n",
        contract.privacy_refusal
    ));
    prompt.push_str("4. Never invent amounts, dates, limits or procedures.\n");
    prompt.push_str(&format!(
        "5. If the message only contains a phone number or email address, begin your reply with \"{}\" and confirm the team will follow up.\n",
        contract.contact_acknowledgement
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::mock::MockCompletionProvider;
    use uuid::Uuid;

    fn ctx(similarity: f64, sub: &str) -> Context {
        Context {
            id: Uuid::new_v4(),
            title: "Dental".to_string(),
            category: "benefits".to_string(),
            subcategory: Some(sub.to_string()),
            content: "Dental is covered up to 500 per year.".to_string(),
            similarity,
        }
    }

    fn subject() -> SubjectProfile {
        SubjectProfile {
            id: Uuid::new_v4(),
            employee_id: "E100".to_string(),
            name: "Mei".to_string(),
            email: None,
            department: Some("Finance".to_string()),
            policy_type: Some("Standard".to_string()),
            coverage_limit: Some(5000.0),
            is_active: true,
        }
    }

    #[test]
    fn baseline_confidence_from_similarity() {
        let contexts = [ctx(0.81, "general"), ctx(0.76, "dental")];
        let c = score_confidence("Your dental limit is 500.", &contexts, FinishReason::Complete);
        assert!((c - (0.5 + 0.3 * 0.785)).abs() < 1e-9);
        assert!(c > 0.5);
    }

    #[test]
    fn uncertainty_caps_and_acknowledgement_floors() {
        let contexts = [ctx(0.95, "general")];
        let uncertain = score_confidence("I'm not sure about that.", &contexts, FinishReason::Complete);
        assert_eq!(uncertain, 0.5);

        let ack = score_confidence(
            "Thank you for your contact information, I don't have more to add.",
            &[],
            FinishReason::Complete,
        );
        assert_eq!(ack, 0.75);
    }

    #[test]
    fn truncation_discounts_confidence() {
        let contexts = [ctx(1.0, "general")];
        let c = score_confidence("Covered.", &contexts, FinishReason::Length);
        assert!((c - 0.72).abs() < 1e-9);
    }

    #[test]
    fn refusal_detection_ignores_markdown_emphasis() {
        let wrapped = format!("**{}**", PROMPT_CONTRACT.refusal.replace("right now", "_right now_"));
        assert!(PROMPT_CONTRACT.is_refusal(&wrapped));
        assert!(!PROMPT_CONTRACT.is_refusal("Your limit is 500."));
    }

    #[test]
    fn prompt_carries_contract_sentences_and_contexts() {
        let contexts = [ctx(0.8, "dental")];
        let prompt = build_system_prompt(&subject(), &contexts, &AiConfig::default());
        assert!(prompt.contains(PROMPT_CONTRACT.refusal));
        assert!(prompt.contains(PROMPT_CONTRACT.privacy_refusal));
        assert!(prompt.contains("(benefits/dental) Dental"));
        assert!(prompt.contains("Policy: Standard"));
    }

    #[tokio::test]
    async fn history_is_truncated_to_recent_turns() {
        let provider = Arc::new(MockCompletionProvider::new("Covered."));
        let synth = ResponseSynthesizer::new(provider.clone(), 256, 2);
        let conv = Uuid::new_v4();
        let history: Vec<Message> = (0..5)
            .map(|n| Message {
                id: Uuid::new_v4(),
                conversation_id: conv,
                role: if n % 2 == 0 { MessageRole::User } else { MessageRole::Assistant },
                content: format!("turn {}", n),
                confidence: None,
                sources: Vec::new(),
                was_escalated: false,
                created_at: chrono::Utc::now(),
            })
            .collect();
        let subject = subject();
        let ai = AiConfig::default();

        let answer = synth
            .answer(SynthesisInput {
                query: "What is my dental limit?",
                contexts: &[ctx(0.8, "dental"), ctx(0.7, "general")],
                knowledge_exists: true,
                subject: &subject,
                history: &history,
                ai: &ai,
            })
            .await
            .unwrap();

        assert_eq!(answer.knowledge_match, KnowledgeMatch::GoodMatch);
        let sent = &provider.requests()[0].messages;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1].content, "turn 3");
        assert_eq!(sent[3].content, "What is my dental limit?");
    }
}
