//! Domain models for the support service.

pub mod escalation;
pub mod knowledge;
pub mod session;
pub mod tenant;

pub use escalation::{
    ContactUpdate, Escalation, EscalationReason, EscalationRow, EscalationSnapshot,
    EscalationStatus, KnowledgeMatch, SubjectSnapshot,
};
pub use knowledge::{
    Context, KnowledgeEntry, NewKnowledgeEntry, Source, GENERAL_SUBCATEGORY, LEARNED_CATEGORY,
};
pub use session::{
    Attachment, LogRequest, Message, MessageRole, NewMessage, Session, SubjectProfile,
};
pub use tenant::{AiConfig, PartitionHandle, Tenant, TenantRow, TenantStatus};
