//! Postgres storage for support-service.
//!
//! `public.companies` holds the tenant directory; every tenant's rows live in
//! its own schema, addressed through a validated [`PartitionHandle`].

use crate::models::escalation::CONTACT_KEY;
use crate::models::{
    Context, ContactUpdate, Escalation, EscalationRow, EscalationStatus, LogRequest, Message,
    NewKnowledgeEntry, NewMessage, PartitionHandle, SubjectProfile, Tenant, TenantRow,
};
use crate::services::metrics::{record_db_error, record_db_operation};
use crate::services::repository::{
    ConversationStore, EscalationStore, KnowledgeStore, TenantDirectory,
};
use async_trait::async_trait;
use pgvector::Vector;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

const PARTITION_TEMPLATE: &str = include_str!("../../sql/partition.sql");

const TENANT_COLUMNS: &str =
    "id, name, domain, additional_domains, schema_name, status, ai_settings";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, confidence, sources, was_escalated, created_at";
const ESCALATION_COLUMNS: &str = "id, conversation_id, message_id, employee_id, query, context, \
     status, resolution, resolved_by, resolved_at, was_added_to_kb, created_at";

fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| {
        record_db_error(operation);
        AppError::DatabaseError(anyhow::anyhow!("{} failed: {}", operation, e))
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    embedding_dimensions: u32,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "support-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        embedding_dimensions: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self {
            pool,
            embedding_dimensions,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Create the partition's schema and tables when they do not exist yet.
    #[instrument(skip(self, partition), fields(partition = %partition))]
    pub async fn ensure_partition(&self, partition: &PartitionHandle) -> Result<(), AppError> {
        let ddl = PARTITION_TEMPLATE
            .replace("{schema}", partition.name())
            .replace("{dimensions}", &self.embedding_dimensions.to_string());

        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(db_error("ensure_partition"))?;

        info!("Partition ready");
        Ok(())
    }

    /// Ensure the public partition and every registered tenant partition.
    pub async fn ensure_all_partitions(&self) -> Result<usize, AppError> {
        self.ensure_partition(&PartitionHandle::public()).await?;

        let schemas: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT schema_name FROM public.companies")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("list_partitions"))?;

        let mut count = 0;
        for schema in schemas {
            match PartitionHandle::parse(&schema) {
                Ok(handle) => {
                    self.ensure_partition(&handle).await?;
                    count += 1;
                }
                Err(e) => tracing::warn!(schema = %schema, error = %e, "Skipping unusable schema"),
            }
        }
        Ok(count)
    }

    async fn fetch_tenant(&self, sql: &str, value: &str) -> Result<Option<Tenant>, AppError> {
        let row = sqlx::query_as::<_, TenantRow>(sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_tenant"))?;
        row.map(Tenant::try_from).transpose()
    }
}

#[async_trait]
impl TenantDirectory for PgStore {
    #[instrument(skip(self))]
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AppError> {
        let start = Instant::now();

        let exact = format!(
            "SELECT {} FROM public.companies WHERE domain = $1 LIMIT 1",
            TENANT_COLUMNS
        );
        let tenant = match self.fetch_tenant(&exact, domain).await? {
            Some(t) => Some(t),
            None => {
                let alternate = format!(
                    "SELECT {} FROM public.companies WHERE $1 = ANY(additional_domains) \
                     ORDER BY created_at LIMIT 1",
                    TENANT_COLUMNS
                );
                self.fetch_tenant(&alternate, domain).await?
            }
        };

        record_db_operation("find_tenant", start.elapsed().as_secs_f64());
        Ok(tenant)
    }

    #[instrument(skip(self))]
    async fn find_by_partition(&self, partition: &str) -> Result<Option<Tenant>, AppError> {
        let sql = format!(
            "SELECT {} FROM public.companies WHERE schema_name = $1 LIMIT 1",
            TENANT_COLUMNS
        );
        self.fetch_tenant(&sql, partition).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for PgStore {
    #[instrument(skip(self, embedding, partition), fields(partition = %partition))]
    async fn similarity_search(
        &self,
        partition: &PartitionHandle,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<Context>, AppError> {
        let start = Instant::now();
        let sql = format!(
            r#"
            SELECT id, title, category, subcategory, content,
                   (1 - (embedding <=> $1))::float8 AS similarity
            FROM {}
            WHERE is_active AND embedding IS NOT NULL
              AND 1 - (embedding <=> $1) >= $2
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
            partition.qualify("knowledge_base")
        );

        let contexts = sqlx::query_as::<_, Context>(&sql)
            .bind(Vector::from(embedding.to_vec()))
            .bind(threshold)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("similarity_search"))?;

        record_db_operation("similarity_search", start.elapsed().as_secs_f64());
        Ok(contexts)
    }

    #[instrument(skip(self, ids, partition), fields(partition = %partition, count = ids.len()))]
    async fn increment_usage(
        &self,
        partition: &PartitionHandle,
        ids: &[Uuid],
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET usage_count = usage_count + 1, last_used_at = NOW() WHERE id = ANY($1)",
            partition.qualify("knowledge_base")
        );
        sqlx::query(&sql)
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(db_error("increment_usage"))?;
        Ok(())
    }

    #[instrument(skip(self, entry, partition), fields(partition = %partition, category = %entry.category))]
    async fn insert_entry(
        &self,
        partition: &PartitionHandle,
        entry: &NewKnowledgeEntry,
    ) -> Result<Uuid, AppError> {
        let start = Instant::now();
        let sql = format!(
            r#"
            INSERT INTO {} (title, content, category, subcategory, source, embedding)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
            partition.qualify("knowledge_base")
        );

        let id: Uuid = sqlx::query_scalar(&sql)
            .bind(&entry.title)
            .bind(&entry.content)
            .bind(&entry.category)
            .bind(&entry.subcategory)
            .bind(&entry.source)
            .bind(Vector::from(entry.embedding.clone()))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("insert_knowledge"))?;

        record_db_operation("insert_knowledge", start.elapsed().as_secs_f64());
        info!(entry_id = %id, "Knowledge entry inserted");
        Ok(id)
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_subject(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
    ) -> Result<Option<SubjectProfile>, AppError> {
        let sql = format!(
            "SELECT id, employee_id, name, email, department, policy_type, coverage_limit, is_active \
             FROM {} WHERE id = $1",
            partition.qualify("employees")
        );
        sqlx::query_as::<_, SubjectProfile>(&sql)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_subject"))
    }

    async fn find_subject_by_employee_id(
        &self,
        partition: &PartitionHandle,
        employee_id: &str,
    ) -> Result<Option<SubjectProfile>, AppError> {
        let sql = format!(
            "SELECT id, employee_id, name, email, department, policy_type, coverage_limit, is_active \
             FROM {} WHERE employee_id = $1",
            partition.qualify("employees")
        );
        sqlx::query_as::<_, SubjectProfile>(&sql)
            .bind(employee_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_subject"))
    }

    #[instrument(skip(self, partition), fields(partition = %partition))]
    async fn create_conversation(
        &self,
        partition: &PartitionHandle,
        subject_id: Uuid,
        session_id: &str,
    ) -> Result<Uuid, AppError> {
        let sql = format!(
            "INSERT INTO {} (employee_id, session_id) VALUES ($1, $2) RETURNING id",
            partition.qualify("conversations")
        );
        sqlx::query_scalar(&sql)
            .bind(subject_id)
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("create_conversation"))
    }

    #[instrument(skip(self, message, partition), fields(partition = %partition, role = message.role.as_str()))]
    async fn append_message(
        &self,
        partition: &PartitionHandle,
        message: &NewMessage,
    ) -> Result<Message, AppError> {
        let start = Instant::now();
        let sql = format!(
            r#"
            INSERT INTO {} (conversation_id, role, content, confidence, sources)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            partition.qualify("chat_history"),
            MESSAGE_COLUMNS
        );

        let stored = sqlx::query_as::<_, Message>(&sql)
            .bind(message.conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.confidence)
            .bind(Json(&message.sources))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("append_message"))?;

        record_db_operation("append_message", start.elapsed().as_secs_f64());
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT $2",
            MESSAGE_COLUMNS,
            partition.qualify("chat_history")
        );
        let mut messages = sqlx::query_as::<_, Message>(&sql)
            .bind(conversation_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("recent_messages"))?;
        messages.reverse();
        Ok(messages)
    }

    async fn latest_assistant_message_id(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        let sql = format!(
            "SELECT id FROM {} WHERE conversation_id = $1 AND role = 'assistant' \
             ORDER BY created_at DESC LIMIT 1",
            partition.qualify("chat_history")
        );
        sqlx::query_scalar(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("latest_assistant_message"))
    }

    async fn mark_message_escalated(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET was_escalated = TRUE WHERE id = $1",
            partition.qualify("chat_history")
        );
        sqlx::query(&sql)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("mark_message_escalated"))?;
        Ok(())
    }

    async fn mark_message_escalation_resolved(
        &self,
        partition: &PartitionHandle,
        message_id: Uuid,
    ) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET escalation_resolved = TRUE WHERE id = $1",
            partition.qualify("chat_history")
        );
        sqlx::query(&sql)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("mark_message_resolved"))?;
        Ok(())
    }

    #[instrument(skip(self, notes, partition), fields(partition = %partition))]
    async fn create_log_request(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
        subject_id: Uuid,
        notes: Option<&str>,
    ) -> Result<LogRequest, AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (conversation_id, employee_id, notes)
            VALUES ($1, $2, $3)
            RETURNING id, conversation_id, employee_id AS subject_id, notes, status, created_at
            "#,
            partition.qualify("log_requests")
        );

        sqlx::query_as::<_, LogRequest>(&sql)
            .bind(conversation_id)
            .bind(subject_id)
            .bind(notes)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!(
                        "A Letter of Guarantee request already exists for this conversation"
                    ))
                }
                other => db_error("create_log_request")(other),
            })
    }
}

#[async_trait]
impl EscalationStore for PgStore {
    #[instrument(skip(self, escalation, partition), fields(partition = %partition, escalation_id = %escalation.id))]
    async fn insert_escalation(
        &self,
        partition: &PartitionHandle,
        escalation: &Escalation,
    ) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, conversation_id, message_id, employee_id, query, context, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            partition.qualify("escalations")
        );

        sqlx::query(&sql)
            .bind(escalation.id)
            .bind(escalation.conversation_id)
            .bind(escalation.last_message_id)
            .bind(escalation.subject_id)
            .bind(&escalation.query)
            .bind(Json(escalation.context_json()?))
            .bind(escalation.status.as_str())
            .bind(escalation.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_error("insert_escalation"))?;
        Ok(())
    }

    async fn find_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
    ) -> Result<Option<Escalation>, AppError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            ESCALATION_COLUMNS,
            partition.qualify("escalations")
        );
        let row = sqlx::query_as::<_, EscalationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_escalation"))?;
        row.map(Escalation::try_from).transpose()
    }

    async fn find_pending_for_conversation(
        &self,
        partition: &PartitionHandle,
        conversation_id: Uuid,
    ) -> Result<Option<Escalation>, AppError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE conversation_id = $1 AND status = 'pending' \
             ORDER BY created_at DESC LIMIT 1",
            ESCALATION_COLUMNS,
            partition.qualify("escalations")
        );
        let row = sqlx::query_as::<_, EscalationRow>(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("find_pending_escalation"))?;
        row.map(Escalation::try_from).transpose()
    }

    async fn attach_contact(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        update: &ContactUpdate,
    ) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET context = context || jsonb_build_object($2::text, $3::jsonb) WHERE id = $1",
            partition.qualify("escalations")
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(CONTACT_KEY)
            .bind(Json(update))
            .execute(&self.pool)
            .await
            .map_err(db_error("attach_contact"))?;
        Ok(())
    }

    #[instrument(skip(self, resolution, partition, status), fields(partition = %partition, status = %status))]
    async fn close_escalation(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
        status: EscalationStatus,
        resolution: &str,
        resolved_by: &str,
    ) -> Result<bool, AppError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $2, resolution = $3, resolved_by = $4, resolved_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
            partition.qualify("escalations")
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(resolution)
            .bind(resolved_by)
            .execute(&self.pool)
            .await
            .map_err(db_error("close_escalation"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_added_to_kb(
        &self,
        partition: &PartitionHandle,
        id: Uuid,
    ) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET was_added_to_kb = TRUE WHERE id = $1",
            partition.qualify("escalations")
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("mark_added_to_kb"))?;
        Ok(())
    }
}
