//! Tenant (company) model and the typed partition handle.

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Postgres schema that owns one tenant's data.
///
/// Construction validates the identifier, so a handle can be interpolated into
/// SQL as a quoted schema name without further escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionHandle(String);

impl PartitionHandle {
    pub const PUBLIC: &'static str = "public";

    pub fn parse(name: &str) -> Result<Self, AppError> {
        let valid = !name.is_empty()
            && name.len() <= 63
            && name
                .chars()
                .next()
                .map(|c| c.is_ascii_lowercase() || c == '_')
                .unwrap_or(false)
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if !valid {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Invalid partition identifier '{}'",
                name
            )));
        }

        Ok(Self(name.to_string()))
    }

    /// Default partition assumed when a relay tag carries no schema.
    pub fn public() -> Self {
        Self(Self::PUBLIC.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Schema-qualified table name, e.g. `"acme"."escalations"`.
    pub fn qualify(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.0, table)
    }
}

impl TryFrom<String> for PartitionHandle {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionHandle> for String {
    fn from(value: PartitionHandle) -> Self {
        value.0
    }
}

impl std::fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" | "disabled" => Ok(Self::Inactive),
            _ => Err(format!("Invalid tenant status: {}", s)),
        }
    }
}

/// Per-tenant AI settings. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Completion model override; the provider default is used when unset.
    pub model: Option<String>,
    pub temperature: f32,
    pub similarity_threshold: f64,
    pub top_k: usize,
    pub escalation_threshold: f64,
    pub system_prompt: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.3,
            similarity_threshold: 0.7,
            top_k: 5,
            escalation_threshold: 0.5,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub domain: String,
    pub alternate_domains: Vec<String>,
    pub partition: PartitionHandle,
    pub status: TenantStatus,
    pub ai: AiConfig,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Row shape of `public.companies`.
#[derive(Debug, Clone, FromRow)]
pub struct TenantRow {
    pub id: Uuid,
    pub name: String,
    pub domain: String,
    pub additional_domains: Option<Vec<String>>,
    pub schema_name: String,
    pub status: String,
    pub ai_settings: Option<Json<AiConfig>>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = AppError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| AppError::DatabaseError(anyhow::anyhow!(e)))?;
        let partition = PartitionHandle::parse(&row.schema_name).map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Tenant {} has an unusable schema name: {}",
                row.id,
                e
            ))
        })?;

        Ok(Tenant {
            id: row.id,
            name: row.name,
            domain: row.domain,
            alternate_domains: row.additional_domains.unwrap_or_default(),
            partition,
            status,
            ai: row.ai_settings.map(|j| j.0).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_handle_accepts_schema_identifiers() {
        assert!(PartitionHandle::parse("company_acme").is_ok());
        assert!(PartitionHandle::parse("_tenant2").is_ok());
        assert_eq!(PartitionHandle::public().name(), "public");
    }

    #[test]
    fn partition_handle_rejects_injection() {
        assert!(PartitionHandle::parse("").is_err());
        assert!(PartitionHandle::parse("acme\"; drop table x; --").is_err());
        assert!(PartitionHandle::parse("Acme").is_err());
        assert!(PartitionHandle::parse("1acme").is_err());
    }

    #[test]
    fn qualify_quotes_schema_and_table() {
        let handle = PartitionHandle::parse("acme").unwrap();
        assert_eq!(handle.qualify("escalations"), "\"acme\".\"escalations\"");
    }

    #[test]
    fn ai_config_fills_missing_fields_with_defaults() {
        let cfg: AiConfig = serde_json::from_str(r#"{"escalation_threshold": 0.6}"#).unwrap();
        assert_eq!(cfg.escalation_threshold, 0.6);
        assert_eq!(cfg.top_k, 5);
        assert_eq!(cfg.similarity_threshold, 0.7);
    }
}
