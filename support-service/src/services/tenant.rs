//! Tenant resolution from the caller's domain.

use crate::models::Tenant;
use crate::services::repository::TenantDirectory;
use axum::http::HeaderMap;
use dashmap::DashMap;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Dedicated override header, checked right after the body field.
pub const DOMAIN_OVERRIDE_HEADER: &str = "x-company-domain";

/// Raw domain candidates in priority order: body field, override header,
/// Origin, Referer, Host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainCandidates(Vec<String>);

impl DomainCandidates {
    pub fn from_headers(headers: &HeaderMap, body_domain: Option<&str>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let candidates = [
            body_domain.map(str::to_string),
            header(DOMAIN_OVERRIDE_HEADER),
            header(axum::http::header::ORIGIN.as_str()),
            header(axum::http::header::REFERER.as_str()),
            header(axum::http::header::HOST.as_str()),
        ];

        Self(candidates.into_iter().flatten().collect())
    }

    pub fn from_values<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Self {
        Self(values.into_iter().map(Into::into).collect())
    }

    /// First candidate that is non-empty after trimming.
    pub fn winner(&self) -> Option<&str> {
        self.0
            .iter()
            .map(|c| c.trim())
            .find(|c| !c.is_empty())
    }
}

/// Canonical form of a domain. Idempotent.
pub fn normalize_domain(raw: &str) -> String {
    let mut current = normalize_pass(raw);
    // Passes after the first only remove characters, so this reaches a fixed point.
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_pass(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase();

    if let Some(idx) = s.find("://") {
        s = s[idx + 3..].to_string();
    }
    if let Some(idx) = s.find(['/', '?', '#']) {
        s.truncate(idx);
    }
    if let Some(idx) = s.rfind('@') {
        s = s[idx + 1..].to_string();
    }
    if let Some(idx) = s.rfind(':') {
        if s[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
            s.truncate(idx);
        }
    }

    let mut s = s.trim_end_matches(['.', '/']);
    while let Some(rest) = s.strip_prefix("www.") {
        s = rest;
    }
    s.to_string()
}

struct CachedTenant {
    tenant: Tenant,
    cached_at: Instant,
}

/// Resolves tenants by domain with a TTL cache keyed by normalized domain.
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    cache: DashMap<String, CachedTenant>,
    ttl: Duration,
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>, ttl: Duration) -> Self {
        Self {
            directory,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve the tenant for a request. Unknown domains are `NotFound` with a
    /// hint, disabled tenants are `Forbidden`.
    #[instrument(skip(self, candidates))]
    pub async fn resolve(&self, candidates: &DomainCandidates) -> Result<Tenant, AppError> {
        let raw = candidates.winner().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("No company domain supplied with the request"))
        })?;

        let domain = normalize_domain(raw);
        if domain.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Company domain '{}' is not a valid domain",
                raw
            )));
        }

        let tenant = match self.cached(&domain) {
            Some(t) => t,
            None => {
                let found = self.directory.find_by_domain(&domain).await?;
                let Some(tenant) = found else {
                    return Err(AppError::NotFoundWithHint(
                        anyhow::anyhow!("No company registered for domain '{}'", domain),
                        format!(
                            "Register '{}' as the company domain or one of its alternate domains",
                            domain
                        ),
                    ));
                };
                self.cache.insert(
                    domain.clone(),
                    CachedTenant {
                        tenant: tenant.clone(),
                        cached_at: Instant::now(),
                    },
                );
                tenant
            }
        };

        if !tenant.is_active() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Company '{}' is not active",
                tenant.name
            )));
        }

        debug!(tenant_id = %tenant.id, partition = %tenant.partition, "Tenant resolved");
        Ok(tenant)
    }

    fn cached(&self, domain: &str) -> Option<Tenant> {
        let entry = self.cache.get(domain)?;
        if entry.cached_at.elapsed() < self.ttl {
            return Some(entry.tenant.clone());
        }
        drop(entry);
        self.cache.remove(domain);
        None
    }

    /// Drop every cached domain that maps to `tenant_id`.
    ///
    /// Tenant records are provisioned and edited by the admin service, which
    /// owns the update path; its tenant-update hook calls this so domain or
    /// status changes apply before the TTL lapses.
    pub fn invalidate_tenant(&self, tenant_id: Uuid) {
        self.cache.retain(|_, v| v.tenant.id != tenant_id);
    }

    /// Resolve a partition named in a relay tag. Inactive tenants are still
    /// returned so operators can close escalations they already hold.
    pub async fn by_partition(&self, partition: &str) -> Result<Option<Tenant>, AppError> {
        self.directory.find_by_partition(partition).await
    }
}
