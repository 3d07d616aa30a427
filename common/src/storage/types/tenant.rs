use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::config::QuotaSettings,
};

stored_object!(Tenant, "tenant", {
    name: String,
    max_documents: u64,
    max_storage_bytes: u64,
    daily_query_cap: u64,
    daily_token_cap: u64
});

/// Resolved per-tenant caps used by the quota governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantLimits {
    pub max_documents: u64,
    pub max_storage_bytes: u64,
    pub daily_queries: u64,
    pub daily_tokens: u64,
}

impl From<&QuotaSettings> for TenantLimits {
    fn from(settings: &QuotaSettings) -> Self {
        Self {
            max_documents: settings.max_documents,
            max_storage_bytes: settings.max_storage_bytes,
            daily_queries: settings.daily_queries,
            daily_tokens: settings.daily_tokens,
        }
    }
}

impl Tenant {
    pub fn new(tenant_id: String, name: String, limits: TenantLimits) -> Self {
        let now = Utc::now();
        Self {
            id: tenant_id,
            created_at: now,
            updated_at: now,
            name,
            max_documents: limits.max_documents,
            max_storage_bytes: limits.max_storage_bytes,
            daily_query_cap: limits.daily_queries,
            daily_token_cap: limits.daily_tokens,
        }
    }

    pub fn limits(&self) -> TenantLimits {
        TenantLimits {
            max_documents: self.max_documents,
            max_storage_bytes: self.max_storage_bytes,
            daily_queries: self.daily_query_cap,
            daily_tokens: self.daily_token_cap,
        }
    }

    /// Per-tenant limits, falling back to the configured defaults when the
    /// tenant has no row of its own.
    pub async fn resolve_limits(
        db: &SurrealDbClient,
        tenant_id: &str,
        defaults: &QuotaSettings,
    ) -> Result<TenantLimits, AppError> {
        let row: Option<Self> = db.get_item(tenant_id).await?;
        Ok(row
            .map(|tenant| tenant.limits())
            .unwrap_or_else(|| defaults.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn resolve_limits_falls_back_to_defaults() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let defaults = QuotaSettings::default();
        let limits = Tenant::resolve_limits(&db, "absent", &defaults)
            .await
            .expect("resolve limits");

        assert_eq!(limits.max_documents, defaults.max_documents);
        assert_eq!(limits.daily_queries, defaults.daily_queries);
    }

    #[tokio::test]
    async fn resolve_limits_prefers_tenant_row() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let custom = TenantLimits {
            max_documents: 3,
            max_storage_bytes: 1024,
            daily_queries: 7,
            daily_tokens: 99,
        };
        db.store_item(Tenant::new("t1".into(), "Team One".into(), custom))
            .await
            .expect("store tenant");

        let limits = Tenant::resolve_limits(&db, "t1", &QuotaSettings::default())
            .await
            .expect("resolve limits");

        assert_eq!(limits, custom);
    }
}
