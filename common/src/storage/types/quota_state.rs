use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(QuotaState, "quota_state", {
    tenant_id: String,
    documents_used: u64,
    storage_used_bytes: u64,
    queries_today: u64,
    tokens_today: u64,
    day_key: String
});

impl QuotaState {
    /// One row per tenant; the tenant id doubles as the record id.
    pub fn new(tenant_id: String, day_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: tenant_id.clone(),
            created_at: now,
            updated_at: now,
            tenant_id,
            documents_used: 0,
            storage_used_bytes: 0,
            queries_today: 0,
            tokens_today: 0,
            day_key,
        }
    }

    pub async fn load(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(tenant_id).await?)
    }

    /// Best-effort snapshot write; the in-memory governor remains the source
    /// of truth within a process lifetime.
    pub async fn save(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.upsert_item(self.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let mut state = QuotaState::new("t1".into(), "2026-08-01".into());
        state.documents_used = 3;
        state.tokens_today = 120;
        state.save(&db).await.expect("save");

        let loaded = QuotaState::load(&db, "t1")
            .await
            .expect("load")
            .expect("row exists");
        assert_eq!(loaded.documents_used, 3);
        assert_eq!(loaded.tokens_today, 120);
        assert_eq!(loaded.day_key, "2026-08-01");

        state.queries_today = 9;
        state.save(&db).await.expect("second save");
        let reloaded = QuotaState::load(&db, "t1")
            .await
            .expect("load")
            .expect("row exists");
        assert_eq!(reloaded.queries_today, 9);
    }

    #[tokio::test]
    async fn load_missing_tenant_is_none() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        assert!(QuotaState::load(&db, "absent").await.expect("load").is_none());
    }
}
