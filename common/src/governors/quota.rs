use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::quota_state::QuotaState, types::tenant::Tenant},
    utils::config::QuotaSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Documents,
    StorageBytes,
    Queries,
    Tokens,
}

impl QuotaKind {
    fn is_daily(self) -> bool {
        matches!(self, Self::Queries | Self::Tokens)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::StorageBytes => "storage bytes",
            Self::Queries => "daily queries",
            Self::Tokens => "daily tokens",
        }
    }
}

struct TenantQuota {
    state: QuotaState,
    limits: crate::storage::types::tenant::TenantLimits,
}

/// Per-tenant quota counters. Document and storage counters are cumulative;
/// query and token counters reset on the first operation of a new UTC day.
pub struct QuotaGovernor {
    db: Arc<SurrealDbClient>,
    defaults: QuotaSettings,
    states: Mutex<HashMap<String, Arc<Mutex<TenantQuota>>>>,
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = (now + Duration::days(1)).date_naive();
    DateTime::from_naive_utc_and_offset(tomorrow.and_time(chrono::NaiveTime::MIN), Utc)
}

impl QuotaGovernor {
    pub fn new(db: Arc<SurrealDbClient>, defaults: QuotaSettings) -> Self {
        Self {
            db,
            defaults,
            states: Mutex::new(HashMap::new()),
        }
    }

    async fn entry_for(&self, tenant_id: &str) -> Result<Arc<Mutex<TenantQuota>>, AppError> {
        {
            let states = self.states.lock().await;
            if let Some(entry) = states.get(tenant_id) {
                return Ok(Arc::clone(entry));
            }
        }

        // Load outside the registry lock; a racing loader just wins the insert.
        let limits = Tenant::resolve_limits(&self.db, tenant_id, &self.defaults).await?;
        let state = QuotaState::load(&self.db, tenant_id)
            .await?
            .unwrap_or_else(|| QuotaState::new(tenant_id.to_owned(), day_key(Utc::now())));

        let mut states = self.states.lock().await;
        let entry = states
            .entry(tenant_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(TenantQuota { state, limits })));
        Ok(Arc::clone(entry))
    }

    pub async fn try_consume(
        &self,
        tenant_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> Result<(), AppError> {
        self.try_consume_at(tenant_id, kind, amount, Utc::now()).await
    }

    /// Atomic per-tenant consume. Day rollover happens before the check so
    /// the first request of a new day sees fresh daily counters.
    pub async fn try_consume_at(
        &self,
        tenant_id: &str,
        kind: QuotaKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let entry = self.entry_for(tenant_id).await?;
        let mut quota = entry.lock().await;

        rollover(&mut quota.state, now);

        let (used, cap) = match kind {
            QuotaKind::Documents => (quota.state.documents_used, quota.limits.max_documents),
            QuotaKind::StorageBytes => {
                (quota.state.storage_used_bytes, quota.limits.max_storage_bytes)
            }
            QuotaKind::Queries => (quota.state.queries_today, quota.limits.daily_queries),
            QuotaKind::Tokens => (quota.state.tokens_today, quota.limits.daily_tokens),
        };

        if used.saturating_add(amount) > cap {
            return Err(AppError::QuotaExceeded {
                reason: format!("{} cap of {} reached", kind.label(), cap),
                reset_at: kind.is_daily().then(|| next_midnight(now)),
            });
        }

        apply(&mut quota.state, kind, amount, true);
        self.persist(&quota.state).await;
        Ok(())
    }

    /// Consumes without a cap check. Used for post-call token reconciliation,
    /// where the spend already happened.
    pub async fn consume_unchecked(&self, tenant_id: &str, kind: QuotaKind, amount: u64) {
        if amount == 0 {
            return;
        }
        if let Ok(entry) = self.entry_for(tenant_id).await {
            let mut quota = entry.lock().await;
            rollover(&mut quota.state, Utc::now());
            apply(&mut quota.state, kind, amount, true);
            self.persist(&quota.state).await;
        }
    }

    /// Returns a reservation, e.g. when a document fails before becoming
    /// Ready.
    pub async fn release(&self, tenant_id: &str, kind: QuotaKind, amount: u64) {
        if amount == 0 {
            return;
        }
        if let Ok(entry) = self.entry_for(tenant_id).await {
            let mut quota = entry.lock().await;
            apply(&mut quota.state, kind, amount, false);
            self.persist(&quota.state).await;
        }
    }

    pub async fn snapshot(&self, tenant_id: &str) -> Result<QuotaState, AppError> {
        let entry = self.entry_for(tenant_id).await?;
        let mut quota = entry.lock().await;
        rollover(&mut quota.state, Utc::now());
        Ok(quota.state.clone())
    }

    async fn persist(&self, state: &QuotaState) {
        if let Err(err) = state.save(&self.db).await {
            warn!(tenant_id = %state.tenant_id, error = %err, "failed to persist quota state");
        }
    }
}

fn rollover(state: &mut QuotaState, now: DateTime<Utc>) {
    let today = day_key(now);
    if state.day_key != today {
        state.day_key = today;
        state.queries_today = 0;
        state.tokens_today = 0;
    }
}

fn apply(state: &mut QuotaState, kind: QuotaKind, amount: u64, add: bool) {
    let counter = match kind {
        QuotaKind::Documents => &mut state.documents_used,
        QuotaKind::StorageBytes => &mut state.storage_used_bytes,
        QuotaKind::Queries => &mut state.queries_today,
        QuotaKind::Tokens => &mut state.tokens_today,
    };
    *counter = if add {
        counter.saturating_add(amount)
    } else {
        counter.saturating_sub(amount)
    };
    state.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::tenant::TenantLimits;
    use uuid::Uuid;

    async fn governor(limits: Option<TenantLimits>) -> (QuotaGovernor, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        if let Some(limits) = limits {
            db.store_item(Tenant::new("t1".into(), "tenant one".into(), limits))
                .await
                .expect("store tenant");
        }
        (
            QuotaGovernor::new(Arc::clone(&db), QuotaSettings::default()),
            db,
        )
    }

    fn small_limits() -> TenantLimits {
        TenantLimits {
            max_documents: 2,
            max_storage_bytes: 100,
            daily_queries: 3,
            daily_tokens: 50,
        }
    }

    #[tokio::test]
    async fn denies_past_document_cap() {
        let (governor, _db) = governor(Some(small_limits())).await;

        governor
            .try_consume("t1", QuotaKind::Documents, 1)
            .await
            .expect("first document");
        governor
            .try_consume("t1", QuotaKind::Documents, 1)
            .await
            .expect("second document");

        let denied = governor.try_consume("t1", QuotaKind::Documents, 1).await;
        match denied {
            Err(AppError::QuotaExceeded { reset_at, .. }) => {
                assert!(reset_at.is_none(), "document cap is not daily");
            }
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn daily_counters_reset_exactly_once_at_rollover() {
        let (governor, _db) = governor(Some(small_limits())).await;
        let day_one = "2026-08-01T10:00:00Z".parse::<DateTime<Utc>>().expect("ts");
        let day_two = "2026-08-02T00:00:01Z".parse::<DateTime<Utc>>().expect("ts");

        for _ in 0..3 {
            governor
                .try_consume_at("t1", QuotaKind::Queries, 1, day_one)
                .await
                .expect("within daily cap");
        }
        assert!(governor
            .try_consume_at("t1", QuotaKind::Queries, 1, day_one)
            .await
            .is_err());

        // First operation of the new day sees fresh counters.
        governor
            .try_consume_at("t1", QuotaKind::Queries, 1, day_two)
            .await
            .expect("new day resets queries");

        let snapshot = governor.snapshot("t1").await.expect("snapshot");
        assert_eq!(snapshot.queries_today, 1);
        assert_eq!(
            snapshot.documents_used, 0,
            "cumulative counters must survive rollover"
        );
    }

    #[tokio::test]
    async fn denial_carries_reset_hint_for_daily_kinds() {
        let (governor, _db) = governor(Some(small_limits())).await;
        let now = "2026-08-01T10:00:00Z".parse::<DateTime<Utc>>().expect("ts");

        governor
            .try_consume_at("t1", QuotaKind::Tokens, 50, now)
            .await
            .expect("cap exactly reached is allowed");

        match governor.try_consume_at("t1", QuotaKind::Tokens, 1, now).await {
            Err(AppError::QuotaExceeded { reset_at, .. }) => {
                let reset = reset_at.expect("daily denial carries reset_at");
                assert!(reset > now);
                assert_eq!(day_key(reset), "2026-08-02");
            }
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_refunds_reservations() {
        let (governor, _db) = governor(Some(small_limits())).await;

        governor
            .try_consume("t1", QuotaKind::StorageBytes, 80)
            .await
            .expect("consume storage");
        governor.release("t1", QuotaKind::StorageBytes, 80).await;

        governor
            .try_consume("t1", QuotaKind::StorageBytes, 100)
            .await
            .expect("full cap available again after release");
    }

    #[tokio::test]
    async fn counters_survive_via_persisted_row() {
        let (governor, db) = governor(Some(small_limits())).await;
        governor
            .try_consume("t1", QuotaKind::Documents, 1)
            .await
            .expect("consume");
        drop(governor);

        // A fresh governor over the same db sees the persisted counter.
        let reloaded = QuotaGovernor::new(Arc::clone(&db), QuotaSettings::default());
        let snapshot = reloaded.snapshot("t1").await.expect("snapshot");
        assert_eq!(snapshot.documents_used, 1);
    }
}
