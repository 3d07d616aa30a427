use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IngestionTaskStatus {
    Created,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 120;

stored_object!(IngestionTask, "ingestion_task", {
    document_id: String,
    tenant_id: String,
    user_id: String,
    blob_location: String,
    declared_type: String,
    document_name: String,
    status: IngestionTaskStatus,
    attempts: u32,
    worker_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    lease_until: Option<DateTime<Utc>>,
    last_error: Option<String>
});

impl IngestionTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        tenant_id: String,
        user_id: String,
        blob_location: String,
        declared_type: String,
        document_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            tenant_id,
            user_id,
            blob_location,
            declared_type,
            document_name,
            status: IngestionTaskStatus::Created,
            attempts: 0,
            worker_id: None,
            lease_until: None,
            last_error: None,
        }
    }

    /// Claims the oldest runnable task for a worker: newly created tasks, or
    /// in-progress tasks whose lease expired with attempts remaining. The
    /// claim bumps the attempt counter and extends the lease in the same
    /// update, so a crashed worker's task becomes claimable again.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<Self>, AppError> {
        let mut candidates = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE status = 'Created' \
                    OR (status = 'InProgress' \
                        AND attempts < $max_attempts \
                        AND (lease_until = NONE OR lease_until < $now)) \
                 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("max_attempts", MAX_ATTEMPTS))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .await?;

        let candidate: Option<Self> = candidates.take::<Vec<Self>>(0)?.into_iter().next();
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let lease_until = now + lease;
        let mut claimed = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                 status = 'InProgress', \
                 attempts = attempts + 1, \
                 worker_id = $worker_id, \
                 lease_until = $lease_until, \
                 updated_at = time::now() \
                 WHERE status = 'Created' \
                    OR (status = 'InProgress' AND (lease_until = NONE OR lease_until < $now)) \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", candidate.id.clone()))
            .bind(("worker_id", worker_id.to_owned()))
            .bind(("lease_until", surrealdb::sql::Datetime::from(lease_until)))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .await?;

        Ok(claimed.take::<Vec<Self>>(0)?.into_iter().next())
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing($table, $id) SET \
             status = 'Completed', last_error = NONE, updated_at = time::now()",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", self.id.clone()))
        .await?
        .check()?;
        Ok(())
    }

    /// Records a failed attempt. Retryable failures with attempts remaining
    /// return the task to the queue; anything else is terminal.
    pub async fn mark_failed(
        &self,
        db: &SurrealDbClient,
        reason: &str,
        retryable: bool,
    ) -> Result<(), AppError> {
        let status = if retryable && self.attempts < MAX_ATTEMPTS {
            IngestionTaskStatus::Created
        } else {
            IngestionTaskStatus::Error
        };

        db.query(
            "UPDATE type::thing($table, $id) SET \
             status = $status, last_error = $reason, lease_until = NONE, updated_at = time::now()",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", self.id.clone()))
        .bind(("status", status))
        .bind(("reason", reason.to_owned()))
        .await?
        .check()?;
        Ok(())
    }
}
