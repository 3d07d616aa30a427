use std::collections::HashMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(FeedbackRecord, "feedback_record", {
    message_id: String,
    tenant_id: String,
    user_id: String,
    rating: i8,
    issue_tag: Option<String>,
    note: Option<String>
});

/// Read-side aggregation over feedback rows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedbackStats {
    pub up: u64,
    pub down: u64,
    pub by_issue: HashMap<String, u64>,
}

impl FeedbackRecord {
    pub fn new(
        message_id: String,
        tenant_id: String,
        user_id: String,
        rating: i8,
        issue_tag: Option<String>,
        note: Option<String>,
    ) -> Result<Self, AppError> {
        if rating != 1 && rating != -1 {
            return Err(AppError::Validation(format!(
                "rating must be +1 or -1, got {rating}"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            message_id,
            tenant_id,
            user_id,
            rating,
            issue_tag,
            note,
        })
    }

    pub async fn append(self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self).await?;
        Ok(())
    }

    pub async fn stats_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<FeedbackStats, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        let mut stats = FeedbackStats::default();
        for row in rows {
            if row.rating > 0 {
                stats.up += 1;
            } else {
                stats.down += 1;
            }
            if let Some(tag) = row.issue_tag {
                *stats.by_issue.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}
