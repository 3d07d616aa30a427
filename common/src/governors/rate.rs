use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// Reservation handed back by `try_acquire`; the pipeline reconciles it with
/// the actual token spend after the model call.
#[derive(Debug, Clone, Copy)]
pub struct RateReservation {
    pub estimated_tokens: u64,
}

struct Bucket {
    requests: f64,
    tokens: f64,
    refreshed_at: Instant,
}

/// Two continuous-refill token buckets per tenant: requests per minute and
/// model tokens per minute. Runs on the tokio clock so paused-clock tests
/// are deterministic.
pub struct RateGovernor {
    rpm: f64,
    tpm: f64,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateGovernor {
    pub fn new(rpm: u64, tpm: u64) -> Self {
        Self {
            rpm: rpm.max(1) as f64,
            tpm: tpm.max(1) as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn bucket_for(&self, tenant_id: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().await;
        Arc::clone(buckets.entry(tenant_id.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                requests: self.rpm,
                tokens: self.tpm,
                refreshed_at: Instant::now(),
            }))
        }))
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.refreshed_at).as_secs_f64();
        bucket.requests = (bucket.requests + elapsed * self.rpm / 60.0).min(self.rpm);
        bucket.tokens = (bucket.tokens + elapsed * self.tpm / 60.0).min(self.tpm);
        bucket.refreshed_at = now;
    }

    /// Checks the request bucket (cost 1) then the token bucket (estimated
    /// cost). A denial consumes nothing and carries the wait until the
    /// first-failing bucket can cover the cost.
    pub async fn try_acquire(
        &self,
        tenant_id: &str,
        estimated_tokens: u64,
    ) -> Result<RateReservation, AppError> {
        let handle = self.bucket_for(tenant_id).await;
        let mut bucket = handle.lock().await;
        self.refill(&mut bucket, Instant::now());

        if bucket.requests < 1.0 {
            let deficit = 1.0 - bucket.requests;
            return Err(AppError::RateLimited {
                retry_after: Duration::from_secs_f64(deficit * 60.0 / self.rpm),
            });
        }

        let estimate = estimated_tokens as f64;
        if bucket.tokens < estimate {
            let deficit = estimate - bucket.tokens;
            return Err(AppError::RateLimited {
                retry_after: Duration::from_secs_f64(deficit * 60.0 / self.tpm),
            });
        }

        bucket.requests -= 1.0;
        bucket.tokens -= estimate;
        Ok(RateReservation { estimated_tokens })
    }

    /// Settles a reservation against the actual spend. Excess reservation is
    /// returned; overruns draw the bucket negative so the next refill pays
    /// the debt.
    pub async fn reconcile(
        &self,
        tenant_id: &str,
        reservation: RateReservation,
        actual_tokens: u64,
    ) {
        let handle = self.bucket_for(tenant_id).await;
        let mut bucket = handle.lock().await;
        self.refill(&mut bucket, Instant::now());

        let delta = reservation.estimated_tokens as f64 - actual_tokens as f64;
        bucket.tokens = (bucket.tokens + delta).min(self.tpm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sixth_request_in_a_burst_is_denied_with_retry_hint() {
        let governor = RateGovernor::new(5, 10_000);

        for i in 0..5 {
            governor
                .try_acquire("t1", 10)
                .await
                .unwrap_or_else(|_| panic!("request {i} should pass"));
        }

        match governor.try_acquire("t1", 10).await {
            Err(AppError::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rate denial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_refill_continuously() {
        let governor = RateGovernor::new(60, 10_000);

        for _ in 0..60 {
            governor.try_acquire("t1", 0).await.expect("initial burst");
        }
        assert!(governor.try_acquire("t1", 0).await.is_err());

        // 60 rpm refills one request per second.
        tokio::time::advance(Duration::from_secs(1)).await;
        governor
            .try_acquire("t1", 0)
            .await
            .expect("one request refilled after a second");
        assert!(governor.try_acquire("t1", 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_denies_oversized_estimates() {
        let governor = RateGovernor::new(100, 1000);

        governor
            .try_acquire("t1", 900)
            .await
            .expect("first estimate fits");
        match governor.try_acquire("t1", 200).await {
            Err(AppError::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected token denial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_returns_excess_reservation() {
        let governor = RateGovernor::new(100, 1000);

        let reservation = governor.try_acquire("t1", 900).await.expect("reserve");
        // Model actually used 100 tokens; 800 come back.
        governor.reconcile("t1", reservation, 100).await;

        governor
            .try_acquire("t1", 800)
            .await
            .expect("returned tokens are available again");
    }

    #[tokio::test(start_paused = true)]
    async fn tenants_have_independent_buckets() {
        let governor = RateGovernor::new(1, 1000);

        governor.try_acquire("t1", 0).await.expect("t1 first");
        assert!(governor.try_acquire("t1", 0).await.is_err());
        governor
            .try_acquire("t2", 0)
            .await
            .expect("t2 unaffected by t1 exhaustion");
    }
}
