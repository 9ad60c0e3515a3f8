use std::time::Duration;

use grpcio::RpcStatusCode;
use rand::Rng;

use crate::error::BigtableError;

/// Status codes worth another attempt. The read, mutate, and bulk paths all
/// classify against this one list.
pub const RETRYABLE_CODES: [RpcStatusCode; 3] = [
    RpcStatusCode::DEADLINE_EXCEEDED,
    RpcStatusCode::UNAVAILABLE,
    RpcStatusCode::ABORTED,
];

/// Shared retry description: which codes retry, and how long to wait
/// between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 1.2,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, err: &BigtableError) -> bool {
        matches!(err, BigtableError::Rpc { code, .. } if RETRYABLE_CODES.contains(code))
    }

    /// A fresh backoff schedule. One per operation; attempts within the
    /// operation share it so the pauses keep growing.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial_backoff,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
}

impl Backoff {
    /// The next pause: uniform jitter over the current interval, then grow
    /// the interval toward the cap.
    pub fn pause(&mut self) -> Duration {
        let current = self.next;
        self.next = current
            .mul_f64(self.policy.backoff_multiplier)
            .min(self.policy.max_backoff);
        current
            .mul_f64(rand::thread_rng().gen::<f64>())
            .max(Duration::from_millis(1))
    }

    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.pause()).await;
    }
}
