use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::rule::RecipientId;

/// Outstanding delivery failure of one recipient for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientError {
    pub request_id: Uuid,
    pub recipient_id: RecipientId,
    pub cause: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl RecipientError {
    pub fn new(request_id: Uuid, recipient_id: RecipientId, cause: String, now: DateTime<Utc>) -> Self {
        Self {
            request_id,
            recipient_id,
            cause,
            attempts: 1,
            first_failed_at: now,
            last_failed_at: now,
        }
    }

    pub fn record_retry_failure(&mut self, cause: String, now: DateTime<Utc>) {
        self.cause = cause;
        self.attempts += 1;
        self.last_failed_at = now;
    }
}
