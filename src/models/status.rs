use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{request::NotificationRequest, tenant::TenantId};

/// Lifecycle states reported back to whoever emitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Granted,
    Denied,
    Success,
    Error,
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            NotificationStatus::Granted => write!(f, "GRANTED"),
            NotificationStatus::Denied => write!(f, "DENIED"),
            NotificationStatus::Success => write!(f, "SUCCESS"),
            NotificationStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierEvent {
    pub tenant: TenantId,
    pub request_id: String,
    pub owner: Option<String>,
    pub status: NotificationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl NotifierEvent {
    pub fn new(
        tenant: &TenantId,
        request_id: String,
        owner: Option<String>,
        status: NotificationStatus,
    ) -> Self {
        Self {
            tenant: tenant.clone(),
            request_id,
            owner,
            status,
            recipient: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_request(
        tenant: &TenantId,
        request: &NotificationRequest,
        status: NotificationStatus,
    ) -> Self {
        Self::new(tenant, request.request_id.clone(), request.owner.clone(), status)
    }

    pub fn with_recipient(mut self, label: impl Into<String>) -> Self {
        self.recipient = Some(label.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
