use std::fmt::{Display, Formatter, Result as FmtResult};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Partition key carried by every read and write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        if value.is_empty() {
            return Err(anyhow!("Tenant id cannot be empty"));
        }

        if value.len() > 64 {
            return Err(anyhow!("Tenant id too long (maximum 64 characters)"));
        }

        let valid_chars = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if !valid_chars {
            return Err(anyhow!("Tenant id contains invalid characters"));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}
