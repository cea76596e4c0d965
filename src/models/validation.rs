use anyhow::{Result, anyhow};

use crate::models::request::RawEvent;

const MAX_REQUEST_ID_LEN: usize = 128;
const MAX_OWNER_LEN: usize = 128;

pub fn validate_raw_event(event: &RawEvent) -> Result<()> {
    if event.request_id.trim().is_empty() {
        return Err(anyhow!("Request id cannot be empty"));
    }

    if event.request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(anyhow!(
            "Request id too long (maximum {} characters)",
            MAX_REQUEST_ID_LEN
        ));
    }

    if let Some(owner) = &event.owner {
        if owner.len() > MAX_OWNER_LEN {
            return Err(anyhow!("Owner too long (maximum {} characters)", MAX_OWNER_LEN));
        }
    }

    if !event.payload.is_object() {
        return Err(anyhow!("Payload must be a JSON object"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::request::ActionKind;

    #[test]
    fn accepts_object_payloads() {
        let event = RawEvent::new(ActionKind::Create, json!({ "nature": "TM" })).with_owner("ingest");
        assert!(validate_raw_event(&event).is_ok());
    }

    #[test]
    fn rejects_scalar_payloads_and_blank_ids() {
        let scalar = RawEvent::new(ActionKind::Create, json!(42));
        assert!(validate_raw_event(&scalar).is_err());

        let blank = RawEvent::new(ActionKind::Create, json!({})).with_request_id("  ");
        assert!(validate_raw_event(&blank).is_err());

        let long_owner = RawEvent::new(ActionKind::Create, json!({})).with_owner("x".repeat(200));
        assert!(validate_raw_event(&long_owner).is_err());
    }
}
