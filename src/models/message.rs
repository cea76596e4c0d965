use serde::{Deserialize, Serialize};

use crate::models::request::RawEvent;

/// Wire shape of one intake queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeMessage {
    pub tenant: String,
    pub event: RawEvent,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::request::ActionKind;

    #[test]
    fn decodes_tenant_and_event() {
        let message: IntakeMessage = serde_json::from_value(json!({
            "tenant": "project-a",
            "event": {
                "request_id": "req-1",
                "owner": "alice",
                "action": "DELETE",
                "payload": { "id": 7 }
            }
        }))
        .unwrap();

        assert_eq!(message.tenant, "project-a");
        assert_eq!(message.event.request_id, "req-1");
        assert_eq!(message.event.action, ActionKind::Delete);
    }
}
