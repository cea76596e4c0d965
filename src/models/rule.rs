use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::request::Urgency;

pub type RuleId = Uuid;
pub type RecipientId = Uuid;

/// Which plugin to instantiate and the parameters handed to its factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfiguration {
    pub plugin_id: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
}

impl PluginConfiguration {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default = "Uuid::new_v4")]
    pub id: RuleId,
    pub label: String,
    pub matcher: PluginConfiguration,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub urgency: Urgency,

    /// Recipients notified when the rule matches. A recipient owned by
    /// another rule may be attached here too.
    #[serde(default)]
    pub recipient_ids: BTreeSet<RecipientId>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn new(label: impl Into<String>, matcher: PluginConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            matcher,
            active: true,
            urgency: Urgency::Deferred,
            recipient_ids: BTreeSet::new(),
        }
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default = "Uuid::new_v4")]
    pub id: RecipientId,
    pub rule_id: RuleId,
    pub label: String,
    pub sender: PluginConfiguration,

    /// `None` defers to the sender plugin's own answer.
    #[serde(default)]
    pub ack_required: Option<bool>,
}

impl Recipient {
    pub fn new(rule_id: RuleId, label: impl Into<String>, sender: PluginConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            label: label.into(),
            sender,
            ack_required: None,
        }
    }

    pub fn with_ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = Some(ack_required);
        self
    }
}
