use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::plugins::{PluginError, PluginParameters, RuleMatcher};

pub const FIELD_EQUALS: &str = "field-equals";
pub const ALWAYS: &str = "always";

/// Matches when the attribute at a dotted path equals the expected value.
///
/// Parameters: `attribute` (e.g. `properties.nature`) and `value`. Scalars
/// compare by their textual form so `"42"` matches `42`; an array attribute
/// matches when any element does.
#[derive(Debug, Clone)]
pub struct FieldEqualsMatcher {
    path: Vec<String>,
    expected: JsonValue,
}

impl FieldEqualsMatcher {
    pub fn new(attribute: &str, expected: JsonValue) -> Result<Self, PluginError> {
        let path: Vec<String> = attribute.split('.').map(str::to_string).collect();

        if path.iter().any(|segment| segment.is_empty()) {
            return Err(PluginError::invalid("attribute", "contains an empty path segment"));
        }

        Ok(Self { path, expected })
    }

    pub fn from_parameters(parameters: &PluginParameters<'_>) -> Result<Arc<dyn RuleMatcher>, PluginError> {
        let attribute = parameters.require_str("attribute")?;
        let expected = parameters.require("value")?.clone();

        Ok(Arc::new(Self::new(attribute, expected)?))
    }

    fn lookup<'p>(&self, payload: &'p JsonValue) -> Option<&'p JsonValue> {
        self.path.iter().try_fold(payload, |current, segment| match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn value_equals(&self, actual: &JsonValue) -> bool {
        if actual == &self.expected {
            return true;
        }

        match (scalar_text(actual), scalar_text(&self.expected)) {
            (Some(actual), Some(expected)) => actual == expected,
            _ => false,
        }
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl RuleMatcher for FieldEqualsMatcher {
    fn matches(&self, payload: &JsonValue) -> Result<bool, PluginError> {
        if !payload.is_object() {
            return Err(PluginError::Evaluation("payload is not a JSON object".to_string()));
        }

        let matched = match self.lookup(payload) {
            None => false,
            Some(JsonValue::Array(items)) if !self.expected.is_array() => {
                items.iter().any(|item| self.value_equals(item))
            }
            Some(actual) => self.value_equals(actual),
        };

        Ok(matched)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlwaysMatcher;

impl RuleMatcher for AlwaysMatcher {
    fn matches(&self, _payload: &JsonValue) -> Result<bool, PluginError> {
        Ok(true)
    }
}
