pub mod matchers;
pub mod senders;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{request::NotificationRequest, rule::PluginConfiguration};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no {kind} plugin registered under '{plugin_id}'")]
    UnknownPlugin { kind: &'static str, plugin_id: String },

    #[error("plugin parameter '{name}' {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("matcher evaluation failed: {0}")]
    Evaluation(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    pub fn missing(name: &str) -> Self {
        PluginError::InvalidParameter {
            name: name.to_string(),
            reason: "is required".to_string(),
        }
    }

    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        PluginError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decides whether a rule applies to a request payload.
pub trait RuleMatcher: Send + Sync {
    fn matches(&self, payload: &JsonValue) -> Result<bool, PluginError>;
}

/// One request of a batch that a sender could not deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub request_id: Uuid,
    pub cause: String,
}

impl SendFailure {
    pub fn new(request_id: Uuid, cause: impl Into<String>) -> Self {
        Self {
            request_id,
            cause: cause.into(),
        }
    }
}

/// Delivers batches of requests to one recipient.
#[async_trait]
pub trait RecipientSender: Send + Sync {
    /// Returns the requests that were not delivered; empty means the whole batch went through.
    async fn send(&self, requests: &[NotificationRequest]) -> Result<Vec<SendFailure>, PluginError>;

    fn is_ack_required(&self) -> bool {
        true
    }

    /// Whether events may name this recipient explicitly, bypassing rules.
    fn accepts_direct_notifications(&self) -> bool {
        false
    }

    fn label(&self) -> &str;
}

/// Typed view over a plugin configuration's parameter map.
pub struct PluginParameters<'a> {
    configuration: &'a PluginConfiguration,
}

impl<'a> PluginParameters<'a> {
    pub fn new(configuration: &'a PluginConfiguration) -> Self {
        Self { configuration }
    }

    pub fn get(&self, name: &str) -> Option<&'a JsonValue> {
        self.configuration.parameters.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&'a JsonValue, PluginError> {
        self.get(name).ok_or_else(|| PluginError::missing(name))
    }

    pub fn require_str(&self, name: &str) -> Result<&'a str, PluginError> {
        let value = self
            .require(name)?
            .as_str()
            .ok_or_else(|| PluginError::invalid(name, "must be a string"))?;

        if value.trim().is_empty() {
            return Err(PluginError::invalid(name, "cannot be empty"));
        }
        Ok(value)
    }

    pub fn optional_u64(&self, name: &str) -> Result<Option<u64>, PluginError> {
        match self.get(name) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| PluginError::invalid(name, "must be a positive integer")),
        }
    }

    pub fn optional_bool(&self, name: &str) -> Result<Option<bool>, PluginError> {
        match self.get(name) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => value
                .as_bool()
                .map(Some)
                .ok_or_else(|| PluginError::invalid(name, "must be a boolean")),
        }
    }
}

type MatcherFactory =
    Arc<dyn Fn(&PluginParameters<'_>) -> Result<Arc<dyn RuleMatcher>, PluginError> + Send + Sync>;

type SenderFactory = Arc<
    dyn Fn(&PluginParameters<'_>, &str) -> Result<Arc<dyn RecipientSender>, PluginError>
        + Send
        + Sync,
>;

/// Explicit factory table for every plugin kind the service can run.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    matchers: HashMap<String, MatcherFactory>,
    senders: HashMap<String, SenderFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut matchers: Vec<_> = self.matchers.keys().collect();
        let mut senders: Vec<_> = self.senders.keys().collect();
        matchers.sort();
        senders.sort();
        f.debug_struct("PluginRegistry")
            .field("matchers", &matchers)
            .field("senders", &senders)
            .finish()
    }
}

impl PluginRegistry {
    /// Registry preloaded with the plugins that need no external handle.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register_matcher(matchers::FIELD_EQUALS, matchers::FieldEqualsMatcher::from_parameters);
        registry.register_matcher(matchers::ALWAYS, |_| {
            Ok(Arc::new(matchers::AlwaysMatcher) as Arc<dyn RuleMatcher>)
        });
        registry.register_sender(senders::LOG, senders::LogSender::from_parameters);
        registry.register_sender(senders::WEBHOOK, senders::WebhookSender::from_parameters);
        registry
    }

    pub fn register_matcher<F>(&mut self, plugin_id: impl Into<String>, factory: F)
    where
        F: Fn(&PluginParameters<'_>) -> Result<Arc<dyn RuleMatcher>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.matchers.insert(plugin_id.into(), Arc::new(factory));
    }

    pub fn register_sender<F>(&mut self, plugin_id: impl Into<String>, factory: F)
    where
        F: Fn(&PluginParameters<'_>, &str) -> Result<Arc<dyn RecipientSender>, PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.senders.insert(plugin_id.into(), Arc::new(factory));
    }

    pub fn has_matcher(&self, plugin_id: &str) -> bool {
        self.matchers.contains_key(plugin_id)
    }

    pub fn has_sender(&self, plugin_id: &str) -> bool {
        self.senders.contains_key(plugin_id)
    }

    pub fn matcher(&self, configuration: &PluginConfiguration) -> Result<Arc<dyn RuleMatcher>, PluginError> {
        let factory = self
            .matchers
            .get(&configuration.plugin_id)
            .ok_or_else(|| PluginError::UnknownPlugin {
                kind: "matcher",
                plugin_id: configuration.plugin_id.clone(),
            })?;

        factory(&PluginParameters::new(configuration))
    }

    pub fn sender(
        &self,
        configuration: &PluginConfiguration,
        label: &str,
    ) -> Result<Arc<dyn RecipientSender>, PluginError> {
        let factory = self
            .senders
            .get(&configuration.plugin_id)
            .ok_or_else(|| PluginError::UnknownPlugin {
                kind: "sender",
                plugin_id: configuration.plugin_id.clone(),
            })?;

        factory(&PluginParameters::new(configuration), label)
    }
}
