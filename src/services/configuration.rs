use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::store::{NotifierStore, StoreError},
    models::{
        rule::{Recipient, RecipientId, Rule, RuleId},
        tenant::TenantId,
    },
    plugins::PluginError,
    services::rule_cache::RuleCache,
};

const MAX_LABEL_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("label must be 1 to 128 characters")]
    InvalidLabel,

    #[error("invalid plugin configuration: {0}")]
    Plugin(#[from] PluginError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tenant-scoped CRUD over rules and recipients. Every successful write
/// invalidates the tenant's rule cache.
pub struct ConfigurationService {
    store: Arc<dyn NotifierStore>,
    cache: Arc<RuleCache>,
}

impl ConfigurationService {
    pub fn new(store: Arc<dyn NotifierStore>, cache: Arc<RuleCache>) -> Self {
        Self { store, cache }
    }

    pub async fn list_rules(&self, tenant: &TenantId) -> Result<Vec<Rule>, ConfigurationError> {
        Ok(self.store.list_rules(tenant).await?)
    }

    pub async fn get_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<Rule, ConfigurationError> {
        self.store
            .get_rule(tenant, rule_id)
            .await?
            .ok_or(ConfigurationError::NotFound {
                entity: "rule",
                id: rule_id,
            })
    }

    pub async fn create_rule(&self, tenant: &TenantId, rule: Rule) -> Result<Rule, ConfigurationError> {
        if self.store.get_rule(tenant, rule.id).await?.is_some() {
            return Err(ConfigurationError::AlreadyExists {
                entity: "rule",
                id: rule.id,
            });
        }

        self.save_rule(tenant, rule).await
    }

    pub async fn update_rule(&self, tenant: &TenantId, rule: Rule) -> Result<Rule, ConfigurationError> {
        self.get_rule(tenant, rule.id).await?;
        self.save_rule(tenant, rule).await
    }

    pub async fn delete_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<(), ConfigurationError> {
        if !self.store.delete_rule(tenant, rule_id).await? {
            return Err(ConfigurationError::NotFound {
                entity: "rule",
                id: rule_id,
            });
        }

        info!(tenant = %tenant, rule_id = %rule_id, "Rule deleted");
        self.cache.on_rule_changed(tenant, rule_id).await;
        Ok(())
    }

    pub async fn list_recipients(&self, tenant: &TenantId) -> Result<Vec<Recipient>, ConfigurationError> {
        Ok(self.store.list_recipients(tenant).await?)
    }

    pub async fn get_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<Recipient, ConfigurationError> {
        self.store
            .get_recipient(tenant, recipient_id)
            .await?
            .ok_or(ConfigurationError::NotFound {
                entity: "recipient",
                id: recipient_id,
            })
    }

    pub async fn create_recipient(
        &self,
        tenant: &TenantId,
        recipient: Recipient,
    ) -> Result<Recipient, ConfigurationError> {
        if self.store.get_recipient(tenant, recipient.id).await?.is_some() {
            return Err(ConfigurationError::AlreadyExists {
                entity: "recipient",
                id: recipient.id,
            });
        }

        self.save_recipient(tenant, recipient).await
    }

    pub async fn update_recipient(
        &self,
        tenant: &TenantId,
        recipient: Recipient,
    ) -> Result<Recipient, ConfigurationError> {
        self.get_recipient(tenant, recipient.id).await?;
        self.save_recipient(tenant, recipient).await
    }

    pub async fn delete_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<(), ConfigurationError> {
        if !self.store.delete_recipient(tenant, recipient_id).await? {
            return Err(ConfigurationError::NotFound {
                entity: "recipient",
                id: recipient_id,
            });
        }

        info!(tenant = %tenant, recipient_id = %recipient_id, "Recipient deleted");
        self.cache.on_recipient_changed(tenant, recipient_id).await;
        Ok(())
    }

    /// Makes an existing recipient also receive what `rule_id` matches.
    pub async fn attach_recipient(
        &self,
        tenant: &TenantId,
        rule_id: RuleId,
        recipient_id: RecipientId,
    ) -> Result<Rule, ConfigurationError> {
        let mut rule = self.get_rule(tenant, rule_id).await?;
        self.get_recipient(tenant, recipient_id).await?;

        rule.recipient_ids.insert(recipient_id);
        self.store.save_rule(tenant, &rule).await?;

        info!(tenant = %tenant, rule_id = %rule_id, recipient_id = %recipient_id, "Recipient attached to rule");
        self.cache.on_rule_changed(tenant, rule_id).await;
        Ok(rule)
    }

    async fn save_rule(&self, tenant: &TenantId, mut rule: Rule) -> Result<Rule, ConfigurationError> {
        check_label(&rule.label)?;
        self.cache.registry().matcher(&rule.matcher)?;

        for recipient_id in &rule.recipient_ids {
            self.get_recipient(tenant, *recipient_id).await?;
        }

        // Owned recipients stay linked whatever the caller sent.
        let rule_id = rule.id;
        let owned: Vec<RecipientId> = self
            .store
            .list_recipients(tenant)
            .await?
            .into_iter()
            .filter(|recipient| recipient.rule_id == rule_id)
            .map(|recipient| recipient.id)
            .collect();
        rule.recipient_ids.extend(owned);

        self.store.save_rule(tenant, &rule).await?;

        info!(tenant = %tenant, rule_id = %rule.id, label = %rule.label, active = rule.active, "Rule saved");
        self.cache.on_rule_changed(tenant, rule.id).await;
        Ok(rule)
    }

    async fn save_recipient(
        &self,
        tenant: &TenantId,
        recipient: Recipient,
    ) -> Result<Recipient, ConfigurationError> {
        check_label(&recipient.label)?;
        self.get_rule(tenant, recipient.rule_id).await?;
        self.cache
            .registry()
            .sender(&recipient.sender, &recipient.label)?;

        self.store.save_recipient(tenant, &recipient).await?;

        info!(
            tenant = %tenant,
            recipient_id = %recipient.id,
            rule_id = %recipient.rule_id,
            plugin_id = %recipient.sender.plugin_id,
            "Recipient saved"
        );
        self.cache.on_recipient_changed(tenant, recipient.id).await;
        Ok(recipient)
    }
}

fn check_label(label: &str) -> Result<(), ConfigurationError> {
    if label.trim().is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(ConfigurationError::InvalidLabel);
    }
    Ok(())
}
