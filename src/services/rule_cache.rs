use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    clients::store::{NotifierStore, StoreError},
    models::{
        rule::{Recipient, RecipientId, Rule},
        tenant::TenantId,
    },
    plugins::{PluginRegistry, RecipientSender, RuleMatcher},
};

pub struct ActiveRule {
    pub rule: Rule,
    pub matcher: Arc<dyn RuleMatcher>,
}

impl fmt::Debug for ActiveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRule").field("rule", &self.rule).finish()
    }
}

/// A configured recipient and, if its plugin came up, the sender to call.
pub enum RecipientSlot {
    Ready {
        recipient: Recipient,
        sender: Arc<dyn RecipientSender>,
    },
    Broken {
        recipient: Recipient,
        cause: String,
    },
}

impl RecipientSlot {
    pub fn recipient(&self) -> &Recipient {
        match self {
            RecipientSlot::Ready { recipient, .. } | RecipientSlot::Broken { recipient, .. } => {
                recipient
            }
        }
    }

    /// The recipient's own flag wins; otherwise the plugin decides. A broken
    /// plugin cannot answer, so its failures are kept.
    pub fn ack_required(&self) -> bool {
        match self {
            RecipientSlot::Ready { recipient, sender } => recipient
                .ack_required
                .unwrap_or_else(|| sender.is_ack_required()),
            RecipientSlot::Broken { recipient, .. } => recipient.ack_required.unwrap_or(true),
        }
    }
}

impl fmt::Debug for RecipientSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientSlot::Ready { recipient, .. } => {
                f.debug_struct("Ready").field("recipient", recipient).finish()
            }
            RecipientSlot::Broken { recipient, cause } => f
                .debug_struct("Broken")
                .field("recipient", recipient)
                .field("cause", cause)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Matcher,
    Sender,
}

/// A rule or recipient whose plugin failed to instantiate.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenPlugin {
    pub kind: PluginKind,
    pub owner_id: Uuid,
    pub label: String,
    pub plugin_id: String,
    pub cause: String,
}

/// Snapshot of one tenant's configuration with plugins instantiated.
#[derive(Debug, Default)]
pub struct TenantRules {
    pub rules: Vec<ActiveRule>,
    pub recipients: HashMap<RecipientId, RecipientSlot>,
    pub broken: Vec<BrokenPlugin>,
}

impl TenantRules {
    pub fn recipient(&self, recipient_id: &RecipientId) -> Option<&RecipientSlot> {
        self.recipients.get(recipient_id)
    }
}

struct CachedRules {
    rules: Arc<TenantRules>,
    built_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TenantId, CachedRules>,
    generations: HashMap<TenantId, u64>,
}

/// Tenant-keyed cache of active rules, rebuilt lazily after invalidation.
///
/// Readers get an `Arc` snapshot; a rebuild swaps the whole entry. A build
/// that raced with an invalidation is served once but not cached. With a
/// max age, entries also expire so that configuration written by another
/// process is picked up.
pub struct RuleCache {
    store: Arc<dyn NotifierStore>,
    registry: PluginRegistry,
    max_age: Option<Duration>,
    state: RwLock<CacheState>,
}

impl RuleCache {
    pub fn new(store: Arc<dyn NotifierStore>, registry: PluginRegistry) -> Self {
        Self {
            store,
            registry,
            max_age: None,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn is_fresh(&self, entry: &CachedRules) -> bool {
        self.max_age
            .is_none_or(|max_age| entry.built_at.elapsed() < max_age)
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub async fn active_rules(&self, tenant: &TenantId) -> Result<Arc<TenantRules>, StoreError> {
        let generation = {
            let state = self.state.read().await;
            if let Some(entry) = state.entries.get(tenant) {
                if self.is_fresh(entry) {
                    return Ok(entry.rules.clone());
                }
                debug!(tenant = %tenant, "Rule cache entry expired");
            }
            state.generations.get(tenant).copied().unwrap_or_default()
        };

        let built_at = Instant::now();
        let built = Arc::new(self.build(tenant).await?);

        let mut state = self.state.write().await;
        let current = state.generations.get(tenant).copied().unwrap_or_default();
        if current == generation {
            state.entries.insert(
                tenant.clone(),
                CachedRules {
                    rules: built.clone(),
                    built_at,
                },
            );
        } else {
            debug!(tenant = %tenant, "Configuration changed during rule cache build, not caching");
        }

        Ok(built)
    }

    pub async fn invalidate(&self, tenant: &TenantId) {
        let mut state = self.state.write().await;
        state.entries.remove(tenant);
        *state.generations.entry(tenant.clone()).or_default() += 1;

        debug!(tenant = %tenant, "Rule cache invalidated");
    }

    pub async fn on_rule_changed(&self, tenant: &TenantId, rule_id: Uuid) {
        debug!(tenant = %tenant, rule_id = %rule_id, "Rule changed");
        self.invalidate(tenant).await;
    }

    pub async fn on_recipient_changed(&self, tenant: &TenantId, recipient_id: RecipientId) {
        debug!(tenant = %tenant, recipient_id = %recipient_id, "Recipient changed");
        self.invalidate(tenant).await;
    }

    pub async fn is_cached(&self, tenant: &TenantId) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(tenant)
            .is_some_and(|entry| self.is_fresh(entry))
    }

    async fn build(&self, tenant: &TenantId) -> Result<TenantRules, StoreError> {
        let rules = self.store.list_rules(tenant).await?;
        let recipients = self.store.list_recipients(tenant).await?;
        let mut built = TenantRules::default();

        for recipient in recipients {
            let slot = match self.registry.sender(&recipient.sender, &recipient.label) {
                Ok(sender) => RecipientSlot::Ready { recipient, sender },
                Err(e) => {
                    built.broken.push(BrokenPlugin {
                        kind: PluginKind::Sender,
                        owner_id: recipient.id,
                        label: recipient.label.clone(),
                        plugin_id: recipient.sender.plugin_id.clone(),
                        cause: e.to_string(),
                    });
                    RecipientSlot::Broken {
                        recipient,
                        cause: e.to_string(),
                    }
                }
            };
            built.recipients.insert(slot.recipient().id, slot);
        }

        for rule in rules.into_iter().filter(|rule| rule.active) {
            match self.registry.matcher(&rule.matcher) {
                Ok(matcher) => built.rules.push(ActiveRule { rule, matcher }),
                Err(e) => built.broken.push(BrokenPlugin {
                    kind: PluginKind::Matcher,
                    owner_id: rule.id,
                    label: rule.label.clone(),
                    plugin_id: rule.matcher.plugin_id.clone(),
                    cause: e.to_string(),
                }),
            }
        }

        info!(
            tenant = %tenant,
            rules = built.rules.len(),
            recipients = built.recipients.len(),
            broken = built.broken.len(),
            "Rule cache built"
        );

        Ok(built)
    }
}
