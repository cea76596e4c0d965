#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use notifier_service::{
    clients::{
        lock::{InMemoryLock, LeaseLock},
        memory::InMemoryStore,
        publisher::StatusPublisher,
        store::RequestStore,
    },
    models::{
        request::{ActionKind, NotificationRequest, RawEvent},
        retry::RetryConfig,
        rule::{PluginConfiguration, Recipient, Rule},
        status::{NotificationStatus, NotifierEvent},
        tenant::TenantId,
    },
    plugins::{PluginError, PluginParameters, PluginRegistry, RecipientSender, SendFailure},
    services::{
        configuration::ConfigurationService,
        dispatch::{DispatchEngine, DispatchSettings},
        matching::MatchingEngine,
        registration::RegistrationService,
        rule_cache::RuleCache,
        scheduler::{Scheduler, SchedulerConfig, TaskSettings},
    },
};
use serde_json::{Value as JsonValue, json};

pub const SCRIPTED: &str = "scripted";

/// What a scripted recipient does with its next batches.
#[derive(Debug, Clone, Default)]
pub enum Behaviour {
    #[default]
    Deliver,
    /// Reports every request of the batch as failed.
    RejectAll(String),
    /// Returns a plugin error.
    Crash(String),
    /// Sleeps before delivering.
    Stall(Duration),
}

#[derive(Debug, Default)]
pub struct SenderScript {
    behaviour: Mutex<Behaviour>,
    calls: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl SenderScript {
    pub fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// External request ids, one entry per successful delivery.
    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

/// Scripts shared between the test and the sender instances the registry builds, keyed by recipient label.
#[derive(Clone, Default)]
pub struct Scripts(Arc<Mutex<HashMap<String, Arc<SenderScript>>>>);

impl Scripts {
    pub fn get(&self, label: &str) -> Arc<SenderScript> {
        self.0
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .clone()
    }
}

struct ScriptedSender {
    label: String,
    script: Arc<SenderScript>,
    ack_required: bool,
    direct: bool,
}

#[async_trait]
impl RecipientSender for ScriptedSender {
    async fn send(&self, requests: &[NotificationRequest]) -> Result<Vec<SendFailure>, PluginError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.script.behaviour.lock().unwrap().clone();

        match behaviour {
            Behaviour::Deliver => {}
            Behaviour::RejectAll(cause) => {
                return Ok(requests
                    .iter()
                    .map(|request| SendFailure::new(request.id, cause.clone()))
                    .collect());
            }
            Behaviour::Crash(cause) => return Err(PluginError::Delivery(cause)),
            Behaviour::Stall(delay) => tokio::time::sleep(delay).await,
        }

        self.script
            .delivered
            .lock()
            .unwrap()
            .extend(requests.iter().map(|request| request.request_id.clone()));
        Ok(Vec::new())
    }

    fn is_ack_required(&self) -> bool {
        self.ack_required
    }

    fn accepts_direct_notifications(&self) -> bool {
        self.direct
    }

    fn label(&self) -> &str {
        &self.label
    }
}

pub fn scripted_registry(scripts: &Scripts) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtin();
    let scripts = scripts.clone();

    registry.register_sender(SCRIPTED, move |parameters: &PluginParameters<'_>, label: &str| {
        Ok(Arc::new(ScriptedSender {
            label: label.to_string(),
            script: scripts.get(label),
            ack_required: parameters.optional_bool("ack_required")?.unwrap_or(true),
            direct: parameters.optional_bool("direct")?.unwrap_or(false),
        }) as Arc<dyn RecipientSender>)
    });

    registry
}

/// Keeps every published event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, status: NotificationStatus) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.status == status)
            .count()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, events: &[NotifierEvent]) -> Result<()> {
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

pub fn test_settings() -> DispatchSettings {
    DispatchSettings {
        max_bulk_size: 100,
        worker_concurrency: 4,
        sender_timeout: Duration::from_millis(200),
        stale_job_after: Duration::from_secs(60),
        job_retention: Duration::from_secs(3600),
    }
}

pub fn fast_scheduler_config() -> SchedulerConfig {
    let settings = TaskSettings {
        delay: Duration::from_millis(10),
        lock_ttl: Duration::from_secs(5),
    };
    SchedulerConfig {
        matching: settings,
        dispatch: settings,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2,
        },
    }
}

/// Every service wired over the in-memory store for one tenant.
pub struct Harness {
    pub tenant: TenantId,
    pub store: Arc<InMemoryStore>,
    pub lock: Arc<InMemoryLock>,
    pub publisher: Arc<RecordingPublisher>,
    pub scripts: Scripts,
    pub cache: Arc<RuleCache>,
    pub registration: Arc<RegistrationService>,
    pub matching: Arc<MatchingEngine>,
    pub dispatch: Arc<DispatchEngine>,
    pub configuration: Arc<ConfigurationService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: DispatchSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let scripts = Scripts::default();
        let max_bulk_size = settings.max_bulk_size;

        let cache = Arc::new(RuleCache::new(store.clone(), scripted_registry(&scripts)));

        Self {
            tenant: TenantId::parse("project-a").unwrap(),
            lock: Arc::new(InMemoryLock::new()),
            registration: Arc::new(RegistrationService::new(
                store.clone(),
                cache.clone(),
                publisher.clone(),
                max_bulk_size,
            )),
            matching: Arc::new(MatchingEngine::new(
                store.clone(),
                cache.clone(),
                publisher.clone(),
                max_bulk_size,
            )),
            dispatch: Arc::new(DispatchEngine::new(
                store.clone(),
                cache.clone(),
                publisher.clone(),
                settings,
            )),
            configuration: Arc::new(ConfigurationService::new(store.clone(), cache.clone())),
            store,
            publisher,
            scripts,
            cache,
        }
    }

    pub fn scheduler(&self, lock: Arc<dyn LeaseLock>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            self.matching.clone(),
            self.dispatch.clone(),
            lock,
            fast_scheduler_config(),
        ))
    }

    /// An active rule with the built-in `always` matcher.
    pub async fn always_rule(&self, label: &str) -> Result<Rule> {
        self.rule(label, PluginConfiguration::new("always")).await
    }

    pub async fn rule(&self, label: &str, matcher: PluginConfiguration) -> Result<Rule> {
        Ok(self
            .configuration
            .create_rule(&self.tenant, Rule::new(label, matcher))
            .await?)
    }

    /// A scripted recipient owned by `rule`, driven by `self.scripts.get(label)`.
    pub async fn recipient(&self, rule: &Rule, label: &str) -> Result<Recipient> {
        self.recipient_with(rule, label, PluginConfiguration::new(SCRIPTED))
            .await
    }

    pub async fn recipient_with(
        &self,
        rule: &Rule,
        label: &str,
        sender: PluginConfiguration,
    ) -> Result<Recipient> {
        Ok(self
            .configuration
            .create_recipient(&self.tenant, Recipient::new(rule.id, label, sender))
            .await?)
    }

    pub async fn register_events(&self, count: usize) -> Result<()> {
        let events = (0..count).map(|i| event(json!({ "index": i }))).collect();
        self.registration.register(&self.tenant, events).await?;
        Ok(())
    }

    pub async fn requests_left(&self) -> Result<usize> {
        Ok(self.store.count_requests(&self.tenant, None).await?)
    }

    pub async fn errors_left(&self) -> Result<usize> {
        Ok(self
            .store
            .list_recipient_errors(&self.tenant, None)
            .await?
            .len())
    }
}

pub fn event(payload: JsonValue) -> RawEvent {
    RawEvent::new(ActionKind::Create, payload)
}
