use std::sync::Arc;

use anyhow::{Error, Result};
use notifier_service::{
    api::{AppState, run_api_server},
    clients::{
        database::PostgresStore,
        health::HealthChecker,
        lock::{InMemoryLock, LeaseLock},
        memory::InMemoryStore,
        publisher::{LogPublisher, StatusPublisher},
        rbmq::RabbitMqClient,
        redis::RedisLock,
        store::NotifierStore,
    },
    config::{Config, StoreBackend},
    plugins::{PluginRegistry, senders},
    services::{
        configuration::ConfigurationService,
        dispatch::{DispatchEngine, DispatchSettings},
        intake::IntakeWorker,
        matching::MatchingEngine,
        registration::RegistrationService,
        rule_cache::RuleCache,
        scheduler::{Scheduler, SchedulerConfig},
    },
    utils::init_tracing,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    let tenants = config.tenant_ids()?;
    info!(
        tenants = ?tenants.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        backend = ?config.store_backend,
        "Starting notifier service"
    );

    let store: Arc<dyn NotifierStore>;
    let lock: Arc<dyn LeaseLock>;
    match config.store_backend {
        StoreBackend::Postgres => {
            store = Arc::new(PostgresStore::connect(&config.database_url).await?);
            lock = Arc::new(RedisLock::connect(&config.redis_url).await?);
        }
        StoreBackend::Memory => {
            warn!("Running on the in-memory store, state is lost on restart");
            store = Arc::new(InMemoryStore::new());
            lock = Arc::new(InMemoryLock::new());
        }
    }

    let rbmq = if config.rabbitmq_url.trim().is_empty() {
        warn!("No RABBITMQ_URL set, intake disabled and status events only logged");
        None
    } else {
        Some(Arc::new(RabbitMqClient::connect(&config).await?))
    };

    let mut registry = PluginRegistry::with_builtin();
    let publisher: Arc<dyn StatusPublisher> = match &rbmq {
        Some(rbmq) => {
            registry.register_sender(senders::AMQP, senders::AmqpSender::factory(rbmq.channel()));
            rbmq.clone() as Arc<dyn StatusPublisher>
        }
        None => Arc::new(LogPublisher),
    };

    let cache = Arc::new(
        RuleCache::new(store.clone(), registry).with_max_age(config.rule_cache_ttl()),
    );
    let configuration = Arc::new(ConfigurationService::new(store.clone(), cache.clone()));
    let registration = Arc::new(RegistrationService::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config.max_bulk_size,
    ));
    let matching = Arc::new(MatchingEngine::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config.max_bulk_size,
    ));
    let dispatch = Arc::new(DispatchEngine::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        DispatchSettings::from_config(&config),
    ));

    let scheduler = Arc::new(Scheduler::new(
        matching,
        dispatch,
        lock.clone(),
        SchedulerConfig::from_config(&config),
    ));
    let scheduler_handle = scheduler.clone().spawn(&tenants);

    if let Some(rbmq) = &rbmq {
        let consumer = rbmq.create_consumer().await?;
        let worker = IntakeWorker::new(
            rbmq.clone(),
            registration,
            &tenants,
            config.max_bulk_size,
            config.intake_flush_interval(),
        );

        tokio::spawn(async move {
            if let Err(e) = worker.run(consumer).await {
                error!(error = %e, "Intake worker stopped");
            }
        });
    }

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(store, lock, rbmq.clone()),
        scheduler,
        configuration,
    });
    let port = config.server_port;

    tokio::spawn(async move {
        if let Err(e) = run_api_server(state, port).await {
            error!(error = %e, "API server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler_handle.close().await;
    info!("Notifier service stopped");

    Ok(())
}
