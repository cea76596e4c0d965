use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::{debug, info};

use crate::{
    clients::publisher::StatusPublisher,
    config::Config,
    models::{retry::RetryConfig, status::NotifierEvent},
    utils::retry_with_backoff,
};

pub struct RabbitMqClient {
    // Dropping the connection closes every channel opened on it.
    _connection: Connection,
    channel: Channel,
    intake_queue_name: String,
    status_queue_name: String,
    retry_config: RetryConfig,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|_| anyhow!("Failed to connect to RabbitMQ"))?;

        info!("RabbitMQ connection established");

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        debug!(prefetch_count = config.prefetch_count, "Prefetch count set");

        for queue in [&config.intake_queue_name, &config.status_queue_name] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|_| anyhow!("Failed to declare queue {}", queue))?;

            debug!(queue = %queue, "Queue declared");
        }

        Ok(Self {
            _connection: connection,
            channel,
            intake_queue_name: config.intake_queue_name.clone(),
            status_queue_name: config.status_queue_name.clone(),
            retry_config: config.retry_config(),
        })
    }

    /// Channel shared with the `amqp` sender plugin.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.intake_queue_name,
                "notifier_intake",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to create consumer"))?;

        info!(queue = %self.intake_queue_name, "Consumer created for intake queue");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to acknowledge message"))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|_| anyhow!("Failed to reject message"))?;

        Ok(())
    }
}

#[async_trait]
impl StatusPublisher for RabbitMqClient {
    async fn publish(&self, events: &[NotifierEvent]) -> Result<()> {
        for event in events {
            let payload = serde_json::to_vec(event)?;

            retry_with_backoff(&self.retry_config, || {
                let channel = self.channel.clone();
                let queue = self.status_queue_name.clone();
                let payload = payload.clone();

                async move {
                    channel
                        .basic_publish(
                            "",
                            &queue,
                            BasicPublishOptions::default(),
                            &payload,
                            BasicProperties::default()
                                .with_delivery_mode(2)
                                .with_content_type("application/json".into()),
                        )
                        .await
                        .map_err(|e| e.to_string())?
                        .await
                        .map_err(|e| e.to_string())?;

                    Ok::<(), String>(())
                }
            })
            .await
            .map_err(|e| anyhow!("Failed to publish notifier event: {}", e))?;
        }

        debug!(count = events.len(), "Notifier events published");
        Ok(())
    }
}
