//! AMQP broker connection
//!
//! Declares both queues non-durable, consumes from the inbound queue with
//! manual acknowledgement and publishes to the outbound queue through the
//! default exchange.

use super::{InboundMessage, MessageBroker};
use crate::config::BrokerConfig;
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use uuid::Uuid;

pub struct AmqpBroker {
    _connection: Connection,
    channel: Channel,
    consumer: Consumer,
    outbound_queue: String,
}

impl AmqpBroker {
    /// Connect, declare queues and start consuming
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let uri = config.uri();
        tracing::info!("Connecting to broker at {}", config.host);

        let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        for queue in [&config.inbound_queue, &config.outbound_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: false,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        if let Some(prefetch) = config.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        let consumer_tag = format!("hopscope-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &config.inbound_queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            "Consuming from {} as {}, publishing to {}",
            config.inbound_queue,
            consumer_tag,
            config.outbound_queue
        );

        Ok(Self {
            _connection: connection,
            channel,
            consumer,
            outbound_queue: config.outbound_queue.clone(),
        })
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        match self.consumer.next().await {
            Some(delivery) => {
                let delivery = delivery?;
                Ok(Some(InboundMessage {
                    body: delivery.data,
                    delivery_tag: delivery.delivery_tag,
                }))
            }
            None => Ok(None),
        }
    }

    async fn publish(&mut self, payload: Vec<u8>) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.outbound_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<()> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }
}
