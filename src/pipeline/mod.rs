// Message pipeline: consume flow records, enrich, publish, acknowledge

pub mod amqp;
mod envelope;

pub use amqp::AmqpBroker;
pub use envelope::{Envelope, BOOKKEEPING_FIELDS};

use crate::error::{HopscopeError, Result};
use crate::flow::FlowEnricher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One message taken from the inbound queue
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

/// Queue connection used by the driver
#[async_trait]
pub trait MessageBroker: Send {
    /// Next inbound message, `None` once the consumer is closed
    async fn next_message(&mut self) -> Result<Option<InboundMessage>>;

    /// Publish a payload to the outbound queue
    async fn publish(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn ack(&mut self, message: &InboundMessage) -> Result<()>;
}

/// When to publish relative to hop discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    /// Publish whatever routes are known right now
    Snapshot,
    /// Wait for the trace to finish (bounded by the publish wait)
    AwaitTrace,
}

/// Counters reported when the driver stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub received: u64,
    pub published: u64,
    pub rejected: u64,
}

/// Consumes flow messages one at a time
pub struct PipelineDriver {
    enricher: Arc<FlowEnricher>,
    publish_mode: PublishMode,
    publish_wait: Duration,
    stats: DriverStats,
}

impl PipelineDriver {
    pub fn new(enricher: Arc<FlowEnricher>, publish_mode: PublishMode, publish_wait: Duration) -> Self {
        Self {
            enricher,
            publish_mode,
            publish_wait,
            stats: DriverStats::default(),
        }
    }

    /// Turn one inbound body into the outbound payload
    ///
    /// Returns [`HopscopeError::MalformedMessage`] for bodies that are not
    /// flow records.
    pub async fn process(&self, body: &[u8]) -> Result<Vec<u8>> {
        let envelope = Envelope::parse(body)?;
        let flow = self.enricher.enrich(&envelope.record);

        if self.publish_mode == PublishMode::AwaitTrace
            && tokio::time::timeout(self.publish_wait, flow.wait_for_trace())
                .await
                .is_err()
        {
            tracing::debug!(
                "Trace for {} still running after {:?}, publishing partial routes",
                envelope.record.in_ip,
                self.publish_wait
            );
        }

        let snapshot = flow.snapshot_for(&envelope.record);
        let merged = envelope.merge(&snapshot)?;
        serde_json::to_vec(&merged).map_err(|e| HopscopeError::Json {
            source: e,
            context: "Failed to serialize outbound message".to_string(),
        })
    }

    /// Process, publish and acknowledge a single message
    ///
    /// Malformed messages are acknowledged without publishing so they cannot
    /// loop back into the queue.
    pub async fn handle<B: MessageBroker + ?Sized>(
        &mut self,
        broker: &mut B,
        message: InboundMessage,
    ) -> Result<()> {
        self.stats.received += 1;

        match self.process(&message.body).await {
            Ok(payload) => {
                broker.publish(payload).await?;
                self.stats.published += 1;
            }
            Err(HopscopeError::MalformedMessage(reason)) => {
                tracing::warn!(
                    "Dropping malformed message {}: {}",
                    message.delivery_tag,
                    reason
                );
                self.stats.rejected += 1;
            }
            Err(e) => return Err(e),
        }

        broker.ack(&message).await
    }

    /// Run until `shutdown` resolves or the inbound stream ends
    pub async fn run<B, S>(&mut self, broker: &mut B, shutdown: S) -> Result<DriverStats>
    where
        B: MessageBroker + ?Sized,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("Pipeline consuming");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = broker.next_message() => match next? {
                    Some(message) => self.handle(broker, message).await?,
                    None => {
                        tracing::info!("Inbound stream closed");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "Pipeline stopped: {} received, {} published, {} rejected",
            self.stats.received,
            self.stats.published,
            self.stats.rejected
        );

        Ok(self.stats)
    }
}
