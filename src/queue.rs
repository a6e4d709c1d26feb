//! Broker topology, the delay-requeue scheduler and the publisher API.
//!
//! RabbitMQ has no native deliver-after-T primitive, so deferred polling
//! is assembled from two standard features: the delay queue holds every
//! message for its TTL and then dead-letters it into a direct exchange,
//! which routes it back onto the main queue where the worker picks it up.
//! Both queues are durable and every message is persistent, so a broker
//! restart loses nothing.

use std::fmt;

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::json;
use tracing::info;

use crate::message::MIN_REASON_LEN;
use crate::store::FiscalDocumentId;

/// The queue the worker consumes.
pub const MAIN_QUEUE: &str = "faturas_para_processar";

/// The TTL queue nothing consumes; expired messages dead-letter back.
pub const DELAY_QUEUE: &str = "faturas_wait_30s";

/// The dead-letter exchange bridging the delay queue to the main queue.
pub const DLX_EXCHANGE: &str = "faturas_dlx";

/// The routing key binding the main queue to the exchange.
pub const DELAY_ROUTING_KEY: &str = "faturas_routing_key";

/// Messages survive a broker restart.
const PERSISTENT: u8 = 2;

//------------ Broker --------------------------------------------------------

/// The worker's broker connection, topology declared.
pub struct Broker {
    connection: Connection,
    channel: Channel,
}

impl Broker {
    /// Connect, declare the topology and set the prefetch window.
    pub async fn connect(
        amqp_url: &str,
        delay_ttl_ms: u32,
        prefetch_count: u16,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(amqp_url, connection_properties())
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;

        declare_topology(&channel, delay_ttl_ms).await?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(QueueError::from)?;

        info!(
            "broker topology ready; delay {delay_ttl_ms} ms, prefetch {prefetch_count}"
        );
        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Close channel and connection; in-flight deliveries stay unacked
    /// and will be redelivered.
    pub async fn close(&self) {
        let _ = self.channel.close(200, "shutting down").await;
        let _ = self.connection.close(200, "shutting down").await;
    }
}

/// Run lapin's internals on the ambient tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// Declare exchange and queues; safe to repeat on every startup.
async fn declare_topology(channel: &Channel, delay_ttl_ms: u32) -> Result<(), QueueError> {
    channel
        .exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            MAIN_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            MAIN_QUEUE,
            DLX_EXCHANGE,
            DELAY_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongUInt(delay_ttl_ms));
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from(DLX_EXCHANGE)),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(LongString::from(DELAY_ROUTING_KEY)),
    );
    channel
        .queue_declare(
            DELAY_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

    Ok(())
}

async fn publish(
    channel: &Channel,
    queue: &str,
    body: Vec<u8>,
) -> Result<(), QueueError> {
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default().with_delivery_mode(PERSISTENT),
        )
        .await?
        .await?;
    Ok(())
}

//------------ PollScheduler -------------------------------------------------

/// The seam handlers use to defer a poll.
#[async_trait]
pub trait PollScheduler: Send + Sync {
    /// Park a poll request in the delay queue; after the TTL it arrives
    /// on the main queue carrying the given attempt counter.
    async fn schedule_poll(
        &self,
        id: FiscalDocumentId,
        attempts: u32,
    ) -> Result<(), QueueError>;
}

#[async_trait]
impl PollScheduler for Broker {
    async fn schedule_poll(
        &self,
        id: FiscalDocumentId,
        attempts: u32,
    ) -> Result<(), QueueError> {
        let body = json!({
            "id_fatura": id,
            "acao": "consultar",
            "tentativas": attempts,
        });
        publish(&self.channel, DELAY_QUEUE, body.to_string().into_bytes()).await?;
        info!("document {id}: poll #{attempts} parked in the delay queue");
        Ok(())
    }
}

//------------ Publisher -----------------------------------------------------

/// The front door upstream systems use to request lifecycle actions.
///
/// Each call opens its own short-lived connection, ensures the durable
/// main queue exists, publishes one persistent message and disconnects.
#[derive(Clone, Debug)]
pub struct Publisher {
    amqp_url: String,
}

impl Publisher {
    pub fn new(amqp_url: impl Into<String>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
        }
    }

    /// Request submission of a document batch.
    pub async fn submit(&self, id: FiscalDocumentId) -> Result<(), PublishError> {
        self.publish_to_main(json!({ "id_fatura": id }).to_string())
            .await?;
        info!("document {id}: submission requested");
        Ok(())
    }

    /// Request a fresh status poll, restarting the attempt chain.
    pub async fn poll(&self, id: FiscalDocumentId) -> Result<(), PublishError> {
        self.publish_to_main(
            json!({ "id_fatura": id, "acao": "consultar", "tentativas": 1 }).to_string(),
        )
        .await?;
        info!("document {id}: status poll requested");
        Ok(())
    }

    /// Request cancellation of an approved document.
    ///
    /// The reason is validated before any broker activity.
    pub async fn cancel(
        &self,
        id: FiscalDocumentId,
        reason: &str,
    ) -> Result<(), PublishError> {
        if reason.trim().chars().count() < MIN_REASON_LEN {
            return Err(PublishError::InvalidReason);
        }
        self.publish_to_main(
            json!({ "id_fatura": id, "acao": "cancelar", "motivo": reason }).to_string(),
        )
        .await?;
        info!("document {id}: cancellation requested");
        Ok(())
    }

    async fn publish_to_main(&self, body: String) -> Result<(), QueueError> {
        let connection = Connection::connect(&self.amqp_url, connection_properties())
            .await
            .map_err(|err| QueueError::Connect(err.to_string()))?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                MAIN_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let result = publish(&channel, MAIN_QUEUE, body.into_bytes()).await;
        let _ = connection.close(200, "done").await;
        result
    }
}

//------------ QueueError / PublishError -------------------------------------

/// The broker could not be reached or refused an operation.
#[derive(Clone, Debug)]
pub enum QueueError {
    Connect(String),
    Broker(String),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

impl std::error::Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "cannot reach the broker: {reason}"),
            Self::Broker(reason) => write!(f, "broker operation failed: {reason}"),
        }
    }
}

/// A publish request was rejected.
#[derive(Clone, Debug)]
pub enum PublishError {
    /// The cancellation reason does not meet the minimum length.
    InvalidReason,

    /// The broker could not be reached.
    Queue(QueueError),
}

impl From<QueueError> for PublishError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl std::error::Error for PublishError {}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidReason => write!(
                f,
                "a cancellation reason of at least {MIN_REASON_LEN} characters is required"
            ),
            Self::Queue(err) => err.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Publisher;
    use super::PublishError;

    #[tokio::test]
    async fn short_reason_is_rejected_before_any_broker_activity() {
        // The URL is unresolvable; reaching the broker would fail loudly,
        // so an InvalidReason here proves validation came first.
        let publisher = Publisher::new("amqp://unreachable.invalid:5672/%2f");
        match publisher.cancel(7, "foo").await {
            Err(PublishError::InvalidReason) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
