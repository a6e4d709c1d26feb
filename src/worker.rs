//! The consuming worker.
//!
//! One consumer, prefetch 1: the broker hands over a single
//! unacknowledged message at a time and the dispatcher runs it to
//! completion before the next arrives.  The ack/nack decision is made
//! here, centrally, from the dispatcher's result: success acknowledges,
//! failure rejects without requeueing so an operator decides whether to
//! republish.  Retries are never expressed through broker redelivery;
//! they go through the delay queue.

use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use tracing::{error, info};

use crate::handlers::Dispatcher;
use crate::queue::{Broker, MAIN_QUEUE, QueueError};

//------------ Worker --------------------------------------------------------

pub struct Worker {
    broker: Arc<Broker>,
    dispatcher: Dispatcher,
}

impl Worker {
    pub fn new(broker: Arc<Broker>, dispatcher: Dispatcher) -> Self {
        Self { broker, dispatcher }
    }

    /// Consume the main queue until the channel closes or the caller
    /// drops this future on shutdown.  Dropping it mid-message leaves the
    /// delivery unacked; the broker hands it to the next worker and the
    /// handlers' field-level overwrites make the redelivery harmless.
    pub async fn run(&self) -> Result<(), QueueError> {
        let mut consumer = self
            .broker
            .channel()
            .basic_consume(
                MAIN_QUEUE,
                "sifend",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("waiting for lifecycle messages on '{MAIN_QUEUE}'");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            match self.dispatcher.dispatch(&delivery.data).await {
                Ok(()) => {
                    delivery.ack(BasicAckOptions::default()).await?;
                }
                Err(err) => {
                    error!("handler failed, message left for operator review: {err}");
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}
