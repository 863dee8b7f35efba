//! RabbitMQ transport via lapin.

use async_trait::async_trait;
use futures::StreamExt as _;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use super::{Acknowledger, Broker, Delivery, DeliveryStream};
use crate::error::{Error, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode, so messages survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// One connection and one channel to a RabbitMQ broker.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    /// Dial the broker and open a channel in publisher-confirm mode.
    ///
    /// If the channel cannot be set up the connection is closed again.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let channel = match open_confirmed_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                let closed = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "failed to close connection");
                }
                return Err(e);
            }
        };

        debug!(channel_id = channel.id(), "amqp channel opened");
        Ok(Self {
            connection,
            channel,
        })
    }
}

async fn open_confirmed_channel(connection: &Connection) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| Error::Connection(format!("failed to create channel: {e}")))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| Error::Connection(format!("failed to enable publisher confirms: {e}")))?;
    Ok(channel)
}

/// Only a broker ack counts as a successful publish.
fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(Error::Publish("broker rejected the message".to_string())),
        Confirmation::NotRequested => Err(Error::Publish(
            "publisher confirms are not enabled on the channel".to_string(),
        )),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };

        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::Declaration {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, queue: &str, payload: &[u8], content_type: &str) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type.to_string()))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        let confirmation = confirm.await.map_err(|e| Error::Publish(e.to_string()))?;
        check_confirmation(confirmation)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive: false,
            nowait: false,
        };

        let consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?;

        debug!(consumer_tag = ?consumer.tag(), queue, "amqp consumer opened");

        let deliveries = consumer.map(|item| match item {
            Ok(delivery) => Ok(Delivery::new(
                delivery.data,
                delivery.delivery_tag,
                delivery.redelivered,
                Box::new(AmqpAcker(delivery.acker)),
            )),
            Err(e) => Err(Error::Subscription(e.to_string())),
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "client closing")
                .await
                .map_err(|e| Error::Other(format!("failed to close channel: {e}")))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "client closing")
                .await
                .map_err(|e| Error::Other(format!("failed to close connection: {e}")))?;
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| Error::Acknowledgement(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| Error::Acknowledgement(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_ack_confirms_the_publish() {
        assert!(check_confirmation(Confirmation::Ack(None)).is_ok());
    }

    #[test]
    fn broker_nack_fails_the_publish() {
        let err = check_confirmation(Confirmation::Nack(None)).unwrap_err();
        assert!(matches!(err, Error::Publish(ref reason) if reason.contains("rejected")));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_confirm_mode_fails_the_publish() {
        let err = check_confirmation(Confirmation::NotRequested).unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }
}
