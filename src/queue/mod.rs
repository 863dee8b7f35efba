//! Durable queue client with manual acknowledgment.
//!
//! [`QueueClient`] publishes protobuf messages to a single declared queue and
//! runs a delivery loop that hands each payload to a [`MessageHandler`],
//! acking on success and nacking on failure. The transport sits behind the
//! [`Broker`] trait: [`amqp::AmqpBroker`] talks to RabbitMQ,
//! [`memory::InMemoryBroker`] keeps everything in-process.

pub mod amqp;
pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use opentelemetry::KeyValue;
use secrecy::ExposeSecret as _;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::QueueConfig;
use crate::config::secrets::redact_url;
use crate::error::{Error, Result};
use crate::model::wire::CONTENT_TYPE;
use crate::telemetry::{metrics, spans};

/// Stream of deliveries from a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Transport operations the queue client needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Send one message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8], content_type: &str) -> Result<()>;

    /// Open a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Release channel and connection resources.
    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer.
///
/// Settling consumes the delivery, so it is acked or nacked at most once.
pub struct Delivery {
    payload: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Remove the message from the queue for good.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message; with `requeue` it goes back on the queue.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// How a failed delivery is nacked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Every handler error requeues the message.
    #[default]
    Always,
    /// Transient errors requeue; permanent ones are rejected without
    /// requeue so a dead-letter exchange bound to the queue can take them.
    DeadLetterPermanent,
}

impl RequeuePolicy {
    pub fn should_requeue(self, error: &Error) -> bool {
        match self {
            RequeuePolicy::Always => true,
            RequeuePolicy::DeadLetterPermanent => error.is_transient(),
        }
    }
}

impl std::str::FromStr for RequeuePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(RequeuePolicy::Always),
            "dead-letter-permanent" => Ok(RequeuePolicy::DeadLetterPermanent),
            other => Err(Error::Config(format!("unknown requeue policy: {other}"))),
        }
    }
}

/// Consumer-side callback invoked once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()>;
}

/// Publishes to and consumes from one durable queue.
///
/// Shared by reference across workers; publishes are serialized internally.
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    queue: String,
    requeue_policy: RequeuePolicy,
    publish_lock: Mutex<()>,
    shutdown: CancellationToken,
    consumers: TaskTracker,
    closed: AtomicBool,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("queue", &self.queue)
            .field("requeue_policy", &self.requeue_policy)
            .finish_non_exhaustive()
    }
}

impl QueueClient {
    /// Connect to RabbitMQ and declare the configured queue.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let url = config.url.expose_secret();
        debug!(url = %redact_url(url), queue = %config.queue_name, "connecting to broker");

        let broker = amqp::AmqpBroker::connect(url).await?;
        Self::open(Arc::new(broker), &config.queue_name, config.requeue_policy).await
    }

    /// Declare `queue` on an already connected broker.
    ///
    /// If the declaration fails the broker is closed before returning.
    pub async fn open(
        broker: Arc<dyn Broker>,
        queue: &str,
        requeue_policy: RequeuePolicy,
    ) -> Result<Self> {
        if let Err(e) = broker.declare_queue(queue).await {
            if let Err(close_err) = broker.close().await {
                warn!(error = %close_err, "failed to close broker after declaration failure");
            }
            return Err(e);
        }

        info!(queue, ?requeue_policy, "queue declared");

        Ok(Self {
            broker,
            queue: queue.to_string(),
            requeue_policy,
            publish_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            consumers: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Encode `message` and publish it. No retry on failure.
    pub async fn publish<M: prost::Message>(&self, message: &M) -> Result<()> {
        self.publish_bytes(&message.encode_to_vec()).await
    }

    /// Publish an already encoded payload.
    pub async fn publish_bytes(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Publish("queue client is closed".to_string()));
        }

        let result = {
            let _guard = self.publish_lock.lock().await;
            self.broker.publish(&self.queue, payload, CONTENT_TYPE).await
        };

        metrics::messages_published().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );

        result
    }

    /// Open a manual-ack consumer and start the delivery loop.
    ///
    /// `cancel` is passed to every handler call. It does not stop the loop;
    /// only [`QueueClient::close`] does.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Subscription("queue client is closed".to_string()));
        }

        let stream = self.broker.consume(&self.queue).await?;

        let delivery_loop = DeliveryLoop {
            queue: self.queue.clone(),
            handler,
            requeue_policy: self.requeue_policy,
            cancel,
            shutdown: self.shutdown.clone(),
        };
        self.consumers.spawn(delivery_loop.run(stream));

        info!(queue = %self.queue, "consumer started");
        Ok(())
    }

    /// Stop consuming and release broker resources.
    ///
    /// Waits for an in-flight handler to finish and settle its delivery.
    /// Calling it more than once is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.consumers.close();
        self.consumers.wait().await;

        if let Err(e) = self.broker.close().await {
            warn!(queue = %self.queue, error = %e, "error while closing broker");
        }
        info!(queue = %self.queue, "queue client closed");
    }
}

struct DeliveryLoop {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    requeue_policy: RequeuePolicy,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl DeliveryLoop {
    async fn run(self, mut stream: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(queue = %self.queue, "delivery loop stopping");
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.settle(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "failed to receive delivery");
                }
                None => {
                    warn!(queue = %self.queue, "delivery stream ended");
                    break;
                }
            }
        }
    }

    async fn settle(&self, delivery: Delivery) {
        let span = spans::start_delivery_span(
            &self.queue,
            delivery.delivery_tag(),
            delivery.redelivered(),
        );

        async {
            let started = Instant::now();

            let result = self.handler.handle(&self.cancel, delivery.payload()).await;

            let outcome = match result {
                Ok(()) => {
                    if let Err(e) = delivery.ack().await {
                        error!(error = %e, "failed to ack message");
                    }
                    "ack"
                }
                Err(err) => {
                    let requeue = self.requeue_policy.should_requeue(&err);
                    error!(
                        error = %err,
                        transient = err.is_transient(),
                        requeue,
                        "failed to handle message"
                    );
                    if let Err(e) = delivery.nack(requeue).await {
                        error!(error = %e, "failed to nack message");
                    }
                    if requeue { "nack_requeue" } else { "nack_drop" }
                }
            };

            spans::record_outcome(&tracing::Span::current(), outcome);
            metrics::deliveries().add(
                1,
                &[
                    KeyValue::new("queue", self.queue.clone()),
                    KeyValue::new("outcome", outcome),
                ],
            );
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "queue.handle")],
            );
        }
        .instrument(span)
        .await
    }
}
