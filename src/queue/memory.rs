//! In-process broker with the same ack/nack semantics as the AMQP one.
//!
//! Each declared queue is an unbounded channel with a single consumer.
//! Nacking with requeue puts the message back at the tail, flagged as
//! redelivered. Publishes and settlements are recorded so callers can
//! inspect what happened. The record is unbounded unless a limit is set
//! with [`InMemoryBroker::with_history_limit`], in which case only the
//! newest entries are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::mpsc;

use super::{Acknowledger, Broker, Delivery, DeliveryStream};
use crate::error::{Error, Result};

/// A message as accepted by [`InMemoryBroker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked {
        delivery_tag: u64,
        payload: Vec<u8>,
    },
    Nacked {
        delivery_tag: u64,
        payload: Vec<u8>,
        requeue: bool,
    },
}

impl Settlement {
    pub fn payload(&self) -> &[u8] {
        match self {
            Settlement::Acked { payload, .. } | Settlement::Nacked { payload, .. } => payload,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Settlement::Acked { .. })
    }
}

#[derive(Clone)]
struct Envelope {
    payload: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Option<mpsc::UnboundedReceiver<Envelope>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    published: VecDeque<PublishedMessage>,
    settlements: VecDeque<Settlement>,
    settled_total: usize,
    history_limit: Option<usize>,
    next_tag: u64,
    closed: bool,
    close_calls: usize,
    declare_failure: Option<String>,
}

impl State {
    fn record_publish(&mut self, message: PublishedMessage) {
        self.published.push_back(message);
        trim(&mut self.published, self.history_limit);
    }

    fn record_settlement(&mut self, settlement: Settlement) {
        self.settled_total += 1;
        self.settlements.push_back(settlement);
        trim(&mut self.settlements, self.history_limit);
    }
}

fn trim<T>(log: &mut VecDeque<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        while log.len() > limit {
            log.pop_front();
        }
    }
}

/// Process-local [`Broker`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` published messages and `limit` settlements,
    /// dropping the oldest first.
    pub fn with_history_limit(limit: usize) -> Self {
        let broker = Self::default();
        broker.lock().history_limit = Some(limit);
        broker
    }

    /// Make every subsequent `declare_queue` fail with `reason`.
    pub fn fail_declarations(&self, reason: impl Into<String>) {
        self.lock().declare_failure = Some(reason.into());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of times `close` has been called.
    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.iter().cloned().collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.iter().cloned().collect()
    }

    /// Deliveries settled so far, including any dropped from the record.
    pub fn settled_total(&self) -> usize {
        self.lock().settled_total
    }

    /// Poll until at least `count` deliveries have been settled, then
    /// return the recorded settlements.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        loop {
            {
                let state = self.lock();
                if state.settled_total >= count {
                    return state.settlements.iter().cloned().collect();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, queue: &str, envelope: Envelope) -> Delivery {
        let delivery_tag = {
            let mut state = self.lock();
            state.next_tag += 1;
            state.next_tag
        };

        Delivery::new(
            envelope.payload.clone(),
            delivery_tag,
            envelope.redelivered,
            Box::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                delivery_tag,
                payload: envelope.payload,
            }),
        )
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(reason) = state.declare_failure.clone() {
            return Err(Error::Declaration {
                queue: queue.to_string(),
                reason,
            });
        }
        if state.closed {
            return Err(Error::Declaration {
                queue: queue.to_string(),
                reason: "broker is closed".to_string(),
            });
        }

        state.queues.entry(queue.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            QueueState {
                sender,
                receiver: Some(receiver),
            }
        });
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], content_type: &str) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Publish("broker is closed".to_string()));
        }

        let sender = state
            .queues
            .get(queue)
            .map(|q| q.sender.clone())
            .ok_or_else(|| Error::Publish(format!("no such queue: {queue}")))?;

        sender
            .send(Envelope {
                payload: payload.to_vec(),
                redelivered: false,
            })
            .map_err(|_| Error::Publish(format!("queue {queue} is gone")))?;

        state.record_publish(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            content_type: content_type.to_string(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let receiver = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Subscription("broker is closed".to_string()));
            }
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::Subscription(format!("no such queue: {queue}")))?;
            queue_state.receiver.take().ok_or_else(|| {
                Error::Subscription(format!("queue {queue} already has a consumer"))
            })?
        };

        let broker = self.clone();
        let queue = queue.to_string();
        let deliveries = futures::stream::unfold(receiver, move |mut receiver| {
            let broker = broker.clone();
            let queue = queue.clone();
            async move {
                let envelope = receiver.recv().await?;
                Some((Ok(broker.deliver(&queue, envelope)), receiver))
            }
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.closed = true;
        // Dropping the senders ends every consumer stream once drained.
        state.queues.clear();
        Ok(())
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    delivery_tag: u64,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if state.closed {
            return Err(Error::Acknowledgement("broker is closed".to_string()));
        }
        state.record_settlement(Settlement::Acked {
            delivery_tag: self.delivery_tag,
            payload: self.payload.clone(),
        });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        if state.closed {
            return Err(Error::Acknowledgement("broker is closed".to_string()));
        }
        state.record_settlement(Settlement::Nacked {
            delivery_tag: self.delivery_tag,
            payload: self.payload.clone(),
            requeue,
        });

        if requeue {
            if let Some(queue) = state.queues.get(&self.queue) {
                let _ = queue.sender.send(Envelope {
                    payload: self.payload.clone(),
                    redelivered: true,
                });
            }
        }
        Ok(())
    }
}
