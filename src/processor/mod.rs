//! Routine processing: decode, call the flaky dependency, persist.
//!
//! [`ProcessingService`] is the consumer-side [`MessageHandler`]. Its
//! collaborators are injected as trait objects so tests can swap them.

pub mod unstable;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

use crate::error::Result;
use crate::model::RoutineEvent;
use crate::queue::MessageHandler;
use crate::telemetry::{self, metrics};

/// The unreliable external call made for every routine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalApi: Send + Sync {
    async fn call(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Write path of the routine record store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutineRepository: Send + Sync {
    async fn store(&self, routine: RoutineEvent) -> Result<()>;
}

pub struct ProcessingService {
    api: Arc<dyn ExternalApi>,
    repository: Arc<dyn RoutineRepository>,
}

impl ProcessingService {
    pub fn new(api: Arc<dyn ExternalApi>, repository: Arc<dyn RoutineRepository>) -> Self {
        Self { api, repository }
    }

    /// Process one raw routine payload.
    ///
    /// Nothing is written unless decoding and the external call both
    /// succeed. A failed write is not compensated; the redelivery repeats
    /// the call and stores a new row under a new id.
    #[tracing::instrument(
        name = "processor.process_routine",
        skip_all,
        fields(routine.id = tracing::field::Empty, device.id = tracing::field::Empty)
    )]
    pub async fn process_routine(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        let trace_id = telemetry::current_trace_id();
        let trace_id = trace_id.as_deref().unwrap_or("-");
        info!(trace_id, payload_len = payload.len(), "started processing routine");

        let routine = RoutineEvent::decode(payload)?;

        let span = Span::current();
        span.record("routine.id", tracing::field::display(routine.id));
        span.record("device.id", routine.device_id.as_str());
        info!(routine_id = %routine.id, trace_id, "parsed routine");
        if routine.status.known().is_none() {
            warn!(routine_id = %routine.id, status = %routine.status, "unrecognized device status");
        }

        self.api.call(cancel).await?;

        let result = self.repository.store(routine).await;
        metrics::store_writes().add(
            1,
            &[KeyValue::new(
                "result",
                if result.is_ok() { "ok" } else { "error" },
            )],
        );
        result
    }
}

#[async_trait]
impl MessageHandler for ProcessingService {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        self.process_routine(cancel, payload).await
    }
}
