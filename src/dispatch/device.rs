//! Synthetic device routines published by the simulator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Job, JobHandler};
use crate::error::Result;
use crate::model::{DeviceRoutine, DeviceStatus};
use crate::queue::QueueClient;

pub const ROUTINE_CONTEXT: &str = "routine";

pub const DIAGNOSTICS: [&str; 5] = [
    "Temperature within normal range",
    "Pressure levels optimal",
    "Flow rate stable",
    "Power consumption normal",
    "System response time acceptable",
];

pub const AREAS: [&str; 3] = ["A", "B", "C"];

/// Build a random routine report for the device behind `job`.
pub fn random_routine<R: Rng + ?Sized>(job: Job, rng: &mut R) -> DeviceRoutine {
    let status = *DeviceStatus::REPORTABLE
        .choose(rng)
        .unwrap_or(&DeviceStatus::Healthy);
    let diagnostics = DIAGNOSTICS.choose(rng).copied().unwrap_or(DIAGNOSTICS[0]);
    let area = AREAS.choose(rng).copied().unwrap_or(AREAS[0]);

    DeviceRoutine::new(
        format!("device-{job}"),
        status,
        ROUTINE_CONTEXT,
        diagnostics,
        area,
        Utc::now(),
    )
}

/// Publishes one synthetic routine per job.
pub struct RoutineDispatcher {
    queue: Arc<QueueClient>,
}

impl RoutineDispatcher {
    pub fn new(queue: Arc<QueueClient>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler for RoutineDispatcher {
    async fn handle(&self, job: Job, _cancel: &CancellationToken) -> Result<()> {
        let routine = random_routine(job, &mut rand::rng());
        debug!(device_id = %routine.id, area = %routine.area, "dispatching routine");
        self.queue.publish(&routine).await
    }
}
