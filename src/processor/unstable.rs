//! Simulated flaky downstream dependency.
//!
//! Each call waits for one of four latency tiers. Landing on the
//! unreliable tier always fails; otherwise a random draw against the
//! configured failure rate decides.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ExternalApi;
use crate::error::{Error, Result};
use crate::telemetry::{self, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyTier {
    Low,
    Medium,
    High,
    Unreliable,
}

impl LatencyTier {
    pub const ALL: [LatencyTier; 4] = [
        LatencyTier::Low,
        LatencyTier::Medium,
        LatencyTier::High,
        LatencyTier::Unreliable,
    ];

    fn index(self) -> usize {
        match self {
            LatencyTier::Low => 0,
            LatencyTier::Medium => 1,
            LatencyTier::High => 2,
            LatencyTier::Unreliable => 3,
        }
    }
}

/// Which tiers a call may land on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TierSelection {
    /// Uniform over all four tiers.
    #[default]
    Random,
    /// Uniform over every tier except [`LatencyTier::Unreliable`].
    ExcludeUnreliable,
    /// Always the given tier.
    Forced(LatencyTier),
}

#[derive(Debug, Clone)]
pub struct UnstableApiConfig {
    /// Wait per tier, indexed in [`LatencyTier::ALL`] order.
    pub latencies: [Duration; 4],
    /// Probability in `[0, 1]` that a call off the unreliable tier fails.
    pub failure_rate: f64,
    pub tier_selection: TierSelection,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for UnstableApiConfig {
    fn default() -> Self {
        Self {
            latencies: [
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(400),
            ],
            failure_rate: 0.2,
            tier_selection: TierSelection::Random,
            seed: None,
        }
    }
}

impl UnstableApiConfig {
    pub fn latency(&self, tier: LatencyTier) -> Duration {
        self.latencies[tier.index()]
    }

    /// No waiting, no random failures, never the unreliable tier.
    pub fn always_succeeds() -> Self {
        Self {
            latencies: [Duration::ZERO; 4],
            failure_rate: 0.0,
            tier_selection: TierSelection::ExcludeUnreliable,
            seed: None,
        }
    }
}

/// Stand-in for an unreliable external system.
///
/// Holds no state besides the RNG, so one instance can serve every worker.
pub struct UnstableApi {
    config: UnstableApiConfig,
    rng: Mutex<StdRng>,
}

impl UnstableApi {
    pub fn new(config: UnstableApiConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    fn pick_tier(&self) -> LatencyTier {
        let upper = match self.config.tier_selection {
            TierSelection::Forced(tier) => return tier,
            TierSelection::Random => LatencyTier::ALL.len(),
            TierSelection::ExcludeUnreliable => LatencyTier::ALL.len() - 1,
        };
        let index = self.with_rng(|rng| rng.random_range(0..upper));
        LatencyTier::ALL[index]
    }

    fn draw(&self) -> f64 {
        self.with_rng(|rng| rng.random::<f64>())
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    async fn simulate(&self, cancel: &CancellationToken) -> Result<()> {
        let trace_id = telemetry::current_trace_id();
        let trace_id = trace_id.as_deref().unwrap_or("-");

        let tier = self.pick_tier();
        let latency = self.config.latency(tier);
        info!(?tier, latency_ms = latency.as_millis() as u64, trace_id, "got latency");

        if latency.is_zero() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        if tier == LatencyTier::Unreliable {
            return Err(Error::Unstable);
        }

        let should_err = self.draw() < self.config.failure_rate;
        debug!(should_err, trace_id, "drew failure");
        if should_err {
            return Err(Error::Unknown);
        }

        Ok(())
    }
}

#[async_trait]
impl ExternalApi for UnstableApi {
    #[tracing::instrument(name = "unstable_api.call", skip_all)]
    async fn call(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.simulate(cancel).await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        metrics::unstable_calls().add(1, &[KeyValue::new("outcome", outcome)]);

        result
    }
}
