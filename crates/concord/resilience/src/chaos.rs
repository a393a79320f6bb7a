//! Controlled fault injection.
//!
//! Scenarios inject latency, errors, or circuit trips for named targets so
//! that recovery paths can be exercised in a running deployment. Every
//! scenario is bounded: it must carry the policy commitment, affect at most
//! `max_blast_radius` targets, and expire after at most `max_duration_ms`.
//! An emergency stop clears everything and blocks new scenarios until reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_types::ChaosConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ChaosError;
use crate::health::CircuitBreakerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(Uuid);

impl ScenarioId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a scenario does to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    /// Delay the call, then let it proceed.
    Latency { delay_ms: u64 },
    /// Fail the call with a message.
    Error { message: String },
    /// Force the target's circuit open for the scenario's lifetime.
    CircuitTrip,
}

/// Request to start a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub commitment: String,
    pub targets: Vec<String>,
    pub fault: FaultKind,
    /// Chance, in [0, 1], that a call to a target is affected.
    pub probability: f64,
    pub duration: Duration,
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>, commitment: impl Into<String>, fault: FaultKind) -> Self {
        Self {
            name: name.into(),
            commitment: commitment.into(),
            targets: Vec::new(),
            fault,
            probability: 1.0,
            duration: Duration::from_secs(60),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// A fault that fired for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosFault {
    pub scenario_id: ScenarioId,
    pub target: String,
    pub kind: FaultKind,
}

impl std::fmt::Display for ChaosFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FaultKind::Latency { delay_ms } => {
                write!(f, "injected {}ms latency on {}", delay_ms, self.target)
            }
            FaultKind::Error { message } => {
                write!(f, "injected error on {}: {}", self.target, message)
            }
            FaultKind::CircuitTrip => write!(f, "injected circuit trip on {}", self.target),
        }
    }
}

/// Reporting view of an active scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub id: ScenarioId,
    pub name: String,
    pub targets: Vec<String>,
    pub fault: FaultKind,
    pub probability: f64,
    pub started_at: DateTime<Utc>,
    pub injected: u64,
}

struct ActiveScenario {
    id: ScenarioId,
    spec: ScenarioSpec,
    started_at: DateTime<Utc>,
    deadline: Instant,
    injected: u64,
}

impl ActiveScenario {
    fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            id: self.id,
            name: self.spec.name.clone(),
            targets: self.spec.targets.clone(),
            fault: self.spec.fault.clone(),
            probability: self.spec.probability,
            started_at: self.started_at,
            injected: self.injected,
        }
    }
}

/// Fault injection engine with safety limits.
pub struct ChaosEngine {
    config: ChaosConfig,
    commitment: String,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    scenarios: Mutex<HashMap<ScenarioId, ActiveScenario>>,
    emergency_stopped: AtomicBool,
    injected: AtomicU64,
}

impl ChaosEngine {
    pub fn new(config: ChaosConfig, commitment: impl Into<String>) -> Self {
        Self {
            config,
            commitment: commitment.into(),
            breakers: None,
            scenarios: Mutex::new(HashMap::new()),
            emergency_stopped: AtomicBool::new(false),
            injected: AtomicU64::new(0),
        }
    }

    /// Circuit trips act on these breakers.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start a scenario after checking every safety limit.
    pub fn inject(&self, spec: ScenarioSpec) -> Result<ScenarioId, ChaosError> {
        if !self.config.enabled {
            return Err(ChaosError::Disabled);
        }
        if self.is_emergency_stopped() {
            return Err(ChaosError::EmergencyStopped);
        }
        if spec.commitment != self.commitment {
            warn!(scenario = %spec.name, "Fault injection refused, commitment mismatch");
            return Err(ChaosError::CommitmentMismatch);
        }
        if spec.targets.is_empty() || spec.targets.len() > self.config.max_blast_radius {
            return Err(ChaosError::BlastRadiusExceeded {
                requested: spec.targets.len(),
                max: self.config.max_blast_radius,
            });
        }
        if !(0.0..=1.0).contains(&spec.probability) {
            return Err(ChaosError::InvalidProbability(spec.probability));
        }
        if spec.duration.is_zero() || spec.duration > self.config.max_duration() {
            return Err(ChaosError::InvalidDuration {
                requested_ms: spec.duration.as_millis() as u64,
                max_ms: self.config.max_duration_ms,
            });
        }

        let mut scenarios = self.lock();
        self.purge_expired(&mut scenarios);
        if scenarios.len() >= self.config.max_concurrent_scenarios {
            return Err(ChaosError::TooManyScenarios(
                self.config.max_concurrent_scenarios,
            ));
        }

        let id = ScenarioId::generate();
        warn!(
            scenario_id = %id,
            scenario = %spec.name,
            targets = ?spec.targets,
            fault = ?spec.fault,
            probability = spec.probability,
            duration_ms = spec.duration.as_millis() as u64,
            "Fault injection scenario started"
        );

        if spec.fault == FaultKind::CircuitTrip {
            if let Some(breakers) = &self.breakers {
                for target in &spec.targets {
                    breakers.force_open(target);
                }
            }
        }

        scenarios.insert(
            id,
            ActiveScenario {
                id,
                deadline: Instant::now() + spec.duration,
                spec,
                started_at: Utc::now(),
                injected: 0,
            },
        );
        Ok(id)
    }

    /// Roll for a fault against `target`.
    pub fn fault_for(&self, target: &str) -> Option<ChaosFault> {
        if self.is_emergency_stopped() {
            return None;
        }

        let mut scenarios = self.lock();
        self.purge_expired(&mut scenarios);

        for scenario in scenarios.values_mut() {
            if !scenario.spec.targets.iter().any(|t| t == target) {
                continue;
            }
            if rand::random::<f64>() >= scenario.spec.probability {
                continue;
            }

            scenario.injected += 1;
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Some(ChaosFault {
                scenario_id: scenario.id,
                target: target.to_string(),
                kind: scenario.spec.fault.clone(),
            });
        }
        None
    }

    /// Apply any fault for `target`: latency is slept off and the call
    /// proceeds; errors and trips are returned for the caller to fail with.
    pub async fn apply(&self, target: &str) -> Result<(), ChaosFault> {
        let Some(fault) = self.fault_for(target) else {
            return Ok(());
        };

        match &fault.kind {
            FaultKind::Latency { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                Ok(())
            }
            FaultKind::Error { .. } => Err(fault),
            FaultKind::CircuitTrip => {
                if let Some(breakers) = &self.breakers {
                    breakers.force_open(target);
                }
                Err(fault)
            }
        }
    }

    /// Stop a scenario early.
    pub fn deactivate(&self, id: ScenarioId) -> Result<ScenarioSummary, ChaosError> {
        let removed = self.lock().remove(&id);
        match removed {
            Some(scenario) => {
                info!(scenario_id = %id, injected = scenario.injected, "Fault injection scenario stopped");
                self.release(&scenario);
                Ok(scenario.summary())
            }
            None => Err(ChaosError::ScenarioNotFound(id)),
        }
    }

    /// Deactivate every scenario and refuse new ones until
    /// [`reset_emergency_stop`](Self::reset_emergency_stop).
    pub fn emergency_stop(&self) -> usize {
        self.emergency_stopped.store(true, Ordering::SeqCst);
        let stopped: Vec<ActiveScenario> = self.lock().drain().map(|(_, s)| s).collect();
        for scenario in &stopped {
            self.release(scenario);
        }
        error!(scenarios = stopped.len(), "Fault injection emergency stop");
        stopped.len()
    }

    pub fn reset_emergency_stop(&self) {
        self.emergency_stopped.store(false, Ordering::SeqCst);
        info!("Fault injection emergency stop cleared");
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped.load(Ordering::SeqCst)
    }

    pub fn active_scenarios(&self) -> Vec<ScenarioSummary> {
        let mut scenarios = self.lock();
        self.purge_expired(&mut scenarios);
        scenarios.values().map(ActiveScenario::summary).collect()
    }

    /// Faults fired since the engine was created.
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn purge_expired(&self, scenarios: &mut HashMap<ScenarioId, ActiveScenario>) {
        let now = Instant::now();
        let expired: Vec<ScenarioId> = scenarios
            .values()
            .filter(|s| s.deadline <= now)
            .map(|s| s.id)
            .collect();

        for id in expired {
            if let Some(scenario) = scenarios.remove(&id) {
                info!(scenario_id = %id, injected = scenario.injected, "Fault injection scenario expired");
                self.release(&scenario);
            }
        }
    }

    /// Undo the lasting effects of a scenario.
    fn release(&self, scenario: &ActiveScenario) {
        if scenario.spec.fault != FaultKind::CircuitTrip {
            return;
        }
        if let Some(breakers) = &self.breakers {
            for target in &scenario.spec.targets {
                breakers.reset(target);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScenarioId, ActiveScenario>> {
        self.scenarios.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use concord_types::CircuitBreakerConfig;

    const COMMITMENT: &str = "cdd01ef066bc6cf2";

    fn enabled() -> ChaosConfig {
        ChaosConfig {
            enabled: true,
            max_concurrent_scenarios: 2,
            max_blast_radius: 2,
            max_duration_ms: 60_000,
        }
    }

    fn error_spec(target: &str) -> ScenarioSpec {
        ScenarioSpec::new(
            "handler-errors",
            COMMITMENT,
            FaultKind::Error {
                message: "injected".into(),
            },
        )
        .with_target(target)
        .with_duration(Duration::from_secs(10))
    }

    #[test]
    fn disabled_engine_refuses_scenarios() {
        let engine = ChaosEngine::new(ChaosConfig::default(), COMMITMENT);
        assert_eq!(engine.inject(error_spec("a")), Err(ChaosError::Disabled));
    }

    #[tokio::test]
    async fn safety_limits_are_enforced() {
        let engine = ChaosEngine::new(enabled(), COMMITMENT);

        let wrong_commitment = ScenarioSpec {
            commitment: "nope".into(),
            ..error_spec("a")
        };
        assert_eq!(engine.inject(wrong_commitment), Err(ChaosError::CommitmentMismatch));

        let too_wide = error_spec("a").with_target("b").with_target("c");
        assert_eq!(
            engine.inject(too_wide),
            Err(ChaosError::BlastRadiusExceeded { requested: 3, max: 2 })
        );

        let no_targets = ScenarioSpec::new("empty", COMMITMENT, FaultKind::CircuitTrip);
        assert!(matches!(
            engine.inject(no_targets),
            Err(ChaosError::BlastRadiusExceeded { requested: 0, .. })
        ));

        assert_eq!(
            engine.inject(error_spec("a").with_probability(1.5)),
            Err(ChaosError::InvalidProbability(1.5))
        );
        assert!(matches!(
            engine.inject(error_spec("a").with_duration(Duration::from_secs(120))),
            Err(ChaosError::InvalidDuration { .. })
        ));

        engine.inject(error_spec("a")).unwrap();
        engine.inject(error_spec("b")).unwrap();
        assert_eq!(engine.inject(error_spec("c")), Err(ChaosError::TooManyScenarios(2)));
    }

    #[tokio::test]
    async fn faults_fire_only_for_targets() {
        let engine = ChaosEngine::new(enabled(), COMMITMENT);
        let id = engine.inject(error_spec("summarizer")).unwrap();

        let fault = engine.fault_for("summarizer").unwrap();
        assert_eq!(fault.scenario_id, id);
        assert!(engine.fault_for("planner").is_none());
        assert!(engine.apply("summarizer").await.is_err());
        assert_eq!(engine.injected_count(), 2);

        let never = engine.inject(error_spec("planner").with_probability(0.0)).unwrap();
        assert!(engine.fault_for("planner").is_none());
        engine.deactivate(never).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn latency_is_applied_and_call_proceeds() {
        let engine = ChaosEngine::new(enabled(), COMMITMENT);
        engine
            .inject(
                ScenarioSpec::new("slow", COMMITMENT, FaultKind::Latency { delay_ms: 250 })
                    .with_target("opa"),
            )
            .unwrap();

        let started = Instant::now();
        assert!(engine.apply("opa").await.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn scenarios_expire() {
        let engine = ChaosEngine::new(enabled(), COMMITMENT);
        engine.inject(error_spec("a")).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(engine.fault_for("a").is_none());
        assert!(engine.active_scenarios().is_empty());
    }

    #[tokio::test]
    async fn circuit_trip_opens_and_release_resets() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let engine = ChaosEngine::new(enabled(), COMMITMENT).with_breakers(breakers.clone());

        let id = engine
            .inject(ScenarioSpec::new("trip", COMMITMENT, FaultKind::CircuitTrip).with_target("opa"))
            .unwrap();
        assert_eq!(breakers.current_state("opa"), CircuitState::Open);

        engine.deactivate(id).unwrap();
        assert_eq!(breakers.current_state("opa"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn emergency_stop_clears_and_blocks() {
        let engine = ChaosEngine::new(enabled(), COMMITMENT);
        engine.inject(error_spec("a")).unwrap();
        engine.inject(error_spec("b")).unwrap();

        assert_eq!(engine.emergency_stop(), 2);
        assert!(engine.active_scenarios().is_empty());
        assert!(engine.fault_for("a").is_none());
        assert_eq!(engine.inject(error_spec("a")), Err(ChaosError::EmergencyStopped));

        engine.reset_emergency_stop();
        assert!(engine.inject(error_spec("a")).is_ok());
    }
}
