//! Sequential step execution with LIFO rollback.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use concord_resilience::CircuitBreakerRegistry;
use concord_types::{Cancellation, SagaConfig};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CompensationFailure, SagaError, SagaResult, StepFailure, StepFailureKind};
use crate::step::{SagaStep, StepFn, StepInput};

/// Unique saga execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId(Uuid);

impl SagaId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "saga:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Pending,
    Running,
    Completed,
    /// A step failed and every completed step was undone.
    Compensated,
    /// A step failed and some compensations are still outstanding.
    CompensationFailed,
}

/// Result of a saga whose steps all succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletion {
    pub saga_id: SagaId,
    pub outputs: BTreeMap<String, Value>,
    /// Steps in execution order.
    pub steps: Vec<String>,
}

/// Runs registered steps strictly in order, one at a time.
///
/// On the first failure every step that already succeeded is compensated in
/// reverse order. A failing compensation is recorded and the remaining ones
/// still run.
pub struct SagaCoordinator<C> {
    config: SagaConfig,
    steps: Vec<SagaStep<C>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl<C> SagaCoordinator<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(config: SagaConfig) -> Self {
        Self {
            config,
            steps: Vec::new(),
            breakers: None,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn add_step<A, AFut, K, KFut>(
        &mut self,
        name: impl Into<String>,
        action: A,
        compensation: K,
    ) -> SagaResult<()>
    where
        A: Fn(Arc<C>, StepInput) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<Value, String>> + Send + 'static,
        K: Fn(Arc<C>, StepInput) -> KFut + Send + Sync + 'static,
        KFut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.add_step_with(SagaStep::new(name, action).with_compensation(compensation))
    }

    /// Add a step with nothing to undo.
    pub fn add_action<A, AFut>(&mut self, name: impl Into<String>, action: A) -> SagaResult<()>
    where
        A: Fn(Arc<C>, StepInput) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.add_step_with(SagaStep::new(name, action))
    }

    pub fn add_step_with(&mut self, step: SagaStep<C>) -> SagaResult<()> {
        if self.steps.iter().any(|s| s.name == step.name) {
            return Err(SagaError::DuplicateStep(step.name));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub async fn execute(
        &self,
        ctx: impl Into<Arc<C>>,
        input: Value,
    ) -> SagaResult<SagaCompletion> {
        self.begin(ctx, input).run().await
    }

    pub async fn execute_with_cancel(
        &self,
        ctx: impl Into<Arc<C>>,
        input: Value,
        cancellation: Cancellation,
    ) -> SagaResult<SagaCompletion> {
        self.begin(ctx, input).run_with_cancel(cancellation).await
    }

    /// Start a transaction whose bookkeeping outlives a failed run, so
    /// rollback can be retried with [`SagaTransaction::compensate`].
    pub fn begin(&self, ctx: impl Into<Arc<C>>, input: Value) -> SagaTransaction<'_, C> {
        SagaTransaction {
            coordinator: self,
            id: SagaId::generate(),
            ctx: ctx.into(),
            input,
            outputs: BTreeMap::new(),
            executed: Vec::new(),
            compensated: HashSet::new(),
            compensation_order: Vec::new(),
            failure: None,
            state: SagaState::Pending,
        }
    }

    fn step(&self, name: &str) -> Option<&SagaStep<C>> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn timeout_for(&self, step: &SagaStep<C>) -> Duration {
        step.timeout.unwrap_or_else(|| self.config.default_step_timeout())
    }
}

/// One execution of a saga.
pub struct SagaTransaction<'a, C> {
    coordinator: &'a SagaCoordinator<C>,
    id: SagaId,
    ctx: Arc<C>,
    input: Value,
    outputs: BTreeMap<String, Value>,
    executed: Vec<String>,
    compensated: HashSet<String>,
    compensation_order: Vec<String>,
    failure: Option<StepFailure>,
    state: SagaState,
}

impl<'a, C> SagaTransaction<'a, C>
where
    C: Send + Sync + 'static,
{
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Steps whose action succeeded, in execution order.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Steps compensated so far, in the order they were undone.
    pub fn compensated(&self) -> &[String] {
        &self.compensation_order
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    pub async fn run(&mut self) -> SagaResult<SagaCompletion> {
        self.run_with_cancel(Cancellation::never()).await
    }

    /// Run every step in order; cancellation is honoured between steps and
    /// triggers rollback.
    #[instrument(skip_all, fields(saga_id = %self.id))]
    pub async fn run_with_cancel(
        &mut self,
        cancellation: Cancellation,
    ) -> SagaResult<SagaCompletion> {
        if self.state != SagaState::Pending {
            return Err(SagaError::InvalidState(format!(
                "{} cannot run from state {:?}",
                self.id, self.state
            )));
        }
        self.state = SagaState::Running;
        let coordinator = self.coordinator;

        for step in &coordinator.steps {
            if cancellation.is_cancelled() {
                self.failure = Some(StepFailure {
                    step: step.name.clone(),
                    kind: StepFailureKind::Cancelled,
                    reason: "saga cancelled before step started".to_string(),
                });
                break;
            }

            debug!(step = %step.name, "Running saga step");
            let input = self.step_input();
            match run_action(coordinator, step, Arc::clone(&self.ctx), input).await {
                Ok(output) => {
                    self.outputs.insert(step.name.clone(), output);
                    self.executed.push(step.name.clone());
                }
                Err(failure) => {
                    warn!(
                        step = %failure.step,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "Saga step failed, rolling back"
                    );
                    self.failure = Some(failure);
                    break;
                }
            }
        }

        let Some(failure) = self.failure.clone() else {
            self.state = SagaState::Completed;
            info!(steps = self.executed.len(), "Saga completed");
            return Ok(SagaCompletion {
                saga_id: self.id,
                outputs: self.outputs.clone(),
                steps: self.executed.clone(),
            });
        };

        let compensation_failures = self.compensate().await;
        let compensated = self.compensation_order.clone();
        if compensation_failures.is_empty() {
            Err(SagaError::StepFailed {
                failure,
                compensated,
            })
        } else {
            Err(SagaError::CompensationFailed {
                failure,
                compensated,
                compensation_failures,
            })
        }
    }

    /// Undo every executed step not yet compensated, newest first.
    ///
    /// Steps already compensated are skipped, so calling this again only
    /// retries the compensations that failed.
    pub async fn compensate(&mut self) -> Vec<CompensationFailure> {
        let coordinator = self.coordinator;
        let pending: Vec<String> = self
            .executed
            .iter()
            .rev()
            .filter(|name| !self.compensated.contains(*name))
            .cloned()
            .collect();
        let mut failures = Vec::new();

        for name in pending {
            let Some(step) = coordinator.step(&name) else {
                continue;
            };
            if let Some(compensation) = &step.compensation {
                let timeout = coordinator.timeout_for(step);
                let input = self.step_input();
                if let Err(reason) =
                    invoke(compensation, Arc::clone(&self.ctx), input, timeout).await
                {
                    error!(step = %name, reason = %reason, "Compensation failed");
                    failures.push(CompensationFailure { step: name, reason });
                    continue;
                }
                debug!(step = %name, "Step compensated");
            }
            self.compensated.insert(name.clone());
            self.compensation_order.push(name);
        }

        self.state = if failures.is_empty() {
            SagaState::Compensated
        } else {
            SagaState::CompensationFailed
        };
        info!(
            compensated = self.compensation_order.len(),
            failed = failures.len(),
            "Saga rollback finished"
        );
        failures
    }

    fn step_input(&self) -> StepInput {
        StepInput {
            input: self.input.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

async fn run_action<C>(
    coordinator: &SagaCoordinator<C>,
    step: &SagaStep<C>,
    ctx: Arc<C>,
    input: StepInput,
) -> Result<Value, StepFailure>
where
    C: Send + Sync + 'static,
{
    let breaker = step.guard.as_deref().zip(coordinator.breakers.as_deref());
    if let Some((dependency, breakers)) = breaker {
        if !breakers.is_healthy(dependency) {
            return Err(StepFailure {
                step: step.name.clone(),
                kind: StepFailureKind::DependencyUnavailable,
                reason: format!("circuit open: {}", dependency),
            });
        }
    }

    let timeout = coordinator.timeout_for(step);
    let call = AssertUnwindSafe((step.action)(ctx, input)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(reason))) => Err((StepFailureKind::Error, reason)),
        Ok(Err(_)) => Err((StepFailureKind::Panic, "step panicked".to_string())),
        Err(_) => Err((
            StepFailureKind::Timeout,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    };

    if let Some((dependency, breakers)) = breaker {
        if outcome.is_ok() {
            breakers.record_success(dependency);
        } else {
            breakers.record_failure(dependency);
        }
    }

    outcome.map_err(|(kind, reason)| StepFailure {
        step: step.name.clone(),
        kind,
        reason,
    })
}

async fn invoke<C>(
    work: &StepFn<C>,
    ctx: Arc<C>,
    input: StepInput,
    timeout: Duration,
) -> Result<Value, String> {
    let call = AssertUnwindSafe(work(ctx, input)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("compensation panicked".to_string()),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::CircuitBreakerConfig;
    use futures::future::{ready, Ready};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Ledger {
        calls: Mutex<Vec<String>>,
    }

    impl Ledger {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    type Work = Ready<Result<Value, String>>;

    fn succeed(call: &'static str) -> impl Fn(Arc<Ledger>, StepInput) -> Work {
        move |ledger, _| {
            ledger.record(call);
            ready(Ok(json!(call)))
        }
    }

    fn fail(call: &'static str) -> impl Fn(Arc<Ledger>, StepInput) -> Work {
        move |ledger, _| {
            ledger.record(call);
            ready(Err(format!("{} refused", call)))
        }
    }

    fn order_saga(ship: bool) -> SagaCoordinator<Ledger> {
        let mut saga = SagaCoordinator::new(SagaConfig::default());
        saga.add_step("reserve", succeed("reserve"), succeed("reserve-compensate"))
            .unwrap();
        saga.add_step("charge", succeed("charge"), succeed("charge-compensate"))
            .unwrap();
        if ship {
            saga.add_step("ship", succeed("ship"), succeed("ship-compensate"))
                .unwrap();
        } else {
            saga.add_step("ship", fail("ship"), succeed("ship-compensate"))
                .unwrap();
        }
        saga
    }

    #[tokio::test]
    async fn completes_in_registration_order() {
        let ledger = Arc::new(Ledger::default());
        let completion = order_saga(true)
            .execute(ledger.clone(), json!({"order": 7}))
            .await
            .unwrap();

        assert_eq!(completion.steps, vec!["reserve", "charge", "ship"]);
        assert_eq!(completion.outputs["charge"], json!("charge"));
        assert_eq!(ledger.calls(), vec!["reserve", "charge", "ship"]);
    }

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse() {
        let ledger = Arc::new(Ledger::default());
        let err = order_saga(false)
            .execute(ledger.clone(), json!({}))
            .await
            .unwrap_err();

        match err {
            SagaError::StepFailed {
                failure,
                compensated,
            } => {
                assert_eq!(failure.step, "ship");
                assert_eq!(failure.kind, StepFailureKind::Error);
                assert_eq!(compensated, vec!["charge", "reserve"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            ledger.calls(),
            vec![
                "reserve",
                "charge",
                "ship",
                "charge-compensate",
                "reserve-compensate"
            ]
        );
    }

    #[tokio::test]
    async fn failing_compensation_does_not_stop_the_rollback() {
        let ledger = Arc::new(Ledger::default());
        let mut saga = SagaCoordinator::new(SagaConfig::default());
        saga.add_step("reserve", succeed("reserve"), succeed("reserve-compensate"))
            .unwrap();
        saga.add_step("charge", succeed("charge"), fail("charge-compensate"))
            .unwrap();
        saga.add_action("ship", fail("ship")).unwrap();

        let err = saga.execute(ledger.clone(), json!({})).await.unwrap_err();

        match &err {
            SagaError::CompensationFailed {
                failure,
                compensated,
                compensation_failures,
            } => {
                assert_eq!(failure.step, "ship");
                assert_eq!(compensated, &vec!["reserve".to_string()]);
                assert_eq!(compensation_failures.len(), 1);
                assert_eq!(compensation_failures[0].step, "charge");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.failure().map(|f| f.step.as_str()), Some("ship"));
        assert!(ledger.calls().contains(&"reserve-compensate".to_string()));
    }

    #[tokio::test]
    async fn compensation_is_idempotent_through_bookkeeping() {
        let ledger = Arc::new(Ledger::default());
        let saga = order_saga(false);
        let mut tx = saga.begin(ledger.clone(), json!({}));

        assert!(tx.run().await.is_err());
        assert_eq!(tx.state(), SagaState::Compensated);
        let after_rollback = ledger.calls();

        assert!(tx.compensate().await.is_empty());
        assert_eq!(ledger.calls(), after_rollback);
        assert_eq!(tx.compensated(), ["charge", "reserve"]);
    }

    #[tokio::test]
    async fn retried_rollback_only_reruns_failed_compensations() {
        let attempts = Arc::new(AtomicU32::new(0));
        let ledger = Arc::new(Ledger::default());
        let mut saga = SagaCoordinator::new(SagaConfig::default());
        saga.add_step("reserve", succeed("reserve"), succeed("reserve-compensate"))
            .unwrap();
        let counter = attempts.clone();
        saga.add_step("charge", succeed("charge"), move |ledger: Arc<Ledger>, _| {
            ledger.record("charge-compensate");
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("refund gateway down".to_string())
                } else {
                    Ok(json!("refunded"))
                }
            }
        })
        .unwrap();
        saga.add_action("ship", fail("ship")).unwrap();

        let mut tx = saga.begin(ledger.clone(), json!({}));
        assert!(matches!(
            tx.run().await,
            Err(SagaError::CompensationFailed { .. })
        ));
        assert_eq!(tx.state(), SagaState::CompensationFailed);

        assert!(tx.compensate().await.is_empty());
        assert_eq!(tx.state(), SagaState::Compensated);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let reserve_compensations = ledger
            .calls()
            .iter()
            .filter(|c| *c == "reserve-compensate")
            .count();
        assert_eq!(reserve_compensations, 1);
    }

    #[tokio::test]
    async fn later_steps_see_earlier_outputs() {
        let mut saga: SagaCoordinator<()> = SagaCoordinator::new(SagaConfig::default());
        saga.add_action("quote", |_, input: StepInput| async move {
            Ok(json!(input.input["qty"].as_i64().unwrap_or(0) * 5))
        })
        .unwrap();
        saga.add_action("invoice", |_, input: StepInput| async move {
            input
                .output("quote")
                .cloned()
                .ok_or_else(|| "missing quote".to_string())
        })
        .unwrap();

        let completion = saga.execute((), json!({"qty": 3})).await.unwrap();
        assert_eq!(completion.outputs["invoice"], json!(15));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_fails_with_timeout() {
        let ledger = Arc::new(Ledger::default());
        let mut saga = SagaCoordinator::new(SagaConfig::default());
        saga.add_step("reserve", succeed("reserve"), succeed("reserve-compensate"))
            .unwrap();
        saga.add_step_with(
            SagaStep::new("charge", |_: Arc<Ledger>, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            })
            .with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let err = saga.execute(ledger.clone(), json!({})).await.unwrap_err();

        assert_eq!(err.failure().map(|f| f.kind), Some(StepFailureKind::Timeout));
        assert_eq!(ledger.calls(), vec!["reserve", "reserve-compensate"]);
    }

    #[tokio::test]
    async fn cancellation_before_a_step_rolls_back() {
        let ledger = Arc::new(Ledger::default());
        let (handle, cancellation) = Cancellation::new();
        let mut saga = SagaCoordinator::new(SagaConfig::default());
        saga.add_step("reserve", succeed("reserve"), succeed("reserve-compensate"))
            .unwrap();
        let charge = move |ledger: Arc<Ledger>, _| {
            ledger.record("charge");
            handle.cancel();
            ready(Ok(json!("charged")))
        };
        saga.add_step("charge", charge, succeed("charge-compensate"))
            .unwrap();
        saga.add_action("ship", succeed("ship")).unwrap();

        let err = saga
            .execute_with_cancel(ledger.clone(), json!({}), cancellation)
            .await
            .unwrap_err();

        let failure = err.failure().unwrap();
        assert_eq!(failure.step, "ship");
        assert_eq!(failure.kind, StepFailureKind::Cancelled);
        assert_eq!(
            ledger.calls(),
            vec!["reserve", "charge", "charge-compensate", "reserve-compensate"]
        );
    }

    #[tokio::test]
    async fn open_circuit_fails_fast() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        breakers.force_open("payments");
        let ledger = Arc::new(Ledger::default());
        let mut saga =
            SagaCoordinator::new(SagaConfig::default()).with_breakers(breakers.clone());
        saga.add_step_with(SagaStep::new("charge", succeed("charge")).guarded_by("payments"))
            .unwrap();

        let err = saga.execute(ledger.clone(), json!({})).await.unwrap_err();

        assert_eq!(
            err.failure().map(|f| f.kind),
            Some(StepFailureKind::DependencyUnavailable)
        );
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn transaction_runs_once() {
        let saga = order_saga(true);
        let mut tx = saga.begin(Ledger::default(), json!({}));
        assert!(tx.run().await.is_ok());
        assert!(matches!(tx.run().await, Err(SagaError::InvalidState(_))));
    }

    #[test]
    fn duplicate_steps_are_rejected() {
        let mut saga = order_saga(true);
        assert_eq!(
            saga.add_action("charge", succeed("charge")),
            Err(SagaError::DuplicateStep("charge".into()))
        );
        assert_eq!(saga.step_names(), vec!["reserve", "charge", "ship"]);
    }
}
