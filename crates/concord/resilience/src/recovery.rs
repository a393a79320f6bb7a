//! Recovery orchestration for failed operations.
//!
//! Failed operations are queued with a strategy that decides when (or
//! whether) they become eligible for another attempt. The queue is ordered by
//! eligible time; [`RecoveryOrchestrator::tick`] releases everything that is
//! due, highest priority first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{BackoffConfig, Cancellation, RecoveryConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::{ResilienceError, ResilienceResult};
use crate::health::CircuitBreakerRegistry;

/// Identifier of a recoverable operation, chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How the next attempt of a failed operation is timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    Immediate,
    /// Never retried automatically; waits for [`RecoveryOrchestrator::trigger`].
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued until its eligible time.
    Pending,
    /// Released by `tick`, outcome not yet reported.
    InFlight,
    AwaitingManual,
    /// Terminal: the failure budget is spent.
    Exhausted,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::InFlight => write!(f, "in-flight"),
            TaskState::AwaitingManual => write!(f, "awaiting-manual"),
            TaskState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// A failed operation tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct RecoveryTask {
    pub operation_id: OperationId,
    pub failure_reason: String,
    pub strategy: RecoveryStrategy,
    pub priority: RecoveryPriority,

    /// Failures recorded so far, the original call included.
    pub attempts: u32,

    /// When the next attempt may run; `None` while awaiting a manual trigger.
    pub next_eligible_at: Option<Instant>,

    /// Dependency whose circuit must be closed before the task is released.
    pub dependency: Option<String>,

    pub state: TaskState,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,

    enqueue_seq: u64,
    generation: u64,
}

impl RecoveryTask {
    /// Number of the attempt the next run represents.
    pub fn next_attempt(&self) -> u32 {
        self.attempts.saturating_add(1)
    }
}

/// Result of reporting a failure to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { attempt: u32, delay: Duration },
    AwaitingManual,
    Exhausted { attempts: u32 },
}

/// Lifecycle events published by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Scheduled {
        operation_id: OperationId,
        attempt: u32,
        delay: Duration,
    },
    AwaitingManual {
        operation_id: OperationId,
    },
    Dispatched {
        operation_id: OperationId,
        attempt: u32,
    },
    Succeeded {
        operation_id: OperationId,
    },
    Exhausted {
        operation_id: OperationId,
        attempts: u32,
        reason: String,
    },
    Cancelled {
        operation_id: OperationId,
    },
}

/// Delay before a given attempt. `None` means "never automatically".
pub trait DelayStrategy: Send + Sync {
    fn delay_for(&self, attempt: u32) -> Option<Duration>;
}

/// `base × 2^(attempt-1)`, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl DelayStrategy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let exponent = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max);
        Some(delay.min(self.max))
    }
}

/// `base × attempt`, capped.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl DelayStrategy for LinearBackoff {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let delay = self.base.checked_mul(attempt).unwrap_or(self.max);
        Some(delay.min(self.max))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Immediate;

impl DelayStrategy for Immediate {
    fn delay_for(&self, _attempt: u32) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manual;

impl DelayStrategy for Manual {
    fn delay_for(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// One delay strategy per [`RecoveryStrategy`] variant.
pub struct StrategyTable {
    strategies: HashMap<RecoveryStrategy, Arc<dyn DelayStrategy>>,
}

impl StrategyTable {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        fn curve(backoff: &BackoffConfig) -> (Duration, Duration) {
            (backoff.base(), backoff.max())
        }

        let (exp_base, exp_max) = curve(&config.exponential);
        let (lin_base, lin_max) = curve(&config.linear);

        let mut strategies: HashMap<RecoveryStrategy, Arc<dyn DelayStrategy>> = HashMap::new();
        strategies.insert(
            RecoveryStrategy::ExponentialBackoff,
            Arc::new(ExponentialBackoff::new(exp_base, exp_max)),
        );
        strategies.insert(
            RecoveryStrategy::LinearBackoff,
            Arc::new(LinearBackoff::new(lin_base, lin_max)),
        );
        strategies.insert(RecoveryStrategy::Immediate, Arc::new(Immediate));
        strategies.insert(RecoveryStrategy::Manual, Arc::new(Manual));

        Self { strategies }
    }

    /// Replace the delay strategy used for one variant.
    pub fn with_strategy(
        mut self,
        strategy: RecoveryStrategy,
        delay: Arc<dyn DelayStrategy>,
    ) -> Self {
        self.strategies.insert(strategy, delay);
        self
    }

    pub fn delay_for(&self, strategy: RecoveryStrategy, attempt: u32) -> Option<Duration> {
        self.strategies
            .get(&strategy)
            .and_then(|delay| delay.delay_for(attempt))
    }
}

/// Re-runs operations released by the recovery worker.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn execute(&self, task: &RecoveryTask) -> ResilienceResult<()>;
}

/// (eligible time, enqueue sequence, generation, operation)
type QueueEntry = Reverse<(Instant, u64, u64, OperationId)>;

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<QueueEntry>,
    tasks: HashMap<OperationId, RecoveryTask>,
    exhausted: VecDeque<RecoveryTask>,
    next_seq: u64,
}

impl QueueState {
    fn retire(&mut self, task: RecoveryTask, capacity: usize) {
        while self.exhausted.len() >= capacity.max(1) {
            if let Some(evicted) = self.exhausted.pop_front() {
                debug!(operation_id = %evicted.operation_id, "Exhausted task history full, dropped oldest");
            }
        }
        self.exhausted.push_back(task);
    }

    fn enqueue(&mut self, operation_id: &OperationId, eligible_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(task) = self.tasks.get_mut(operation_id) {
            task.generation += 1;
            task.enqueue_seq = seq;
            task.state = TaskState::Pending;
            task.next_eligible_at = Some(eligible_at);
            self.queue.push(Reverse((
                eligible_at,
                seq,
                task.generation,
                operation_id.clone(),
            )));
        }
    }
}

/// Priority queue of failed operations awaiting retry.
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    strategies: StrategyTable,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<RecoveryEvent>,
}

impl RecoveryOrchestrator {
    pub fn new(config: RecoveryConfig) -> Self {
        let strategies = StrategyTable::from_config(&config);
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            strategies,
            breakers: None,
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    /// Hold back tasks whose dependency circuit is open.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Record a failure of `operation_id`.
    ///
    /// The first call creates the task; later calls for a tracked operation
    /// count another failure and reschedule it under its original strategy.
    pub fn schedule(
        &self,
        operation_id: impl Into<OperationId>,
        reason: impl Into<String>,
        strategy: RecoveryStrategy,
        priority: RecoveryPriority,
    ) -> ScheduleOutcome {
        self.record_failure(operation_id.into(), reason.into(), strategy, priority, None)
    }

    /// [`schedule`](Self::schedule) for an operation that calls `dependency`.
    pub fn schedule_guarded(
        &self,
        operation_id: impl Into<OperationId>,
        reason: impl Into<String>,
        strategy: RecoveryStrategy,
        priority: RecoveryPriority,
        dependency: impl Into<String>,
    ) -> ScheduleOutcome {
        self.record_failure(
            operation_id.into(),
            reason.into(),
            strategy,
            priority,
            Some(dependency.into()),
        )
    }

    #[instrument(skip(self, operation_id, reason, dependency), fields(operation_id = %operation_id))]
    fn record_failure(
        &self,
        operation_id: OperationId,
        reason: String,
        strategy: RecoveryStrategy,
        priority: RecoveryPriority,
        dependency: Option<String>,
    ) -> ScheduleOutcome {
        let now = Utc::now();
        let mut state = self.lock();

        let task = state
            .tasks
            .entry(operation_id.clone())
            .or_insert_with(|| RecoveryTask {
                operation_id: operation_id.clone(),
                failure_reason: String::new(),
                strategy,
                priority,
                attempts: 0,
                next_eligible_at: None,
                dependency,
                state: TaskState::Pending,
                first_failed_at: now,
                last_failed_at: now,
                enqueue_seq: 0,
                generation: 0,
            });
        task.attempts = task.attempts.saturating_add(1);
        task.failure_reason = reason;
        task.last_failed_at = now;

        let attempts = task.attempts;
        let strategy = task.strategy;

        if attempts >= self.config.max_attempts {
            if let Some(mut task) = state.tasks.remove(&operation_id) {
                task.state = TaskState::Exhausted;
                task.next_eligible_at = None;
                warn!(
                    attempts,
                    reason = %task.failure_reason,
                    "Recovery attempts exhausted"
                );
                self.emit(RecoveryEvent::Exhausted {
                    operation_id,
                    attempts,
                    reason: task.failure_reason.clone(),
                });
                state.retire(task, self.config.exhausted_capacity);
            }
            return ScheduleOutcome::Exhausted { attempts };
        }

        let attempt = attempts.saturating_add(1);
        match self.strategies.delay_for(strategy, attempt) {
            Some(delay) => {
                state.enqueue(&operation_id, Instant::now() + delay);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Recovery scheduled");
                self.emit(RecoveryEvent::Scheduled {
                    operation_id,
                    attempt,
                    delay,
                });
                ScheduleOutcome::Scheduled { attempt, delay }
            }
            None => {
                if let Some(task) = state.tasks.get_mut(&operation_id) {
                    task.state = TaskState::AwaitingManual;
                    task.next_eligible_at = None;
                    task.generation += 1;
                }
                info!("Recovery awaiting manual trigger");
                self.emit(RecoveryEvent::AwaitingManual { operation_id });
                ScheduleOutcome::AwaitingManual
            }
        }
    }

    /// Release every task whose eligible time has passed.
    ///
    /// Returned tasks are `InFlight`, ordered by priority (highest first)
    /// then enqueue order. Tasks whose dependency circuit is open stay queued
    /// and are re-checked after `circuit_recheck_ms`.
    pub fn tick(&self) -> Vec<RecoveryTask> {
        let now = Instant::now();
        let mut state = self.lock();
        let QueueState { queue, tasks, .. } = &mut *state;

        let mut due = Vec::new();
        let mut deferred = Vec::new();

        while let Some(Reverse((eligible_at, _, _, _))) = queue.peek() {
            if *eligible_at > now {
                break;
            }
            let Some(Reverse((_, seq, generation, operation_id))) = queue.pop() else {
                break;
            };

            let Some(task) = tasks.get_mut(&operation_id) else {
                continue;
            };
            if task.generation != generation || task.state != TaskState::Pending {
                // Superseded by a later reschedule, trigger, or cancel.
                continue;
            }

            if let (Some(dependency), Some(breakers)) = (&task.dependency, &self.breakers) {
                if !breakers.is_healthy(dependency) {
                    let recheck_at = now + self.config.circuit_recheck();
                    task.next_eligible_at = Some(recheck_at);
                    deferred.push(Reverse((recheck_at, seq, generation, operation_id)));
                    continue;
                }
            }

            task.state = TaskState::InFlight;
            task.next_eligible_at = None;
            due.push(task.clone());
        }

        if !deferred.is_empty() {
            debug!(count = deferred.len(), "Recovery tasks held back by open circuits");
        }
        queue.extend(deferred);
        drop(state);

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueue_seq.cmp(&b.enqueue_seq))
        });

        for task in &due {
            self.emit(RecoveryEvent::Dispatched {
                operation_id: task.operation_id.clone(),
                attempt: task.next_attempt(),
            });
        }
        due
    }

    /// Stop tracking an operation that has recovered.
    pub fn mark_succeeded(&self, operation_id: &OperationId) -> ResilienceResult<()> {
        let removed = self.lock().tasks.remove(operation_id);
        match removed {
            Some(task) => {
                info!(
                    operation_id = %operation_id,
                    attempts = task.attempts,
                    "Operation recovered"
                );
                self.emit(RecoveryEvent::Succeeded {
                    operation_id: operation_id.clone(),
                });
                Ok(())
            }
            None => Err(ResilienceError::TaskNotFound(operation_id.clone())),
        }
    }

    /// Give up on an operation regardless of its remaining budget.
    pub fn mark_exhausted(&self, operation_id: &OperationId) -> ResilienceResult<RecoveryTask> {
        let mut state = self.lock();
        let mut task = state
            .tasks
            .remove(operation_id)
            .ok_or_else(|| ResilienceError::TaskNotFound(operation_id.clone()))?;
        task.state = TaskState::Exhausted;
        task.next_eligible_at = None;
        state.retire(task.clone(), self.config.exhausted_capacity);
        drop(state);

        warn!(operation_id = %operation_id, attempts = task.attempts, "Operation marked exhausted");
        self.emit(RecoveryEvent::Exhausted {
            operation_id: operation_id.clone(),
            attempts: task.attempts,
            reason: task.failure_reason.clone(),
        });
        Ok(task)
    }

    /// Drop a tracked operation. Returns whether it was tracked.
    pub fn cancel(&self, operation_id: &OperationId) -> bool {
        let removed = self.lock().tasks.remove(operation_id).is_some();
        if removed {
            info!(operation_id = %operation_id, "Recovery cancelled");
            self.emit(RecoveryEvent::Cancelled {
                operation_id: operation_id.clone(),
            });
        }
        removed
    }

    /// Make a waiting task eligible immediately.
    pub fn trigger(&self, operation_id: &OperationId) -> ResilienceResult<()> {
        let mut state = self.lock();
        let task_state = state
            .tasks
            .get(operation_id)
            .map(|task| task.state)
            .ok_or_else(|| ResilienceError::TaskNotFound(operation_id.clone()))?;

        match task_state {
            TaskState::AwaitingManual | TaskState::Pending => {
                state.enqueue(operation_id, Instant::now());
                info!(operation_id = %operation_id, "Recovery triggered");
                Ok(())
            }
            other => Err(ResilienceError::InvalidTaskState {
                operation_id: operation_id.clone(),
                state: other.to_string(),
                action: "trigger",
            }),
        }
    }

    /// Current view of an operation, including exhausted ones.
    pub fn status(&self, operation_id: &OperationId) -> Option<RecoveryTask> {
        let state = self.lock();
        state.tasks.get(operation_id).cloned().or_else(|| {
            state
                .exhausted
                .iter()
                .rev()
                .find(|task| &task.operation_id == operation_id)
                .cloned()
        })
    }

    /// Tasks waiting to run, whether on a timer or a manual trigger.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|task| matches!(task.state, TaskState::Pending | TaskState::AwaitingManual))
            .count()
    }

    /// Most recently exhausted tasks, oldest first, up to
    /// `exhausted_capacity`.
    pub fn exhausted(&self) -> Vec<RecoveryTask> {
        self.lock().exhausted.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Run released tasks through `executor` every `worker_interval_ms`
    /// until `cancellation` fires.
    pub fn spawn_worker(
        self: &Arc<Self>,
        executor: Arc<dyn RecoveryExecutor>,
        cancellation: Cancellation,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.worker_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Recovery worker started");

            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for task in orchestrator.tick() {
                    orchestrator.run(executor.as_ref(), task).await;
                }
            }

            info!("Recovery worker stopped");
        })
    }

    async fn run(&self, executor: &dyn RecoveryExecutor, task: RecoveryTask) {
        let result = executor.execute(&task).await;

        if let (Some(dependency), Some(breakers)) = (&task.dependency, &self.breakers) {
            match &result {
                Ok(()) => breakers.record_success(dependency),
                Err(_) => breakers.record_failure(dependency),
            }
        }

        match result {
            Ok(()) => {
                // Cancelled while in flight is fine.
                let _ = self.mark_succeeded(&task.operation_id);
            }
            Err(e) => {
                self.record_failure(
                    task.operation_id,
                    e.to_string(),
                    task.strategy,
                    task.priority,
                    task.dependency,
                );
            }
        }
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
