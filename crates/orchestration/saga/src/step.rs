//! Saga steps.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

/// What an action or compensation sees: the saga input plus the outputs of
/// every step completed so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInput {
    pub input: Value,
    pub outputs: BTreeMap<String, Value>,
}

impl StepInput {
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }
}

pub(crate) type StepFn<C> =
    Arc<dyn Fn(Arc<C>, StepInput) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

fn boxed<C, F, Fut>(f: F) -> StepFn<C>
where
    F: Fn(Arc<C>, StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |ctx, input| Box::pin(f(ctx, input)))
}

/// A forward action with an optional compensating action.
///
/// Compensations may run more than once across retries of a rollback and
/// must be safe to repeat.
pub struct SagaStep<C> {
    pub(crate) name: String,
    pub(crate) action: StepFn<C>,
    pub(crate) compensation: Option<StepFn<C>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) guard: Option<String>,
}

impl<C> SagaStep<C> {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Arc<C>, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: boxed(action),
            compensation: None,
            timeout: None,
            guard: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(Arc<C>, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.compensation = Some(boxed(compensation));
        self
    }

    /// Deadline for the action and for its compensation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Refuse the action while `dependency`'s circuit is open and record its
    /// outcome against the breaker.
    pub fn guarded_by(mut self, dependency: impl Into<String>) -> Self {
        self.guard = Some(dependency.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }
}
