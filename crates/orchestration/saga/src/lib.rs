//! Concord Saga - compensating transactions over multi-step workflows
//!
//! A saga runs its steps strictly in registration order. When a step fails,
//! times out, finds its circuit open, or is reached after cancellation, every
//! step that already succeeded is compensated in reverse order. Compensation
//! failures are reported alongside the triggering failure and never stop the
//! remaining compensations.
//!
//! [`SagaTransaction`] keeps the bookkeeping of executed and compensated steps,
//! so a partially failed rollback can be retried without undoing anything
//! twice.

#![deny(unsafe_code)]

pub mod coordinator;
pub mod error;
pub mod step;

pub use coordinator::{SagaCompletion, SagaCoordinator, SagaId, SagaState, SagaTransaction};
pub use error::{CompensationFailure, SagaError, SagaResult, StepFailure, StepFailureKind};
pub use step::{SagaStep, StepInput};
