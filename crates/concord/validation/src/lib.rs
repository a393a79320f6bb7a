//! Concord Validation - every message passes here before delivery
//!
//! A message is deliverable only if the merged verdict of every configured
//! strategy is valid. Strategies read the message and never mutate it.
//!
//! - [`StaticHashStrategy`]: the message carries the configured policy commitment
//! - [`ExpiryStrategy`]: the message has not outlived its expiry
//! - [`DynamicPolicyStrategy`]: an external [`PolicyBackend`] allows the message
//! - [`CompositeStrategy`]: runs all of the above in order and merges the results

#![deny(unsafe_code)]

pub mod error;
pub mod expiry;
pub mod mocks;
pub mod pipeline;
pub mod policy;
pub mod static_hash;
pub mod strategy;

pub use error::PolicyError;
pub use expiry::ExpiryStrategy;
pub use pipeline::build_pipeline;
pub use policy::{DynamicPolicyStrategy, PolicyBackend, PolicyDecision, PolicyRequest, POLICY_BACKEND};
pub use static_hash::StaticHashStrategy;
pub use strategy::{CompositeStrategy, ValidationStrategy};
