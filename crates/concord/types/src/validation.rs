//! Validation verdicts.
//!
//! Each validation strategy produces one [`ValidationResult`] per message;
//! results are folded together with [`ValidationResult::merge`]. Merging is
//! associative and, with respect to validity and the error multiset,
//! commutative, so strategy order never changes the final verdict.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Final decision label attached to a validation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("ALLOW"),
            Decision::Deny => f.write_str("DENY"),
        }
    }
}

/// Outcome of validating a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub decision: Decision,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

impl ValidationResult {
    /// A passing result with no findings.
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            decision: Decision::Allow,
            metadata: BTreeMap::new(),
        }
    }

    /// A failing result carrying a single error.
    pub fn invalid(error: impl Into<String>) -> Self {
        let mut result = Self::valid();
        result.add_error(error);
        result
    }

    /// Record an error; any error makes the result invalid.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.is_valid = false;
        self.decision = Decision::Deny;
    }

    /// Record a warning; warnings never affect validity.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.add_warning(warning);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Fold `other` into `self`.
    ///
    /// Invalid if either side is invalid; errors and warnings concatenate;
    /// metadata keys from `other` overwrite keys already present.
    pub fn merge(&mut self, other: ValidationResult) {
        self.is_valid = self.is_valid && other.is_valid && other.errors.is_empty();
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.metadata.extend(other.metadata);
        if !self.errors.is_empty() {
            self.is_valid = false;
        }
        self.decision = if self.is_valid {
            Decision::Allow
        } else {
            Decision::Deny
        };
    }

    /// Non-mutating form of [`ValidationResult::merge`].
    pub fn merged(mut self, other: ValidationResult) -> Self {
        self.merge(other);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.is_valid && self.decision == Decision::Allow
    }
}
