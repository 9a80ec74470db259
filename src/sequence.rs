//! Registration number allocation.
//!
//! Normal allocation goes through an atomic counter owned by the persistence
//! layer (a Postgres sequence in production). Operators may also supply a
//! number directly for corrections; that path performs no uniqueness check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("registration sequence unavailable: {0}")]
    Unavailable(String),
    #[error("registration sequence returned invalid value {0}")]
    InvalidValue(i64),
    #[error("explicit registration number must not be empty")]
    EmptyExplicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationNumber(String);

impl RegistrationNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RegistrationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Printed shape of allocated numbers, e.g. `REG-00042`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFormat {
    pub prefix: String,
    pub width: usize,
}

impl Default for RegistrationFormat {
    fn default() -> Self {
        Self {
            prefix: "REG-".to_string(),
            width: 5,
        }
    }
}

impl RegistrationFormat {
    pub fn format(&self, value: u64) -> RegistrationNumber {
        RegistrationNumber(format!(
            "{}{:0width$}",
            self.prefix,
            value,
            width = self.width
        ))
    }

    /// Whether `number` looks like something this format produces.
    pub fn matches(&self, number: &str) -> bool {
        match number.strip_prefix(self.prefix.as_str()) {
            Some(digits) => {
                digits.len() >= self.width
                    && !digits.is_empty()
                    && digits.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }
}

/// Source of raw sequence values. Implementations must be atomic across
/// concurrent callers; read-then-increment is not acceptable.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn next_value(&self) -> Result<i64, AllocationError>;
}

/// Issues registration numbers from a [`SequenceSource`].
pub struct SequenceAllocator {
    source: std::sync::Arc<dyn SequenceSource>,
    format: RegistrationFormat,
}

impl SequenceAllocator {
    pub fn new(source: std::sync::Arc<dyn SequenceSource>, format: RegistrationFormat) -> Self {
        Self { source, format }
    }

    pub async fn allocate(&self) -> Result<RegistrationNumber, AllocationError> {
        let value = self.source.next_value().await?;
        if value <= 0 {
            return Err(AllocationError::InvalidValue(value));
        }
        let number = self.format.format(value as u64);
        log::debug!("Allocated registration number {}", number);
        Ok(number)
    }

    /// Accept an operator-supplied number verbatim.
    pub fn accept(&self, explicit: &str) -> Result<RegistrationNumber, AllocationError> {
        let trimmed = explicit.trim();
        if trimmed.is_empty() {
            return Err(AllocationError::EmptyExplicit);
        }
        Ok(RegistrationNumber(trimmed.to_string()))
    }
}
