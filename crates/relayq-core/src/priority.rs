use crate::{QueueError, Result};
use serde::{Deserialize, Serialize};

/// Task priority. Valid values are 1..=10; 10 is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;
    pub const DEFAULT: u8 = 5;

    /// Create a validated priority value.
    pub fn new(value: u8) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(QueueError::InvalidInput(format!(
                "priority must be in {}..={}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )));
        }
        Ok(Priority(value))
    }

    /// Get the raw priority value.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Ordered-set score: negated so the minimum score is the most urgent task.
    pub fn score(&self) -> i64 {
        -(self.0 as i64)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(Self::DEFAULT)
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
