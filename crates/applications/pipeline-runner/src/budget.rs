//! Retry budget
//!
//! Attempts are split between two pools. The preemptible pool is always
//! drained first; the non-preemptible pool is the last resort.

use pipeline_core::{ExecutionMode, PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Remaining attempts per execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    preemptible_remaining: u32,
    non_preemptible_remaining: u32,
}

impl RetryBudget {
    /// Create a budget. Zero total attempts is a configuration error.
    pub fn new(preemptible: u32, non_preemptible: u32) -> Result<Self> {
        if preemptible == 0 && non_preemptible == 0 {
            return Err(PipelineError::config(
                "retry budget is empty: set PREEMPTIBLE_TRIES > 0 or NONPREEMPTIBLE_TRY",
            ));
        }
        Ok(Self {
            preemptible_remaining: preemptible,
            non_preemptible_remaining: non_preemptible,
        })
    }

    /// Budget from `PREEMPTIBLE_TRIES` and `NONPREEMPTIBLE_TRY`
    pub fn from_tries(preemptible_tries: u32, nonpreemptible_try: bool) -> Result<Self> {
        Self::new(preemptible_tries, u32::from(nonpreemptible_try))
    }

    /// Consume one attempt, returning the mode to run it in.
    ///
    /// Returns `None` once both pools are empty.
    pub fn next_mode(&mut self) -> Option<ExecutionMode> {
        if self.preemptible_remaining > 0 {
            self.preemptible_remaining -= 1;
            Some(ExecutionMode::Preemptible)
        } else if self.non_preemptible_remaining > 0 {
            self.non_preemptible_remaining -= 1;
            Some(ExecutionMode::NonPreemptible)
        } else {
            None
        }
    }

    pub fn preemptible_remaining(&self) -> u32 {
        self.preemptible_remaining
    }

    pub fn non_preemptible_remaining(&self) -> u32 {
        self.non_preemptible_remaining
    }

    /// Attempts left across both pools
    pub fn remaining(&self) -> u32 {
        self.preemptible_remaining + self.non_preemptible_remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preemptible_before_non_preemptible() {
        let mut budget = RetryBudget::new(2, 1).unwrap();

        assert_eq!(budget.next_mode(), Some(ExecutionMode::Preemptible));
        assert_eq!(budget.next_mode(), Some(ExecutionMode::Preemptible));
        assert_eq!(budget.next_mode(), Some(ExecutionMode::NonPreemptible));
        assert_eq!(budget.next_mode(), None);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_exhausted_budget_stays_exhausted() {
        let mut budget = RetryBudget::new(0, 1).unwrap();
        assert_eq!(budget.next_mode(), Some(ExecutionMode::NonPreemptible));
        for _ in 0..3 {
            assert_eq!(budget.next_mode(), None);
            assert_eq!(budget.remaining(), 0);
        }
    }

    #[test]
    fn test_counters_never_increase() {
        let mut budget = RetryBudget::new(3, 1).unwrap();
        let mut last = (budget.preemptible_remaining(), budget.non_preemptible_remaining());
        while budget.next_mode().is_some() {
            let now = (budget.preemptible_remaining(), budget.non_preemptible_remaining());
            assert!(now.0 <= last.0 && now.1 <= last.1);
            assert!(now.0 + now.1 < last.0 + last.1);
            last = now;
        }
    }

    #[test]
    fn test_empty_budget_is_config_error() {
        let err = RetryBudget::new(0, 0).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(RetryBudget::from_tries(0, false).is_err());
    }

    #[test]
    fn test_from_tries() {
        let budget = RetryBudget::from_tries(2, true).unwrap();
        assert_eq!(budget.preemptible_remaining(), 2);
        assert_eq!(budget.non_preemptible_remaining(), 1);

        let budget = RetryBudget::from_tries(4, false).unwrap();
        assert_eq!(budget.non_preemptible_remaining(), 0);
        assert_eq!(budget.remaining(), 4);
    }
}
