use tracing::warn;

/// Decision returned by the retry policy after a fix attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Config valid and the gateway came back up.
    Fixed,
    /// Attempt failed; run another (includes the 1-based attempt number).
    Retry { attempt: u32 },
    /// Budget spent without a fix.
    Exhausted,
}

/// Bounds the number of repair-agent calls within one run.
///
/// Every attempt counts against the budget, whether it failed at the agent,
/// at config validation, or at restart verification.
pub struct RetryPolicy {
    max_attempts: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Claim the first attempt. `None` when the budget is zero.
    pub fn first(&mut self) -> Option<u32> {
        if self.current_attempt > 0 || self.max_attempts == 0 {
            return None;
        }
        self.current_attempt = 1;
        Some(1)
    }

    /// Evaluate the attempt that just finished and decide what to do next.
    pub fn evaluate(&mut self, config_valid: bool, restart_succeeded: bool) -> RetryDecision {
        if config_valid && restart_succeeded {
            return RetryDecision::Fixed;
        }

        if self.current_attempt < self.max_attempts {
            self.current_attempt += 1;
            warn!(
                config_valid,
                restart_succeeded,
                next_attempt = self.current_attempt,
                max_attempts = self.max_attempts,
                "fix attempt failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
            }
        } else {
            warn!(max_attempts = self.max_attempts, "fix attempts exhausted");
            RetryDecision::Exhausted
        }
    }

    /// Attempts claimed so far (0 = none).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
