//! Retry state and exponential backoff for a single dispatch

use std::future::Future;
use std::time::Duration;
use log::{debug, warn};
use crate::config::RetryConfig;

/// Where a dispatch-with-retry call currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase
{   Idle
  , Sending
  , RetryWait
  , Succeeded
  , Failed
}

/// Retry bookkeeping for one dispatch call. Lives only as long as
/// that call; records each backoff it waited.
#[derive(Debug, Clone)]
pub struct RetryState
{   /// Zero-based index of the current attempt
    pub attempt: usize
  , pub max_attempts: usize
  , pub base_delay: Duration
  , phase: DispatchPhase
  , waits: Vec<Duration>
}

impl RetryState
{   pub fn new(
      max_attempts: usize
    , base_delay: Duration
    ) -> Self
    {   RetryState
        {   attempt: 0
          , max_attempts: max_attempts.max(1)
          , base_delay
          , phase: DispatchPhase::Idle
          , waits: Vec::new()
        }
    }

    /// `base_delay * 2^attempt`
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration
    {   let factor = 1u32
          .checked_shl(attempt.min(31) as u32)
          .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn has_attempts_left(&self) -> bool
    {   self.attempt + 1 < self.max_attempts
    }

    /// Total attempts made so far
    pub fn attempts_made(&self) -> usize
    {   match self.phase
        {   DispatchPhase::Idle => 0
          , _ => self.attempt + 1
        }
    }

    pub fn phase(&self) -> DispatchPhase
    {   self.phase
    }

    /// Backoff waits taken, in order
    pub fn waits(&self) -> &[Duration]
    {   &self.waits
    }
}

impl From<&RetryConfig> for RetryState
{   fn from(config: &RetryConfig) -> Self
    {   RetryState::new(config.max_attempts, config.base_delay())
    }
}

impl Default for RetryState
{   fn default() -> Self
    {   RetryState::from(&RetryConfig::default())
    }
}

/// Drive `op` through Sending / RetryWait until it succeeds, fails
/// terminally, or runs out of attempts. Only errors for which
/// `Error::is_retryable` holds are retried; the last error is
/// returned unchanged.
pub async fn run_with_retry<T, F, Fut>(
  state: &mut RetryState
, mut op: F
) -> crate::Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = crate::Result<T>>,
{   loop
    {   state.phase = DispatchPhase::Sending;
        debug!(
          "Attempt {}/{}",
          state.attempt + 1, state.max_attempts
        );

        match op().await
        {   Ok(value) => {
              state.phase = DispatchPhase::Succeeded;
              return Ok(value);
            }
          , Err(e) if e.is_retryable() && state.has_attempts_left() => {
              let delay = state.backoff_for_attempt(state.attempt);
              warn!(
                "{}; retrying in {:?} (attempt {}/{})",
                e, delay, state.attempt + 1, state.max_attempts
              );
              state.phase = DispatchPhase::RetryWait;
              state.waits.push(delay);
              tokio::time::sleep(delay).await;
              state.attempt += 1;
            }
          , Err(e) => {
              if e.is_retryable()
              {   warn!(
                    "Giving up after {} attempts: {}",
                    state.attempt + 1, e
                  );
              } else
              {   debug!("Terminal failure, not retrying: {}", e);
              }
              state.phase = DispatchPhase::Failed;
              return Err(e);
            }
        }
    }
}
