//! Resource budget tracking for one research task.
//!
//! The budget spans three dimensions: refinement iterations, wall-clock
//! time, and total tokens. Consumption counters only ever increase for
//! the lifetime of a task; there is deliberately no reset. Wall-clock
//! reads go through a `Clock` seam so budget behavior is deterministic
//! under test.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::BudgetConfig;
use crate::types::TokenUsage;

/// Hard limits for one task. A zero limit means unlimited for that
/// dimension.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub max_iterations: usize,
    pub max_wall_clock: Duration,
    pub tokens_limit: u64,
}

impl Budget {
    pub fn new(max_iterations: usize, max_wall_clock: Duration, tokens_limit: u64) -> Self {
        Self {
            max_iterations,
            max_wall_clock,
            tokens_limit,
        }
    }

    pub fn from_config(config: &BudgetConfig, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            max_wall_clock: Duration::from_secs(config.max_wall_clock_secs),
            tokens_limit: config.tokens_limit,
        }
    }
}

impl Default for Budget {
    /// Unlimited on every dimension.
    fn default() -> Self {
        Self::new(0, Duration::ZERO, 0)
    }
}

/// Source of monotonic time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time from a fixed origin.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.ms
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Tracks consumption against a `Budget`.
///
/// Shared across concurrent pipeline branches behind an `Arc`; all
/// counters are atomic and merge-safe, so recording from parallel
/// section synthesis or candidate generation needs no locking.
pub struct BudgetManager {
    budget: Budget,
    clock: Arc<dyn Clock>,
    started_ms: u64,
    iterations: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl BudgetManager {
    pub fn new(budget: Budget) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(budget: Budget, clock: Arc<dyn Clock>) -> Self {
        let started_ms = clock.now_ms();
        Self {
            budget,
            clock,
            started_ms,
            iterations: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Record usage after an LLM call completes.
    pub fn record_usage(&self, usage: TokenUsage) {
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::SeqCst);
    }

    /// Record the start of one refinement iteration.
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn tokens_consumed(&self) -> u64 {
        self.usage().total()
    }

    /// Accumulated usage split by direction.
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::SeqCst),
            output_tokens: self.output_tokens.load(Ordering::SeqCst),
        }
    }

    pub fn iterations_used(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.clock.now_ms().saturating_sub(self.started_ms))
    }

    fn iterations_remaining(&self) -> bool {
        self.budget.max_iterations == 0
            || self.iterations_used() < self.budget.max_iterations as u64
    }

    fn wall_clock_remaining(&self) -> bool {
        self.budget.max_wall_clock.is_zero() || self.elapsed() < self.budget.max_wall_clock
    }

    fn tokens_remaining(&self) -> bool {
        self.budget.tokens_limit == 0 || self.tokens_consumed() < self.budget.tokens_limit
    }

    /// Whether wall-clock or token resources are used up. Iteration
    /// count is deliberately excluded: hitting the iteration cap is
    /// reported as its own terminal state, not as budget exhaustion.
    pub fn resources_exhausted(&self) -> bool {
        !self.wall_clock_remaining() || !self.tokens_remaining()
    }

    /// Whether another refinement iteration may start: iterations,
    /// wall-clock, and tokens must all have headroom.
    pub fn can_afford_refinement(&self) -> bool {
        self.iterations_remaining() && self.wall_clock_remaining() && self.tokens_remaining()
    }

    /// The most constrained remaining fraction across all three
    /// dimensions, in 0.0..=1.0. Unlimited dimensions count as full.
    pub fn remaining_ratio(&self) -> f32 {
        let iter_ratio = if self.budget.max_iterations == 0 {
            1.0
        } else {
            let max = self.budget.max_iterations as f32;
            ((max - self.iterations_used() as f32) / max).max(0.0)
        };

        let clock_ratio = if self.budget.max_wall_clock.is_zero() {
            1.0
        } else {
            let max = self.budget.max_wall_clock.as_millis() as f32;
            ((max - self.elapsed().as_millis() as f32) / max).max(0.0)
        };

        let token_ratio = if self.budget.tokens_limit == 0 {
            1.0
        } else {
            let max = self.budget.tokens_limit as f32;
            ((max - self.tokens_consumed() as f32) / max).max(0.0)
        };

        iter_ratio.min(clock_ratio).min(token_ratio)
    }
}
