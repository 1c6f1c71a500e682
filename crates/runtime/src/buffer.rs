//! Adaptive buffer manager
//!
//! Underrun and overrun notifications accumulate in counters. `adjust` turns that
//! pressure into at most one step per cooldown window.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tunebridge_core::{AudioConfig, MAX_BUFFER_MS, MIN_BUFFER_MS};

#[derive(Debug, Clone, PartialEq)]
pub struct BufferPolicy {
    pub adaptive: bool,
    pub step_ms: u32,
    pub cooldown: Duration,
    pub underrun_threshold: u32,
    pub overrun_threshold: u32,
    /// Reset counters when the cooldown suppresses an adjustment
    pub suppressed_resets_counters: bool,
}

impl From<&AudioConfig> for BufferPolicy {
    fn from(config: &AudioConfig) -> Self {
        Self {
            adaptive: config.adaptive_buffering,
            step_ms: config.buffer_step_ms,
            cooldown: Duration::from_millis(config.buffer_cooldown_ms),
            underrun_threshold: config.underrun_threshold,
            overrun_threshold: config.overrun_threshold,
            suppressed_resets_counters: config.suppressed_resets_counters,
        }
    }
}

/// Live buffer state owned by the control task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferState {
    pub current_ms: u32,
    pub min_ms: u32,
    pub max_ms: u32,
    /// Pending counts since the last adjustment
    pub underrun_count: u32,
    pub overrun_count: u32,
    /// Lifetime totals for reporting
    pub total_underruns: u64,
    pub total_overruns: u64,
    pub adjustments: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAdjustment {
    Increased { from: u32, to: u32 },
    Decreased { from: u32, to: u32 },
    /// Pressure was present but the cooldown has not expired
    Suppressed,
    NoChange,
}

pub struct AdaptiveBufferManager {
    state: BufferState,
    policy: BufferPolicy,
    last_adjustment: Option<Instant>,
}

impl AdaptiveBufferManager {
    /// Start at the configured minimum
    pub fn new(config: &AudioConfig) -> Self {
        let (min_ms, max_ms) = normalize_bounds(config.min_buffer_ms, config.max_buffer_ms);
        Self {
            state: BufferState {
                current_ms: min_ms,
                min_ms,
                max_ms,
                underrun_count: 0,
                overrun_count: 0,
                total_underruns: 0,
                total_overruns: 0,
                adjustments: 0,
            },
            policy: BufferPolicy::from(config),
            last_adjustment: None,
        }
    }

    pub fn state(&self) -> &BufferState {
        &self.state
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    pub fn current_ms(&self) -> u32 {
        self.state.current_ms
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.state.min_ms, self.state.max_ms)
    }

    pub fn record_underrun(&mut self) {
        self.state.underrun_count = self.state.underrun_count.saturating_add(1);
        self.state.total_underruns += 1;
    }

    pub fn record_overrun(&mut self) {
        self.state.overrun_count = self.state.overrun_count.saturating_add(1);
        self.state.total_overruns += 1;
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_adjustment
            .is_some_and(|last| now.saturating_duration_since(last) < self.policy.cooldown)
    }

    /// Apply at most one step if pressure exceeds a threshold and the cooldown allows it
    pub fn adjust(&mut self, now: Instant) -> BufferAdjustment {
        if !self.policy.adaptive {
            return BufferAdjustment::NoChange;
        }

        let state = &self.state;
        let grow = state.underrun_count > self.policy.underrun_threshold && state.current_ms < state.max_ms;
        let shrink = state.overrun_count > self.policy.overrun_threshold && state.current_ms > state.min_ms;
        if !grow && !shrink {
            return BufferAdjustment::NoChange;
        }

        if self.in_cooldown(now) {
            if self.policy.suppressed_resets_counters {
                self.state.underrun_count = 0;
                self.state.overrun_count = 0;
            }
            debug!("Buffer adjustment suppressed by cooldown");
            return BufferAdjustment::Suppressed;
        }

        let from = self.state.current_ms;
        let adjustment = if grow {
            self.state.current_ms = from.saturating_add(self.policy.step_ms).min(self.state.max_ms);
            self.state.underrun_count = 0;
            BufferAdjustment::Increased {
                from,
                to: self.state.current_ms,
            }
        } else {
            self.state.current_ms = from.saturating_sub(self.policy.step_ms).max(self.state.min_ms);
            self.state.overrun_count = 0;
            BufferAdjustment::Decreased {
                from,
                to: self.state.current_ms,
            }
        };

        self.state.adjustments += 1;
        self.last_adjustment = Some(now);
        info!("Buffer {} -> {}ms", from, self.state.current_ms);
        adjustment
    }

    /// Replace the bounds; returns the bounds actually applied
    ///
    /// Swaps an inverted pair, clamps both ends to the global range and re-clamps the
    /// current size. Applying the same bounds twice leaves the same state.
    pub fn set_bounds(&mut self, min_ms: u32, max_ms: u32) -> (u32, u32) {
        let (min_ms, max_ms) = normalize_bounds(min_ms, max_ms);
        self.state.min_ms = min_ms;
        self.state.max_ms = max_ms;
        self.state.current_ms = self.state.current_ms.clamp(min_ms, max_ms);
        debug!("Buffer bounds set to {}-{}ms (current {}ms)", min_ms, max_ms, self.state.current_ms);
        (min_ms, max_ms)
    }

    /// Return to the configured start state, clearing the cooldown
    pub fn reset(&mut self, config: &AudioConfig) {
        *self = Self::new(config);
    }
}

/// Swap an inverted pair and clamp to the global range
pub fn normalize_bounds(min_ms: u32, max_ms: u32) -> (u32, u32) {
    let (lo, hi) = if min_ms > max_ms { (max_ms, min_ms) } else { (min_ms, max_ms) };
    (lo.clamp(MIN_BUFFER_MS, MAX_BUFFER_MS), hi.clamp(MIN_BUFFER_MS, MAX_BUFFER_MS))
}
