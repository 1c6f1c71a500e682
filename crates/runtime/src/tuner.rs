//! Auto-tuner
//!
//! Turns tuning conditions into configuration deltas and applies them to the buffer
//! manager and the worker pool. Deltas carry absolute targets, are validated as a
//! whole before anything changes, and every application is kept as a decision.

use crate::buffer::AdaptiveBufferManager;
use crate::workers::WorkerPool;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunebridge_core::{
    BridgeError, DecisionOutcome, NetworkQuality, Optimization, ProcessingQuality, Result, TuningCondition,
    TuningConfig, TuningDecision, TuningTrigger, MAX_BUFFER_MS, MIN_BUFFER_MS,
};

/// Read-only view of the tunable state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningContext {
    pub buffer_min_ms: u32,
    pub buffer_max_ms: u32,
    pub buffer_step_ms: u32,
    pub workers: usize,
    pub recommended_workers: usize,
    pub worker_limit: usize,
    pub quality: ProcessingQuality,
    pub network_quality: NetworkQuality,
}

/// Mutable handles to the subsystems a delta may touch
pub struct TuningTargets<'a> {
    pub buffer: &'a mut AdaptiveBufferManager,
    pub pool: &'a mut WorkerPool,
}

impl TuningTargets<'_> {
    fn would_change(&self, delta: &Optimization) -> bool {
        match delta {
            Optimization::IncreaseBuffer { new_min, new_max } | Optimization::ReduceBuffer { new_min, new_max } => {
                self.buffer.bounds() != (*new_min, *new_max)
            }
            Optimization::SetWorkers { workers } => self.pool.workers() != *workers,
            Optimization::SetProcessingQuality { quality } => self.pool.quality() != *quality,
        }
    }

    fn apply(&mut self, delta: &Optimization) {
        match delta {
            Optimization::IncreaseBuffer { new_min, new_max } | Optimization::ReduceBuffer { new_min, new_max } => {
                self.buffer.set_bounds(*new_min, *new_max);
            }
            Optimization::SetWorkers { workers } => self.pool.resize(*workers),
            Optimization::SetProcessingQuality { quality } => self.pool.set_quality(*quality),
        }
    }
}

pub struct AutoTuner {
    policy: TuningConfig,
    enabled: bool,
    paused: bool,
    consecutive_failures: u32,
    /// Instant of the last applied automatic decision
    last_auto_applied: Option<Instant>,
    history: VecDeque<TuningDecision>,
    next_id: u64,
    worker_limit: usize,
    recommended_workers: usize,
}

impl AutoTuner {
    /// `worker_limit` is the largest worker count a delta may request
    pub fn new(policy: TuningConfig, worker_limit: usize, recommended_workers: usize) -> Self {
        Self {
            enabled: policy.auto_tuning,
            policy,
            paused: false,
            consecutive_failures: 0,
            last_auto_applied: None,
            history: VecDeque::new(),
            next_id: 1,
            worker_limit,
            recommended_workers,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn history(&self) -> impl Iterator<Item = &TuningDecision> {
        self.history.iter()
    }

    pub fn last_decision(&self) -> Option<&TuningDecision> {
        self.history.back()
    }

    /// Enable or disable automatic tuning; enabling also lifts a failure pause
    pub fn set_auto_tuning(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            self.paused = false;
            self.consecutive_failures = 0;
        }
        info!("Auto-tuning {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn context(&self, targets: &TuningTargets<'_>, network_quality: NetworkQuality) -> TuningContext {
        let (buffer_min_ms, buffer_max_ms) = targets.buffer.bounds();
        TuningContext {
            buffer_min_ms,
            buffer_max_ms,
            buffer_step_ms: targets.buffer.policy().step_ms,
            workers: targets.pool.workers(),
            recommended_workers: self.recommended_workers,
            worker_limit: self.worker_limit,
            quality: targets.pool.quality(),
            network_quality,
        }
    }

    /// Global gate for automatic tuning, independent of the buffer cooldown
    pub fn should_trigger_auto_tuning(&self, condition: TuningCondition, now: Instant) -> bool {
        if !self.enabled || self.paused {
            return false;
        }
        let cooldown = Duration::from_millis(self.policy.cooldown_ms);
        if let Some(last) = self.last_auto_applied {
            if now.saturating_duration_since(last) < cooldown {
                debug!("Tuning for {} held back by cooldown", condition.as_str());
                return false;
            }
        }
        true
    }

    /// Candidate deltas for `condition`, best first; nothing is mutated
    pub fn calculate_optimizations(&self, condition: TuningCondition, context: &TuningContext) -> Vec<Optimization> {
        let step = context.buffer_step_ms.max(1);
        let grow = |min_step: u32, max_step: u32| Optimization::IncreaseBuffer {
            new_min: context.buffer_min_ms.saturating_add(min_step).min(MAX_BUFFER_MS),
            new_max: context.buffer_max_ms.saturating_add(max_step).min(MAX_BUFFER_MS),
        };

        let mut candidates = Vec::new();
        match condition {
            TuningCondition::HighCpu => {
                if context.workers > 0 {
                    candidates.push(Optimization::SetWorkers {
                        workers: context.workers - 1,
                    });
                }
                candidates.push(Optimization::SetProcessingQuality {
                    quality: ProcessingQuality::Reduced,
                });
            }
            TuningCondition::HighMemory => {
                let new_min = context.buffer_min_ms.saturating_sub(step).max(MIN_BUFFER_MS);
                let new_max = context.buffer_max_ms.saturating_sub(2 * step).max(new_min);
                candidates.push(Optimization::ReduceBuffer { new_min, new_max });
                candidates.push(Optimization::SetWorkers {
                    workers: context.workers / 2,
                });
            }
            TuningCondition::AudioDropouts | TuningCondition::BufferUnderruns => {
                candidates.push(grow(step, 2 * step));
            }
            TuningCondition::PoorNetwork => {
                let (min_step, max_step) = if context.network_quality == NetworkQuality::Poor {
                    (2 * step, 4 * step)
                } else {
                    (step, 2 * step)
                };
                candidates.push(grow(min_step, max_step));
            }
            TuningCondition::DeviceUnreliable => {
                candidates.push(grow(step, step));
            }
            TuningCondition::LowPerformance => {
                candidates.push(Optimization::SetProcessingQuality {
                    quality: ProcessingQuality::Reduced,
                });
                candidates.push(Optimization::SetWorkers {
                    workers: context.recommended_workers.min(context.worker_limit),
                });
            }
        }
        candidates
    }

    /// Check a delta against the global limits without touching anything
    pub fn validate(&self, delta: &Optimization) -> Result<()> {
        match delta {
            Optimization::IncreaseBuffer { new_min, new_max } | Optimization::ReduceBuffer { new_min, new_max } => {
                let range = MIN_BUFFER_MS..=MAX_BUFFER_MS;
                if !range.contains(new_min) || !range.contains(new_max) {
                    return Err(BridgeError::TuningApplication(format!(
                        "buffer bounds {}-{} outside {}-{}",
                        new_min, new_max, MIN_BUFFER_MS, MAX_BUFFER_MS
                    )));
                }
                if new_min > new_max {
                    return Err(BridgeError::TuningApplication(format!(
                        "buffer minimum {} above maximum {}",
                        new_min, new_max
                    )));
                }
            }
            Optimization::SetWorkers { workers } => {
                if *workers > self.worker_limit {
                    return Err(BridgeError::TuningApplication(format!(
                        "{} workers above the limit of {}",
                        workers, self.worker_limit
                    )));
                }
            }
            Optimization::SetProcessingQuality { .. } => {}
        }
        Ok(())
    }

    /// Validate then apply a set of deltas as one decision
    ///
    /// Deltas that would not change state are dropped first; if none remain nothing is
    /// recorded and `None` is returned. A rejected set leaves every subsystem as it was.
    pub fn apply_optimization(
        &mut self,
        trigger: TuningTrigger,
        deltas: Vec<Optimization>,
        targets: &mut TuningTargets<'_>,
        now: Instant,
    ) -> Option<TuningDecision> {
        let effective: Vec<Optimization> = deltas.into_iter().filter(|d| targets.would_change(d)).collect();
        if effective.is_empty() {
            debug!("Tuning for {} skipped, nothing would change", trigger.tag());
            return None;
        }

        let outcome = match effective.iter().try_for_each(|d| self.validate(d)) {
            Ok(()) => {
                for delta in &effective {
                    targets.apply(delta);
                }
                DecisionOutcome::Applied
            }
            Err(e) => DecisionOutcome::Failed(e.to_string()),
        };

        let decision = TuningDecision {
            id: self.next_id,
            trigger,
            timestamp: chrono::Utc::now(),
            at: now,
            deltas: effective,
            outcome,
        };
        self.next_id += 1;
        self.record(&decision);
        Some(decision)
    }

    fn record(&mut self, decision: &TuningDecision) {
        let automatic = matches!(decision.trigger, TuningTrigger::Auto(_));
        match &decision.outcome {
            DecisionOutcome::Applied => {
                info!("Tuning decision #{} ({}) applied: {:?}", decision.id, decision.trigger.tag(), decision.deltas);
                if automatic {
                    self.last_auto_applied = Some(decision.at);
                    self.consecutive_failures = 0;
                }
            }
            DecisionOutcome::Failed(reason) => {
                warn!("Tuning decision #{} ({}) failed: {}", decision.id, decision.trigger.tag(), reason);
                if automatic {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.policy.max_consecutive_failures && !self.paused {
                        self.paused = true;
                        warn!(
                            "Auto-tuning paused after {} consecutive failures",
                            self.consecutive_failures
                        );
                    }
                }
            }
        }

        self.history.push_back(decision.clone());
        while self.history.len() > self.policy.history_limit.max(1) {
            self.history.pop_front();
        }
    }

    /// Forget history and cooldowns; the enabled flag comes back from configuration
    pub fn reset(&mut self) {
        *self = Self::new(self.policy.clone(), self.worker_limit, self.recommended_workers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tunebridge_core::AudioConfig;

    struct Fixture {
        buffer: AdaptiveBufferManager,
        pool: WorkerPool,
        tuner: AutoTuner,
        _frames: mpsc::Receiver<crate::workers::AudioFrame>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(1);
            Self {
                buffer: AdaptiveBufferManager::new(&AudioConfig::default()),
                pool: WorkerPool::new(2, tx),
                tuner: AutoTuner::new(TuningConfig::default(), 4, 3),
                _frames: rx,
            }
        }

        fn apply(&mut self, trigger: TuningTrigger, deltas: Vec<Optimization>) -> Option<TuningDecision> {
            let mut targets = TuningTargets {
                buffer: &mut self.buffer,
                pool: &mut self.pool,
            };
            self.tuner.apply_optimization(trigger, deltas, &mut targets, Instant::now())
        }

        fn context(&mut self) -> TuningContext {
            let targets = TuningTargets {
                buffer: &mut self.buffer,
                pool: &mut self.pool,
            };
            self.tuner.context(&targets, NetworkQuality::Good)
        }
    }

    const AUTO: TuningTrigger = TuningTrigger::Auto(TuningCondition::BufferUnderruns);

    #[test]
    fn test_increase_buffer_is_idempotent() {
        let mut fixture = Fixture::new();
        let delta = Optimization::IncreaseBuffer {
            new_min: 250,
            new_max: 600,
        };

        let first = fixture.apply(TuningTrigger::Manual, vec![delta.clone()]).unwrap();
        assert!(first.is_applied());
        let once = fixture.buffer.bounds();

        assert!(fixture.apply(TuningTrigger::Manual, vec![delta]).is_none());
        assert_eq!(fixture.buffer.bounds(), once);
        assert_eq!(once, (250, 600));
        assert_eq!(fixture.buffer.current_ms(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_gates_every_condition() {
        let mut fixture = Fixture::new();
        assert!(fixture.tuner.should_trigger_auto_tuning(TuningCondition::HighCpu, Instant::now()));

        let delta = Optimization::SetWorkers { workers: 1 };
        fixture.apply(AUTO, vec![delta]).unwrap();

        tokio::time::advance(Duration::from_millis(29_000)).await;
        for condition in [
            TuningCondition::HighCpu,
            TuningCondition::HighMemory,
            TuningCondition::AudioDropouts,
            TuningCondition::PoorNetwork,
            TuningCondition::DeviceUnreliable,
        ] {
            assert!(!fixture.tuner.should_trigger_auto_tuning(condition, Instant::now()));
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(fixture.tuner.should_trigger_auto_tuning(TuningCondition::HighCpu, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_decisions_do_not_start_cooldown() {
        let mut fixture = Fixture::new();
        fixture.apply(TuningTrigger::Manual, vec![Optimization::SetWorkers { workers: 0 }]).unwrap();
        assert!(fixture.tuner.should_trigger_auto_tuning(TuningCondition::HighCpu, Instant::now()));
    }

    #[test]
    fn test_calculate_optimizations_has_no_side_effects() {
        let mut fixture = Fixture::new();
        let context = fixture.context();

        let candidates = fixture.tuner.calculate_optimizations(TuningCondition::HighCpu, &context);
        assert_eq!(
            candidates,
            vec![
                Optimization::SetWorkers { workers: 1 },
                Optimization::SetProcessingQuality {
                    quality: ProcessingQuality::Reduced
                },
            ]
        );
        assert_eq!(fixture.pool.workers(), 2);
        assert_eq!(fixture.tuner.history().count(), 0);

        let grow = fixture.tuner.calculate_optimizations(TuningCondition::BufferUnderruns, &context);
        assert_eq!(
            grow,
            vec![Optimization::IncreaseBuffer {
                new_min: 250,
                new_max: 600
            }]
        );

        let shrink = fixture.tuner.calculate_optimizations(TuningCondition::HighMemory, &context);
        assert_eq!(
            shrink[0],
            Optimization::ReduceBuffer {
                new_min: 150,
                new_max: 400
            }
        );
    }

    #[test]
    fn test_invalid_set_leaves_state_untouched() {
        let mut fixture = Fixture::new();
        let decision = fixture
            .apply(
                TuningTrigger::Manual,
                vec![
                    Optimization::SetProcessingQuality {
                        quality: ProcessingQuality::Reduced,
                    },
                    Optimization::IncreaseBuffer {
                        new_min: 700,
                        new_max: 300,
                    },
                ],
            )
            .unwrap();

        assert!(!decision.is_applied());
        assert_eq!(fixture.pool.quality(), ProcessingQuality::Full);
        assert_eq!(fixture.buffer.bounds(), (200, 500));
    }

    #[test]
    fn test_repeated_failures_pause_auto_tuning() {
        let mut fixture = Fixture::new();
        for _ in 0..3 {
            let decision = fixture.apply(AUTO, vec![Optimization::SetWorkers { workers: 9 }]).unwrap();
            assert!(!decision.is_applied());
        }

        assert!(fixture.tuner.is_paused());
        assert!(!fixture.tuner.should_trigger_auto_tuning(TuningCondition::HighCpu, Instant::now()));

        fixture.tuner.set_auto_tuning(true);
        assert!(!fixture.tuner.is_paused());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut fixture = Fixture::new();
        fixture.tuner.policy.history_limit = 3;

        for workers in [0, 1, 2, 3, 4, 0] {
            fixture.apply(TuningTrigger::Manual, vec![Optimization::SetWorkers { workers }]);
        }
        let ids: Vec<u64> = fixture.tuner.history().map(|d| d.id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }
}
