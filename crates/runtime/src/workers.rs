//! Host capability profile, worker sizing and the audio transform pool

use crate::sampler::read_meminfo;
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use tunebridge_core::{PerformanceConfig, ProcessingQuality, SystemCapabilityProfile};

/// Memory pressure above which the worker count is halved
const HIGH_MEMORY_RATIO: f64 = 0.8;

/// Build the capability profile for this host
pub fn detect_profile(config: &PerformanceConfig) -> SystemCapabilityProfile {
    let cores = num_cpus::get();
    let (total, available) = match read_meminfo() {
        Ok(mem) => (mem.total_bytes, mem.available_bytes),
        Err(e) => {
            warn!("Memory totals unavailable: {}", e);
            (0, 0)
        }
    };
    let profile = build_profile(cores, total, available, config);
    info!(
        "Host profile: {} core(s), {:.0}% memory in use, {} worker(s) recommended",
        profile.cores,
        profile.memory_usage_ratio() * 100.0,
        profile.recommended_workers
    );
    profile
}

/// Assemble a profile from raw host facts
pub fn build_profile(cores: usize, total_memory: u64, available_memory: u64, config: &PerformanceConfig) -> SystemCapabilityProfile {
    let mut profile = SystemCapabilityProfile {
        cores,
        total_memory_bytes: total_memory,
        available_memory_bytes: available_memory,
        worker_support: config.worker_threads && cores > 1,
        recommended_workers: 0,
        recommended_buffer_min_ms: 200,
        recommended_buffer_max_ms: 500,
    };
    profile.recommended_workers = compute_optimal_workers(&profile, config.max_workers);

    // Small or memory-starved hosts need more slack
    if cores <= 2 || profile.memory_usage_ratio() > HIGH_MEMORY_RATIO {
        profile.recommended_buffer_min_ms = 300;
        profile.recommended_buffer_max_ms = 800;
    }
    profile
}

/// Worker count for the audio transform pool
///
/// Zero without worker support. Otherwise one fewer than the core count, halved
/// under memory pressure, capped at `max_workers`, and never below one while a
/// spare core exists.
pub fn compute_optimal_workers(profile: &SystemCapabilityProfile, max_workers: usize) -> usize {
    if !profile.worker_support {
        return 0;
    }

    let spare = profile.cores.saturating_sub(1);
    let mut workers = spare;
    if profile.memory_usage_ratio() > HIGH_MEMORY_RATIO {
        workers /= 2;
    }
    workers = workers.min(max_workers);

    if spare > 0 && max_workers > 0 {
        workers = workers.max(1);
    }
    workers
}

/// A block of decoded PCM handed over by the AirPlay endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

pub type Transform = Arc<dyn Fn(&mut AudioFrame, ProcessingQuality) + Send + Sync>;

/// Output conditioning applied to every frame
///
/// Full quality removes DC offset and soft-limits peaks; reduced quality only clamps.
pub fn condition_frame(frame: &mut AudioFrame, quality: ProcessingQuality) {
    match quality {
        ProcessingQuality::Full => {
            let channels = frame.channels.max(1) as usize;
            for channel in 0..channels {
                let values = frame.samples.iter().skip(channel).step_by(channels);
                let count = values.clone().count();
                if count == 0 {
                    continue;
                }
                let offset = values.sum::<f32>() / count as f32;
                for sample in frame.samples.iter_mut().skip(channel).step_by(channels) {
                    *sample = (*sample - offset).tanh();
                }
            }
        }
        ProcessingQuality::Reduced => {
            for sample in frame.samples.iter_mut() {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }
    }
}

/// Frames the stage accepts before `dispatch` starts dropping
const STAGE_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
struct StageSettings {
    workers: usize,
    quality: ProcessingQuality,
}

/// Pool running audio transforms off the control path
///
/// Frames pass through one stage task fed by a bounded queue. Up to `workers`
/// transforms run at once on the blocking pool and results leave in submission
/// order. With zero workers the stage transforms inline. Dispatch never waits:
/// a full queue drops the frame and counts it.
pub struct WorkerPool {
    settings: watch::Sender<StageSettings>,
    transform: Transform,
    output: mpsc::Sender<AudioFrame>,
    /// Started on first dispatch
    queue: Option<mpsc::Sender<AudioFrame>>,
    dropped: u64,
}

impl WorkerPool {
    pub fn new(workers: usize, output: mpsc::Sender<AudioFrame>) -> Self {
        Self::with_transform(workers, output, Arc::new(condition_frame))
    }

    pub fn with_transform(workers: usize, output: mpsc::Sender<AudioFrame>, transform: Transform) -> Self {
        let (settings, _) = watch::channel(StageSettings {
            workers,
            quality: ProcessingQuality::Full,
        });
        Self {
            settings,
            transform,
            output,
            queue: None,
            dropped: 0,
        }
    }

    pub fn workers(&self) -> usize {
        self.settings.borrow().workers
    }

    pub fn quality(&self) -> ProcessingQuality {
        self.settings.borrow().quality
    }

    /// Frames refused because the stage was saturated
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Takes effect for frames the stage has not started yet
    pub fn resize(&mut self, workers: usize) {
        let current = *self.settings.borrow();
        if workers == current.workers {
            return;
        }
        info!("Worker pool resized {} -> {}", current.workers, workers);
        self.settings.send_replace(StageSettings { workers, ..current });
    }

    pub fn set_quality(&mut self, quality: ProcessingQuality) {
        let current = *self.settings.borrow();
        if quality != current.quality {
            info!("Processing quality set to {:?}", quality);
            self.settings.send_replace(StageSettings { quality, ..current });
        }
    }

    /// Queue one frame for transformation without waiting
    pub fn dispatch(&mut self, frame: AudioFrame) -> Result<()> {
        if self.output.is_closed() {
            return Err(anyhow!("audio output closed"));
        }

        let queue = match self.queue.take() {
            Some(queue) if !queue.is_closed() => queue,
            _ => self.spawn_stage(),
        };
        let sent = queue.try_send(frame);
        self.queue = Some(queue);

        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Err(anyhow!("audio stage saturated, {} frame(s) dropped so far", self.dropped))
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("audio stage stopped")),
        }
    }

    fn spawn_stage(&self) -> mpsc::Sender<AudioFrame> {
        let (tx, rx) = mpsc::channel(STAGE_QUEUE);
        tokio::spawn(run_stage(
            rx,
            self.settings.subscribe(),
            self.transform.clone(),
            self.output.clone(),
        ));
        debug!("Audio stage started");
        tx
    }
}

async fn run_stage(
    mut input: mpsc::Receiver<AudioFrame>,
    settings: watch::Receiver<StageSettings>,
    transform: Transform,
    output: mpsc::Sender<AudioFrame>,
) {
    let mut in_flight: VecDeque<JoinHandle<AudioFrame>> = VecDeque::new();

    loop {
        let StageSettings { workers, quality } = *settings.borrow();
        let busy = !in_flight.is_empty();
        // Inline work waits for the pooled frames ahead of it
        let accepting = in_flight.len() < workers.max(1);

        tokio::select! {
            biased;
            done = next_done(&mut in_flight), if busy => {
                if let Some(done) = done {
                    if !forward(&output, done).await {
                        return;
                    }
                }
            }
            frame = input.recv(), if accepting => match frame {
                Some(mut frame) if workers == 0 => {
                    transform(&mut frame, quality);
                    if !forward(&output, Ok(frame)).await {
                        return;
                    }
                }
                Some(mut frame) => {
                    let transform = transform.clone();
                    in_flight.push_back(tokio::task::spawn_blocking(move || {
                        transform(&mut frame, quality);
                        frame
                    }));
                }
                None => break,
            },
        }
    }

    while let Some(done) = next_done(&mut in_flight).await {
        if !forward(&output, done).await {
            return;
        }
    }
    debug!("Audio stage stopped");
}

/// Wait for the oldest transform; `None` when nothing is in flight
async fn next_done(in_flight: &mut VecDeque<JoinHandle<AudioFrame>>) -> Option<Result<AudioFrame, JoinError>> {
    let oldest = in_flight.front_mut()?;
    let result = oldest.await;
    in_flight.pop_front();
    Some(result)
}

/// False once the output side is gone
async fn forward(output: &mpsc::Sender<AudioFrame>, done: Result<AudioFrame, JoinError>) -> bool {
    match done {
        Ok(frame) => {
            if output.send(frame).await.is_err() {
                debug!("Audio output closed, stopping stage");
                return false;
            }
        }
        Err(e) => warn!("Audio transform failed: {}", e),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn profile(cores: usize, usage_ratio: f64, support: bool) -> SystemCapabilityProfile {
        let total = 16_000_000_000u64;
        SystemCapabilityProfile {
            cores,
            total_memory_bytes: total,
            available_memory_bytes: (total as f64 * (1.0 - usage_ratio)) as u64,
            worker_support: support,
            recommended_workers: 0,
            recommended_buffer_min_ms: 200,
            recommended_buffer_max_ms: 500,
        }
    }

    #[test]
    fn test_workers_zero_without_support() {
        for cores in [1, 2, 8, 64] {
            for ratio in [0.0, 0.5, 0.95] {
                assert_eq!(compute_optimal_workers(&profile(cores, ratio, false), 4), 0);
            }
        }
    }

    #[test]
    fn test_memory_pressure_never_adds_workers() {
        let pressured = compute_optimal_workers(&profile(8, 0.9, true), 4);
        let relaxed = compute_optimal_workers(&profile(8, 0.5, true), 4);
        assert!(pressured <= relaxed);
        assert_eq!(relaxed, 4);
        assert_eq!(pressured, 3);
    }

    #[test]
    fn test_at_least_one_worker_with_spare_core() {
        assert_eq!(compute_optimal_workers(&profile(2, 0.95, true), 4), 1);
        assert_eq!(compute_optimal_workers(&profile(1, 0.1, true), 4), 0);
    }

    #[test]
    fn test_build_profile() {
        let config = PerformanceConfig::default();
        let small = build_profile(2, 4_000, 1_000, &config);
        assert!(small.worker_support);
        assert_eq!(small.recommended_workers, 1);
        assert_eq!(small.recommended_buffer_min_ms, 300);

        let single = build_profile(1, 4_000, 3_000, &config);
        assert!(!single.worker_support);
        assert_eq!(single.recommended_workers, 0);
    }

    #[test]
    fn test_condition_frame() {
        let mut frame = AudioFrame {
            device: None,
            sample_rate: 44_100,
            channels: 1,
            samples: vec![0.5, 0.5, 0.5, 0.5],
        };
        condition_frame(&mut frame, ProcessingQuality::Full);
        assert!(frame.samples.iter().all(|s| s.abs() < 1e-6));

        frame.samples = vec![2.0, -3.0, 0.25];
        condition_frame(&mut frame, ProcessingQuality::Reduced);
        assert_eq!(frame.samples, vec![1.0, -1.0, 0.25]);
    }

    fn tagged(tag: f32) -> AudioFrame {
        AudioFrame {
            device: Some("kitchen".to_string()),
            sample_rate: 48_000,
            channels: 1,
            samples: vec![tag],
        }
    }

    #[tokio::test]
    async fn test_inline_and_pooled_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transform: Transform = Arc::new(move |frame: &mut AudioFrame, _quality: ProcessingQuality| {
            counter.fetch_add(1, Ordering::SeqCst);
            frame.samples.push(0.0);
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut pool = WorkerPool::with_transform(0, tx, transform);

        pool.dispatch(tagged(1.0)).unwrap();
        assert_eq!(rx.recv().await.unwrap().samples.len(), 2);

        pool.resize(2);
        pool.dispatch(tagged(2.0)).unwrap();
        assert_eq!(rx.recv().await.unwrap().samples.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn test_slow_frame_does_not_get_overtaken() {
        // The first frame takes far longer than the second
        let transform: Transform = Arc::new(|frame: &mut AudioFrame, _quality: ProcessingQuality| {
            if frame.samples[0] == 0.0 {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut pool = WorkerPool::with_transform(2, tx, transform);

        for tag in [0.0, 1.0, 2.0] {
            pool.dispatch(tagged(tag)).unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap().samples[0]);
        }
        assert_eq!(order, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_stalled_output_drops_instead_of_waiting() {
        // Nobody reads the output, and the stage never runs before the loop ends
        let (tx, _rx) = mpsc::channel(1);
        let mut pool = WorkerPool::with_transform(0, tx, Arc::new(|_: &mut AudioFrame, _: ProcessingQuality| {}));

        let refused = (0..STAGE_QUEUE + 8)
            .map(|i| pool.dispatch(tagged(i as f32)))
            .filter(|result| result.is_err())
            .count();
        assert_eq!(refused, 8);
        assert_eq!(pool.dropped_frames(), 8);
    }

    #[tokio::test]
    async fn test_closed_output_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        let mut pool = WorkerPool::new(1, tx);
        drop(rx);
        assert!(pool.dispatch(tagged(0.5)).is_err());
        assert_eq!(pool.dropped_frames(), 0);
    }
}
