//! The control task
//!
//! One task owns the buffer manager, monitor, tuner, worker pool and device registry.
//! Everything else talks to it through [`BridgeHandle`]. Discovery, diagnostics and
//! compatibility runs are spawned and report back as messages.

use crate::buffer::{AdaptiveBufferManager, BufferAdjustment};
use crate::events::{AirPlayEvent, BridgeEvent, BridgeStatus, ControlMessage, Reply, ServiceRequest, ServiceResponse};
use crate::monitor::{DeviceUpdate, PerformanceMonitor, ReliabilityChange};
use crate::tuner::{AutoTuner, TuningTargets};
use crate::workers::{AudioFrame, WorkerPool};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};
use tunebridge_core::{
    BridgeConfig, BridgeError, DeviceId, DiscoveryMethod, Optimization, ProcessingQuality, ResourceSampler, Severity,
    SpeakerClient, SystemCapabilityProfile, TuningCondition, TuningTrigger,
};
use tunebridge_discovery::{
    CompatibilityReport, CompatibilityTester, DeviceRegistry, DiagnosticsReport, DiscoveryEngine, DiscoveryReport,
    NetworkDiagnostics,
};

const CONTROL_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 512;

/// Cloneable handle to a running control task
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<ControlMessage>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn airplay_event(&self, event: AirPlayEvent) -> Result<()> {
        self.send(ControlMessage::AirPlay(event)).await
    }

    pub async fn submit_frame(&self, frame: AudioFrame) -> Result<()> {
        self.send(ControlMessage::Frame(frame)).await
    }

    /// Issue a service call and wait for its answer
    pub async fn request(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let (reply, answer) = oneshot::channel();
        self.send(ControlMessage::Service {
            request,
            reply: Some(reply),
        })
        .await?;
        answer.await.map_err(|_| anyhow!("control task dropped the request"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlMessage::Shutdown).await
    }

    async fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("control task is not running"))
    }
}

pub struct BridgeRuntime {
    config: BridgeConfig,
    profile: SystemCapabilityProfile,
    registry: DeviceRegistry,
    buffer: AdaptiveBufferManager,
    monitor: PerformanceMonitor,
    tuner: AutoTuner,
    pool: WorkerPool,
    sampler: Box<dyn ResourceSampler>,
    engine: DiscoveryEngine,
    diagnostics: Arc<NetworkDiagnostics>,
    rx: mpsc::Receiver<ControlMessage>,
    /// Weak so the loop ends once every external handle is gone
    self_tx: mpsc::WeakSender<ControlMessage>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeRuntime {
    /// Build the runtime and its handle; `config` is expected to be validated
    pub fn new(
        config: BridgeConfig,
        client: Arc<dyn SpeakerClient>,
        sampler: Box<dyn ResourceSampler>,
        profile: SystemCapabilityProfile,
        audio_out: mpsc::Sender<AudioFrame>,
    ) -> (Self, BridgeHandle) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        let mut registry = DeviceRegistry::new();
        registry.add_manual(&config.devices.manual, Instant::now());

        let worker_limit = if profile.worker_support { config.performance.max_workers } else { 0 };
        let diagnostics = NetworkDiagnostics::new(config.network.clone(), config.basic.ports.clone(), timeout_of(&config));

        let runtime = Self {
            registry,
            buffer: AdaptiveBufferManager::new(&config.audio),
            monitor: PerformanceMonitor::new(config.tuning.clone()),
            tuner: AutoTuner::new(config.tuning.clone(), worker_limit, profile.recommended_workers),
            pool: WorkerPool::new(profile.recommended_workers, audio_out),
            sampler,
            engine: DiscoveryEngine::new(client, config.discovery.clone()),
            diagnostics: Arc::new(diagnostics),
            rx,
            self_tx: tx.downgrade(),
            events: events.clone(),
            profile,
            config,
        };
        (runtime, BridgeHandle { tx, events })
    }

    pub fn status(&self) -> BridgeStatus {
        let score = self.monitor.calculate_overall_performance_score();
        BridgeStatus {
            buffer: self.buffer.state().clone(),
            workers: self.pool.workers(),
            processing_quality: self.pool.quality(),
            dropped_frames: self.pool.dropped_frames(),
            failed_samples: self.monitor.failed_samples(),
            snapshot: self.monitor.snapshot().clone(),
            performance_score: score,
            health: self.monitor.health_status(),
            auto_tuning: self.tuner.is_enabled(),
            auto_tuning_paused: self.tuner.is_paused(),
            devices: self.registry.records(),
            last_decision: self.tuner.last_decision().cloned(),
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Bridge runtime started: buffer {}ms, {} worker(s), {} manual device(s)",
            self.buffer.current_ms(),
            self.pool.workers(),
            self.registry.len()
        );

        let mut ticker = interval(Duration::from_millis(self.config.performance.sample_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovery_timer = periodic(self.config.discovery.interval_secs);
        let mut diagnostics_timer = periodic(self.config.network.diagnostics_interval_secs);

        // Disabled rounds only run on request
        if discovery_timer.is_some() {
            self.spawn_discovery(None, None);
        }
        if diagnostics_timer.is_some() {
            self.spawn_diagnostics(None);
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Instant::now()),
                _ = next_tick(&mut discovery_timer) => self.spawn_discovery(None, None),
                _ = next_tick(&mut diagnostics_timer) => self.spawn_diagnostics(None),
                message = self.rx.recv() => match message {
                    Some(ControlMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message, Instant::now()),
                },
            }
        }
        info!("Bridge runtime stopped");
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// One sampling period: metrics, eviction, pending buffer pressure, tuning
    pub fn tick(&mut self, now: Instant) {
        match self.sampler.sample() {
            Ok(reading) => {
                self.monitor.set_device_metrics(self.registry.metrics());
                if let Some(transition) = self.monitor.record_sample(reading) {
                    let severity = if transition.is_decline() { Severity::Medium } else { Severity::Info };
                    self.emit(BridgeEvent::notify(
                        severity,
                        format!("health {} -> {}", transition.from.as_str(), transition.to.as_str()),
                    ));
                }
                self.auto_tune(now);
                self.emit_metrics();
            }
            Err(e) => {
                let error = self.monitor.record_sample_failure(e);
                self.emit(BridgeEvent::fault(&error, Severity::Low));
            }
        }

        let window = Duration::from_secs(self.config.devices.silence_window_secs);
        for id in self.registry.evict_stale(now, window) {
            self.emit(BridgeEvent::DeviceEvicted { id });
        }

        self.adjust_buffer(now);
    }

    fn emit_metrics(&self) {
        let snapshot = self.monitor.snapshot();
        let score = self.monitor.calculate_overall_performance_score();

        self.emit(BridgeEvent::metric("cpu_percent", snapshot.cpu_percent));
        self.emit(BridgeEvent::metric("memory_percent", snapshot.memory_percent));
        self.emit(BridgeEvent::metric("audio_quality", snapshot.audio_quality));
        self.emit(BridgeEvent::metric("dropouts", snapshot.dropout_count));
        self.emit(BridgeEvent::metric("buffer_ms", self.buffer.current_ms()));
        self.emit(BridgeEvent::metric("workers", self.pool.workers() as u64));
        self.emit(BridgeEvent::metric("dropped_frames", self.pool.dropped_frames()));
        self.emit(BridgeEvent::metric("performance_score", score));
        self.emit(BridgeEvent::metric("network_quality", snapshot.network_quality.as_str()));
        self.emit(BridgeEvent::metric("device_count", self.registry.len() as u64));
        self.emit(BridgeEvent::Health {
            status: self.monitor.health_status(),
            score,
        });
    }

    fn adjust_buffer(&mut self, now: Instant) {
        match self.buffer.adjust(now) {
            BufferAdjustment::Increased { to, .. } | BufferAdjustment::Decreased { to, .. } => {
                self.emit(BridgeEvent::metric("buffer_ms", to));
            }
            BufferAdjustment::Suppressed | BufferAdjustment::NoChange => {}
        }
    }

    /// Try the detected conditions worst first until one decision is made
    fn auto_tune(&mut self, now: Instant) {
        let mut conditions: Vec<TuningCondition> = self
            .monitor
            .detect_issues()
            .iter()
            .filter(|issue| issue.severity >= Severity::Medium)
            .map(|issue| issue.kind.condition())
            .collect();
        if conditions.is_empty() && self.monitor.calculate_overall_performance_score() < 50.0 {
            conditions.push(TuningCondition::LowPerformance);
        }

        for condition in conditions {
            if !self.tuner.should_trigger_auto_tuning(condition, now) {
                return;
            }
            if self.apply(TuningTrigger::Auto(condition), None, now) {
                return;
            }
        }
    }

    /// Compute (or take) deltas and apply them; true when a decision was recorded
    fn apply(&mut self, trigger: TuningTrigger, deltas: Option<Vec<Optimization>>, now: Instant) -> bool {
        self.apply_decision(trigger, deltas, now).is_some()
    }

    fn apply_decision(
        &mut self,
        trigger: TuningTrigger,
        deltas: Option<Vec<Optimization>>,
        now: Instant,
    ) -> Option<tunebridge_core::TuningDecision> {
        let network_quality = self.monitor.snapshot().network_quality;
        let was_paused = self.tuner.is_paused();

        let mut targets = TuningTargets {
            buffer: &mut self.buffer,
            pool: &mut self.pool,
        };
        let deltas = match (deltas, trigger) {
            (Some(deltas), _) => deltas,
            (None, TuningTrigger::Auto(condition)) => {
                let context = self.tuner.context(&targets, network_quality);
                self.tuner.calculate_optimizations(condition, &context)
            }
            (None, TuningTrigger::Manual) => return None,
        };
        let decision = self.tuner.apply_optimization(trigger, deltas, &mut targets, now)?;

        self.emit(BridgeEvent::Tuning {
            decision: decision.clone(),
        });
        if !was_paused && self.tuner.is_paused() {
            self.emit(BridgeEvent::notify(
                Severity::High,
                "auto-tuning paused after repeated failures",
            ));
        }
        Some(decision)
    }

    fn handle(&mut self, message: ControlMessage, now: Instant) {
        match message {
            ControlMessage::AirPlay(event) => self.handle_airplay(event, now),
            ControlMessage::Frame(frame) => {
                if let Err(e) = self.pool.dispatch(frame) {
                    debug!("Dropping audio frame: {}", e);
                }
            }
            ControlMessage::Service { request, reply } => self.handle_service(request, reply, now),
            ControlMessage::DiscoveryFinished { report, reply } => self.finish_discovery(report, reply, now),
            ControlMessage::DiagnosticsFinished { report, reply } => self.finish_diagnostics(report, reply),
            ControlMessage::CompatibilityFinished { reports, reply } => self.finish_compatibility(reports, reply, now),
            ControlMessage::Shutdown => {}
        }
    }

    fn handle_airplay(&mut self, event: AirPlayEvent, now: Instant) {
        match event {
            AirPlayEvent::DeviceConnected { host, name } => {
                let ids = self.registry.ids_for_host(&host);
                if ids.is_empty() {
                    debug!("Connection from unregistered host {}", host);
                }
                for id in ids {
                    if let Some(record) = self.registry.get_mut(&id) {
                        record.touch(now);
                        if record.name.is_none() {
                            record.name = name.clone();
                        }
                    }
                    self.update_device(&id, DeviceUpdate::Connected, now);
                }
            }
            AirPlayEvent::DeviceDisconnected { host } => {
                for id in self.registry.ids_for_host(&host) {
                    self.update_device(&id, DeviceUpdate::Error, now);
                }
            }
            AirPlayEvent::AudioQualityChange { quality_score, dropouts } => {
                self.monitor.record_audio_quality(quality_score, dropouts);
            }
            AirPlayEvent::BufferUnderrun { device } => {
                debug!("Buffer underrun on {}", device.as_deref().unwrap_or("bridge"));
                self.buffer.record_underrun();
                self.monitor.record_underrun();
                self.adjust_buffer(now);
            }
            AirPlayEvent::BufferOverrun { device } => {
                debug!("Buffer overrun on {}", device.as_deref().unwrap_or("bridge"));
                self.buffer.record_overrun();
                self.adjust_buffer(now);
            }
        }
    }

    fn update_device(&mut self, id: &DeviceId, update: DeviceUpdate, now: Instant) {
        let Some(record) = self.registry.get_mut(id) else {
            return;
        };
        let Some(change) = self.monitor.update_device_metrics(record, update, now) else {
            return;
        };
        let name = record.display_name();

        match change {
            ReliabilityChange::BecameUnreliable { reliability } => {
                self.emit(BridgeEvent::notify(
                    Severity::Medium,
                    format!("device unreliable: {} (reliability {:.0})", name, reliability),
                ));
                let condition = TuningCondition::DeviceUnreliable;
                if self.tuner.should_trigger_auto_tuning(condition, now) {
                    self.apply(TuningTrigger::Auto(condition), None, now);
                }
            }
            ReliabilityChange::Recovered { reliability } => {
                self.emit(BridgeEvent::notify(
                    Severity::Info,
                    format!("device recovered: {} (reliability {:.0})", name, reliability),
                ));
            }
        }
    }

    fn handle_service(&mut self, request: ServiceRequest, reply: Option<Reply>, now: Instant) {
        info!("Service call: {:?}", request);
        match request {
            ServiceRequest::Restart => {
                self.restart();
                respond(reply, ServiceResponse::Done);
            }
            ServiceRequest::ForceScan { methods } => self.spawn_discovery(methods, reply),
            ServiceRequest::AdjustBufferBounds { min_ms, max_ms } => {
                let delta = if max_ms >= self.buffer.bounds().1 {
                    Optimization::IncreaseBuffer {
                        new_min: min_ms,
                        new_max: max_ms,
                    }
                } else {
                    Optimization::ReduceBuffer {
                        new_min: min_ms,
                        new_max: max_ms,
                    }
                };
                let decision = self.apply_decision(TuningTrigger::Manual, Some(vec![delta]), now);
                respond(reply, ServiceResponse::Decision { decision });
            }
            ServiceRequest::RunDiagnostics => self.spawn_diagnostics(reply),
            ServiceRequest::TestCompatibility { targets, verify } => self.spawn_compatibility(targets, verify, reply),
            ServiceRequest::SetAutoTuning { enabled } => {
                self.tuner.set_auto_tuning(enabled);
                respond(reply, ServiceResponse::Done);
            }
            ServiceRequest::Status => {
                respond(
                    reply,
                    ServiceResponse::Status {
                        status: Box::new(self.status()),
                    },
                );
            }
        }
    }

    fn restart(&mut self) {
        self.buffer.reset(&self.config.audio);
        self.monitor.reset();
        self.tuner.reset();
        self.pool.resize(self.profile.recommended_workers);
        self.pool.set_quality(ProcessingQuality::Full);
        self.emit(BridgeEvent::notify(Severity::Info, "bridge restarted"));
    }

    fn spawn_discovery(&self, methods: Option<Vec<DiscoveryMethod>>, reply: Option<Reply>) {
        let engine = self.engine.clone();
        let timeout = timeout_of(&self.config);
        let back = self.self_tx.clone();

        tokio::spawn(async move {
            let report = match methods {
                Some(methods) => engine.discover(&methods, timeout).await,
                None => engine.discover_configured(timeout).await,
            };
            deliver(back, ControlMessage::DiscoveryFinished { report, reply }).await;
        });
    }

    fn finish_discovery(&mut self, report: DiscoveryReport, reply: Option<Reply>, now: Instant) {
        let summary = self.registry.merge(report.devices.clone(), now);
        for outcome in &report.outcomes {
            if let Some(error) = &outcome.error {
                let error = BridgeError::discovery(outcome.method.as_str(), error.as_str());
                self.emit(BridgeEvent::fault(&error, Severity::Low));
            }
        }
        self.emit(BridgeEvent::DevicesDiscovered {
            added: summary.added,
            updated: summary.updated,
            total: self.registry.len(),
            failed_methods: report.failed_methods(),
        });
        respond(reply, ServiceResponse::Discovery { report });
    }

    fn spawn_diagnostics(&self, reply: Option<Reply>) {
        let diagnostics = self.diagnostics.clone();
        let back = self.self_tx.clone();

        tokio::spawn(async move {
            let report = diagnostics.run_diagnostics().await;
            deliver(back, ControlMessage::DiagnosticsFinished { report, reply }).await;
        });
    }

    fn finish_diagnostics(&mut self, report: DiagnosticsReport, reply: Option<Reply>) {
        self.monitor.set_network_quality(report.quality);
        self.emit(BridgeEvent::Diagnostics { report: report.clone() });
        respond(reply, ServiceResponse::Diagnostics { report });
    }

    fn spawn_compatibility(&self, targets: Vec<DeviceId>, verify: bool, reply: Option<Reply>) {
        let manual: Vec<DeviceId> = self
            .registry
            .iter()
            .filter(|record| record.manual)
            .map(|record| record.id.clone())
            .collect();
        let tester = CompatibilityTester::new(self.engine.client(), timeout_of(&self.config), manual);
        let back = self.self_tx.clone();

        tokio::spawn(async move {
            let reports = tester.test_device_compatibility(&targets, verify).await;
            deliver(back, ControlMessage::CompatibilityFinished { reports, reply }).await;
        });
    }

    fn finish_compatibility(&mut self, reports: Vec<CompatibilityReport>, reply: Option<Reply>, now: Instant) {
        for report in reports.iter().filter(|r| !r.skipped) {
            if !self.registry.contains(&report.target) {
                continue;
            }
            match (report.passed("connectivity"), report.latency_ms) {
                (Some(true), Some(latency)) => {
                    self.update_device(&report.target, DeviceUpdate::Latency(latency), now);
                    self.update_device(&report.target, DeviceUpdate::Connected, now);
                }
                (Some(false), _) => {
                    let detail = report
                        .tests
                        .iter()
                        .find(|t| t.name == "connectivity")
                        .and_then(|t| t.detail.clone())
                        .unwrap_or_default();
                    let error = BridgeError::device(report.target.to_string(), detail);
                    self.emit(BridgeEvent::fault(&error, Severity::Low));
                    self.update_device(&report.target, DeviceUpdate::Error, now);
                }
                _ => {}
            }
        }
        respond(reply, ServiceResponse::Compatibility { reports });
    }
}

fn timeout_of(config: &BridgeConfig) -> Duration {
    Duration::from_secs(config.basic.timeout_secs)
}

fn respond(reply: Option<Reply>, response: ServiceResponse) {
    if let Some(reply) = reply {
        if reply.send(response).is_err() {
            debug!("Service caller went away before the reply");
        }
    }
}

async fn deliver(back: mpsc::WeakSender<ControlMessage>, message: ControlMessage) {
    match back.upgrade() {
        Some(tx) => {
            if tx.send(message).await.is_err() {
                debug!("Control task stopped before a result arrived");
            }
        }
        None => debug!("Control task stopped before a result arrived"),
    }
}

fn periodic(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

/// Tick a timer that may be disabled; a disabled timer never fires
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
