//! Self-tuning bridge runtime: adaptive buffering, monitoring, auto-tuning and the control task

pub mod buffer;
pub mod control;
pub mod events;
pub mod monitor;
pub mod sampler;
pub mod tuner;
pub mod workers;

pub use buffer::{AdaptiveBufferManager, BufferAdjustment, BufferPolicy, BufferState};
pub use control::{BridgeHandle, BridgeRuntime};
pub use events::{AirPlayEvent, BridgeEvent, BridgeStatus, ServiceRequest, ServiceResponse};
pub use monitor::{
    performance_score, DeviceUpdate, HealthStatus, HealthTransition, PerformanceMonitor, ReliabilityChange,
};
pub use sampler::ProcSampler;
pub use tuner::{AutoTuner, TuningContext, TuningTargets};
pub use workers::{compute_optimal_workers, detect_profile, AudioFrame, WorkerPool};
