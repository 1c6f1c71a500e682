//! Messages into and out of the control task

use crate::buffer::BufferState;
use crate::monitor::HealthStatus;
use crate::workers::AudioFrame;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tunebridge_core::{
    BridgeError, DeviceId, DeviceRecord, DiscoveryMethod, MetricSnapshot, ProcessingQuality, Severity, TuningDecision,
};
use tunebridge_discovery::{CompatibilityReport, DiagnosticsReport, DiscoveryReport};

/// Notifications from the AirPlay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AirPlayEvent {
    DeviceConnected { host: String, name: Option<String> },
    DeviceDisconnected { host: String },
    AudioQualityChange { quality_score: Option<f64>, dropouts: u64 },
    BufferUnderrun { device: Option<String> },
    BufferOverrun { device: Option<String> },
}

/// Inbound service calls from the host integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum ServiceRequest {
    Restart,
    ForceScan { methods: Option<Vec<DiscoveryMethod>> },
    AdjustBufferBounds { min_ms: u32, max_ms: u32 },
    RunDiagnostics,
    TestCompatibility { targets: Vec<DeviceId>, verify: bool },
    SetAutoTuning { enabled: bool },
    Status,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ServiceResponse {
    Done,
    /// `None` when the requested change was already in effect
    Decision { decision: Option<TuningDecision> },
    Discovery { report: DiscoveryReport },
    Diagnostics { report: DiagnosticsReport },
    Compatibility { reports: Vec<CompatibilityReport> },
    Status { status: Box<BridgeStatus> },
}

pub type Reply = oneshot::Sender<ServiceResponse>;

/// Everything the control task consumes
#[derive(Debug)]
pub enum ControlMessage {
    AirPlay(AirPlayEvent),
    Frame(AudioFrame),
    Service { request: ServiceRequest, reply: Option<Reply> },
    DiscoveryFinished { report: DiscoveryReport, reply: Option<Reply> },
    DiagnosticsFinished { report: DiagnosticsReport, reply: Option<Reply> },
    CompatibilityFinished { reports: Vec<CompatibilityReport>, reply: Option<Reply> },
    Shutdown,
}

/// Outbound stream for the host integration
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Metric {
        key: String,
        value: serde_json::Value,
    },
    Health {
        status: HealthStatus,
        score: f64,
    },
    Notification {
        severity: Severity,
        message: String,
    },
    /// A contained failure, tagged with its error category
    Fault {
        category: String,
        severity: Severity,
        message: String,
    },
    Tuning {
        decision: TuningDecision,
    },
    DevicesDiscovered {
        added: usize,
        updated: usize,
        total: usize,
        failed_methods: Vec<DiscoveryMethod>,
    },
    DeviceEvicted {
        id: DeviceId,
    },
    Diagnostics {
        report: DiagnosticsReport,
    },
}

impl BridgeEvent {
    pub fn metric(key: &str, value: impl Into<serde_json::Value>) -> Self {
        BridgeEvent::Metric {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn notify(severity: Severity, message: impl Into<String>) -> Self {
        BridgeEvent::Notification {
            severity,
            message: message.into(),
        }
    }

    pub fn fault(error: &BridgeError, severity: Severity) -> Self {
        BridgeEvent::Fault {
            category: error.category().to_string(),
            severity,
            message: error.to_string(),
        }
    }
}

/// Point-in-time view of the whole runtime
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub buffer: BufferState,
    pub workers: usize,
    pub processing_quality: ProcessingQuality,
    /// Frames refused because the audio stage was saturated
    pub dropped_frames: u64,
    pub failed_samples: u64,
    pub snapshot: MetricSnapshot,
    pub performance_score: f64,
    pub health: HealthStatus,
    pub auto_tuning: bool,
    pub auto_tuning_paused: bool,
    pub devices: Vec<DeviceRecord>,
    pub last_decision: Option<TuningDecision>,
}
