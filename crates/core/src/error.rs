//! Error taxonomy for the bridge runtime
//!
//! Per-device and per-probe errors are contained where they originate and surface
//! only through metrics and events. Only configuration errors with no usable default
//! are allowed to stop the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type shared by all bridge crates
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration document that cannot be read or parsed
    ///
    /// Out-of-range values are corrected during validation and never raise this.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single discovery method failed
    #[error("Discovery error ({method}): {message}")]
    Discovery { method: String, message: String },

    /// Timeout or refused connection while talking to a speaker
    #[error("Device communication error ({device}): {message}")]
    DeviceCommunication { device: String, message: String },

    /// Resource reading (CPU/memory) failed for this tick
    #[error("Resource sampling error: {0}")]
    ResourceSampling(String),

    /// A tuning delta was rejected before anything was mutated
    #[error("Tuning application error: {0}")]
    TuningApplication(String),
}

impl BridgeError {
    /// Short category tag used in event payloads
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::Discovery { .. } => "discovery",
            BridgeError::DeviceCommunication { .. } => "device_communication",
            BridgeError::ResourceSampling(_) => "resource_sampling",
            BridgeError::TuningApplication(_) => "tuning_application",
        }
    }

    /// Whether the error should stop the process
    ///
    /// Only an unusable configuration document qualifies. Everything else is
    /// contained where it happens and surfaces as events.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }

    pub fn discovery(method: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Discovery {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::DeviceCommunication {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Severity attached to notifications and detected issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}
