//! Speaker discovery, compatibility testing and network diagnostics

pub mod client;
pub mod compatibility;
pub mod description;
pub mod diagnostics;
pub mod engine;
pub mod mdns;
pub mod net;
pub mod registry;
pub mod scan;
pub mod ssdp;

pub use client::UpnpDescriptionClient;
pub use compatibility::{CompatibilityReport, CompatibilityTester, SubTest};
pub use diagnostics::{CheckResult, CheckStatus, DiagnosticsReport, LatencyMeasurement, NetworkDiagnostics};
pub use engine::{DiscoveryEngine, DiscoveryReport, MethodOutcome};
pub use registry::{dedupe_by_priority, DeviceRegistry, MergeSummary};
