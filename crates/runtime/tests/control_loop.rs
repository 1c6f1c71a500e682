use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tunebridge_core::{
    BridgeConfig, DeviceDescription, DiscoveredDevice, DiscoveryMethod, ResourceReading, ResourceSampler,
    SpeakerClient,
};
use tunebridge_runtime::workers::build_profile;
use tunebridge_runtime::{
    AirPlayEvent, AudioFrame, BridgeEvent, BridgeRuntime, BridgeStatus, ServiceRequest, ServiceResponse,
};

struct LivingRoom;

#[async_trait]
impl SpeakerClient for LivingRoom {
    fn name(&self) -> &str {
        "living-room"
    }

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(vec![
            DiscoveredDevice::new("192.168.1.20", 1400, DiscoveryMethod::Standard).with_name("Living Room")
        ])
    }

    async fn probe(&self, _host: &str, _port: u16) -> Result<DeviceDescription> {
        Err(anyhow!("offline"))
    }
}

/// Counts discovery rounds and finds nothing
#[derive(Default)]
struct CountingClient {
    rounds: AtomicUsize,
}

#[async_trait]
impl SpeakerClient for CountingClient {
    fn name(&self) -> &str {
        "counting"
    }

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn probe(&self, _host: &str, _port: u16) -> Result<DeviceDescription> {
        Err(anyhow!("offline"))
    }
}

struct QuietHost;

impl ResourceSampler for QuietHost {
    fn sample(&mut self) -> Result<ResourceReading> {
        Ok(ResourceReading {
            cpu_percent: 5.0,
            memory_bytes: 512,
            memory_total_bytes: 8_192,
        })
    }
}

fn quiet_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.basic.timeout_secs = 1;
    config.discovery.methods = vec![DiscoveryMethod::Standard];
    config.discovery.interval_secs = 0;
    config.network.diagnostics_interval_secs = 0;
    config.tuning.auto_tuning = false;
    config
}

async fn status(handle: &tunebridge_runtime::BridgeHandle) -> BridgeStatus {
    match handle.request(ServiceRequest::Status).await.unwrap() {
        ServiceResponse::Status { status } => *status,
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_underruns_and_manual_bounds_through_handle() {
    let config = quiet_config();
    let profile = build_profile(4, 8_192, 4_096, &config.performance);
    let (audio_tx, _audio_rx) = mpsc::channel::<AudioFrame>(4);
    let (runtime, handle) = BridgeRuntime::new(config, Arc::new(LivingRoom), Box::new(QuietHost), profile, audio_tx);
    let task = tokio::spawn(runtime.run());

    for _ in 0..4 {
        handle
            .airplay_event(AirPlayEvent::BufferUnderrun { device: None })
            .await
            .unwrap();
    }
    let state = status(&handle).await;
    assert_eq!(state.buffer.current_ms, 250);
    assert_eq!(state.buffer.total_underruns, 4);

    let bounds = ServiceRequest::AdjustBufferBounds { min_ms: 250, max_ms: 600 };
    match handle.request(bounds.clone()).await.unwrap() {
        ServiceResponse::Decision { decision: Some(decision) } => assert!(decision.is_applied()),
        other => panic!("unexpected response {:?}", other),
    }
    match handle.request(bounds).await.unwrap() {
        ServiceResponse::Decision { decision } => assert!(decision.is_none()),
        other => panic!("unexpected response {:?}", other),
    }

    let state = status(&handle).await;
    assert_eq!((state.buffer.min_ms, state.buffer.max_ms), (250, 600));
    assert_eq!(state.last_decision.map(|d| d.id), Some(1));

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_forced_scan_registers_devices() {
    let config = quiet_config();
    let profile = build_profile(2, 8_192, 4_096, &config.performance);
    let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(4);
    let (runtime, handle) = BridgeRuntime::new(config, Arc::new(LivingRoom), Box::new(QuietHost), profile, audio_tx);
    let mut events = handle.subscribe();
    let task = tokio::spawn(runtime.run());

    let response = handle
        .request(ServiceRequest::ForceScan {
            methods: Some(vec![DiscoveryMethod::Standard]),
        })
        .await
        .unwrap();
    match response {
        ServiceResponse::Discovery { report } => assert_eq!(report.devices.len(), 1),
        other => panic!("unexpected response {:?}", other),
    }

    let state = status(&handle).await;
    assert_eq!(state.devices.len(), 1);
    assert_eq!(state.devices[0].name.as_deref(), Some("Living Room"));

    let mut saw_discovery = false;
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::DevicesDiscovered { total, .. } = event {
            saw_discovery |= total == 1;
        }
    }
    assert!(saw_discovery);

    handle
        .submit_frame(AudioFrame {
            device: None,
            sample_rate: 44_100,
            channels: 2,
            samples: vec![1.5, -1.5],
        })
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), audio_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.samples.len(), 2);

    drop(events);
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_audio_sink_does_not_block_service_calls() {
    let config = quiet_config();
    // Single core: no workers, frames are transformed inline
    let profile = build_profile(1, 8_192, 4_096, &config.performance);
    assert_eq!(profile.recommended_workers, 0);
    let (audio_tx, _audio_rx) = mpsc::channel::<AudioFrame>(1);
    let (runtime, handle) = BridgeRuntime::new(config, Arc::new(LivingRoom), Box::new(QuietHost), profile, audio_tx);
    let task = tokio::spawn(runtime.run());

    for i in 0..40 {
        handle
            .submit_frame(AudioFrame {
                device: None,
                sample_rate: 44_100,
                channels: 1,
                samples: vec![i as f32 / 100.0],
            })
            .await
            .unwrap();
    }

    let state = tokio::time::timeout(Duration::from_secs(5), status(&handle))
        .await
        .expect("control loop stopped answering");
    assert!(state.dropped_frames >= 6, "dropped {}", state.dropped_frames);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disabled_rounds_do_not_run_at_startup() {
    let config = quiet_config();
    let profile = build_profile(2, 8_192, 4_096, &config.performance);
    let client = Arc::new(CountingClient::default());
    let (audio_tx, _audio_rx) = mpsc::channel::<AudioFrame>(4);
    let (runtime, handle) = BridgeRuntime::new(config, client.clone(), Box::new(QuietHost), profile, audio_tx);
    let task = tokio::spawn(runtime.run());

    status(&handle).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.rounds.load(Ordering::SeqCst), 0);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_enabled_discovery_runs_once_at_startup() {
    let mut config = quiet_config();
    config.discovery.interval_secs = 300;
    let profile = build_profile(2, 8_192, 4_096, &config.performance);
    let client = Arc::new(CountingClient::default());
    let (audio_tx, _audio_rx) = mpsc::channel::<AudioFrame>(4);
    let (runtime, handle) = BridgeRuntime::new(config, client.clone(), Box::new(QuietHost), profile, audio_tx);
    let mut events = handle.subscribe();
    let task = tokio::spawn(runtime.run());

    let discovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(BridgeEvent::DevicesDiscovered { total, .. }) => return total,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(discovered, 0);
    assert_eq!(client.rounds.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
