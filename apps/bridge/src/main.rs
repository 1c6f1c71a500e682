use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunebridge_core::{BridgeConfig, ConfigIssue, DeviceId, DiscoveryMethod, SpeakerClient};
use tunebridge_discovery::{CompatibilityTester, DiscoveryEngine, NetworkDiagnostics, UpnpDescriptionClient};
use tunebridge_runtime::{
    detect_profile, AirPlayEvent, AudioFrame, BridgeEvent, BridgeHandle, BridgeRuntime, ProcSampler, ServiceRequest,
};

#[derive(Parser, Debug)]
#[command(name = "tunebridge", version, about = "Self-tuning AirPlay bridge runtime")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Network timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted
    Run,
    /// Run one discovery round and print the report
    Discover {
        /// Methods to run (standard, ssdp, mdns, scan); defaults to the configured set
        #[arg(long = "method", value_parser = parse_method)]
        methods: Vec<DiscoveryMethod>,
    },
    /// Run network diagnostics and print the report
    Diagnose,
    /// Test compatibility of speakers given as host:port
    Check {
        #[arg(required = true)]
        targets: Vec<DeviceId>,
        /// Test manually configured speakers too
        #[arg(long)]
        verify: bool,
    },
}

fn parse_method(value: &str) -> std::result::Result<DiscoveryMethod, String> {
    DiscoveryMethod::ALL
        .into_iter()
        .find(|method| method.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown discovery method '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, mut issues, source) = load_config(cli.config.as_deref())?;
    if let Some(timeout) = cli.timeout {
        config.basic.timeout_secs = timeout;
        issues.extend(config.validate());
    }

    // Initialize logging
    let fallback = if cli.verbose || config.basic.verbose {
        "debug"
    } else {
        "info,tunebridge=debug"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &source {
        Some(path) => tracing::info!("Configuration: {}", path.display()),
        None => tracing::info!("No configuration file, using defaults"),
    }
    for ConfigIssue { field, message } in &issues {
        tracing::warn!("Config {}: {}", field, message);
    }

    let timeout = Duration::from_secs(config.basic.timeout_secs);
    let client: Arc<dyn SpeakerClient> =
        Arc::new(UpnpDescriptionClient::new(timeout).context("Failed to build speaker client")?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, client).await,
        Command::Discover { methods } => {
            let engine = DiscoveryEngine::new(client, config.discovery.clone());
            let report = if methods.is_empty() {
                engine.discover_configured(timeout).await
            } else {
                engine.discover(&methods, timeout).await
            };
            print_json(&report)
        }
        Command::Diagnose => {
            let diagnostics = NetworkDiagnostics::new(config.network.clone(), config.basic.ports.clone(), timeout);
            print_json(&diagnostics.run_diagnostics().await)
        }
        Command::Check { targets, verify } => {
            let manual = config
                .devices
                .manual
                .iter()
                .map(|device| DeviceId::new(device.host.clone(), device.port))
                .collect();
            let tester = CompatibilityTester::new(client, timeout, manual);
            print_json(&tester.test_device_compatibility(&targets, verify).await)
        }
    }
}

/// Explicit paths must load; the default location may be absent
fn load_config(explicit: Option<&Path>) -> Result<(BridgeConfig, Vec<ConfigIssue>, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let (config, issues) = load_file(path)?;
        return Ok((config, issues, Some(path.to_path_buf())));
    }

    let Some(path) = default_config_path() else {
        return Ok((BridgeConfig::default(), Vec::new(), None));
    };
    if !path.exists() {
        return Ok((BridgeConfig::default(), Vec::new(), None));
    }
    let (config, issues) = load_file(&path)?;
    Ok((config, issues, Some(path)))
}

/// Fatal load errors stop startup; the rest fall back to defaults with an issue
fn load_file(path: &Path) -> Result<(BridgeConfig, Vec<ConfigIssue>)> {
    match BridgeConfig::load(path) {
        Ok(loaded) => Ok(loaded),
        Err(e) if e.is_fatal() => Err(e).with_context(|| format!("Failed to load configuration from {}", path.display())),
        Err(e) => {
            let issue = ConfigIssue {
                field: e.category().to_string(),
                message: e.to_string(),
            };
            Ok((BridgeConfig::default(), vec![issue]))
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let dir = if cfg!(target_os = "macos") {
        dirs::home_dir()?.join("Library").join("Application Support").join("TuneBridge")
    } else {
        dirs::config_dir()?.join("tunebridge")
    };
    Some(dir.join("config.toml"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: BridgeConfig, client: Arc<dyn SpeakerClient>) -> Result<()> {
    tracing::info!("Starting TuneBridge");

    let profile = detect_profile(&config.performance);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(64);
    let (runtime, handle) = BridgeRuntime::new(config, client, Box::new(ProcSampler::new()), profile, audio_tx);

    tokio::spawn(drain_audio(audio_rx));
    tokio::spawn(forward_events(handle.subscribe()));
    tokio::spawn(read_commands(handle.clone()));
    let control = tokio::spawn(runtime.run());

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    handle.shutdown().await?;
    control.await.context("Control task panicked")?;
    Ok(())
}

/// Host integration stream: one JSON event per line on stdout
async fn forward_events(mut events: broadcast::Receiver<BridgeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event stream lagged, {} event(s) dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Host integration commands: JSON service calls or endpoint events, one per line on stdin
async fn read_commands(handle: BridgeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read command: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Ok(request) = serde_json::from_str::<ServiceRequest>(&line) {
            match handle.request(request).await {
                Ok(response) => match serde_json::to_string(&response) {
                    Ok(json) => println!("{}", json),
                    Err(e) => tracing::warn!("Failed to encode response: {}", e),
                },
                Err(e) => {
                    tracing::warn!("Service call failed: {}", e);
                    break;
                }
            }
        } else if let Ok(event) = serde_json::from_str::<AirPlayEvent>(&line) {
            if handle.airplay_event(event).await.is_err() {
                break;
            }
        } else {
            tracing::warn!("Ignoring unrecognized command: {}", line);
        }
    }
}

/// Conditioned audio has no local sink; it is counted and dropped
async fn drain_audio(mut frames: mpsc::Receiver<AudioFrame>) {
    let mut count: u64 = 0;
    while let Some(frame) = frames.recv().await {
        count += 1;
        tracing::trace!("Frame {} ({} samples at {} Hz)", count, frame.samples.len(), frame.sample_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_check_targets() {
        let cli = Cli::try_parse_from(["tunebridge", "--timeout", "3", "check", "192.168.1.20:1400", "--verify"]).unwrap();
        assert_eq!(cli.timeout, Some(3));
        match cli.command {
            Some(Command::Check { targets, verify }) => {
                assert_eq!(targets, vec![DeviceId::new("192.168.1.20", 1400)]);
                assert!(verify);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_method() {
        assert!(Cli::try_parse_from(["tunebridge", "discover", "--method", "bluetooth"]).is_err());
        let cli = Cli::try_parse_from(["tunebridge", "discover", "--method", "SSDP"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Discover { methods }) if methods == vec![DiscoveryMethod::Ssdp]));
    }

    #[test]
    fn test_missing_explicit_config_is_fatal() {
        let missing = std::env::temp_dir().join("tunebridge-does-not-exist.toml");
        let err = load_config(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("Configuration error"), "{:#}", err);
    }

    #[test]
    fn test_unparsable_config_is_fatal() {
        let path = std::env::temp_dir().join(format!("tunebridge-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "[basic\ntimeout_secs = ").unwrap();
        let result = load_file(&path);
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("Failed to load configuration"));
    }
}
